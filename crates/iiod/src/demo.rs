//! Built-in context served when no XML description is configured.

use iio_model::{Attr, AttrOwner, Channel, Context, Device, Direction, Result};

use crate::memory::MemoryBackend;

fn scan(id: &str, dir: Direction, index: i64, format: &str) -> Result<Channel> {
    let mut chn = Channel::new(id, dir).with_scan_element(index, format.parse()?);
    chn.attrs.insert(Attr::new("raw"))?;
    chn.attrs.insert(Attr::new("scale"))?;
    Ok(chn)
}

/// A transceiver-like context: one RX converter with two channels and a
/// temperature sensor, one TX converter with two channels, and a trigger.
pub fn demo_context() -> Result<Context> {
    let mut ctx = Context::new("memory");
    ctx.description = Some("iiod in-memory demo".into());
    ctx.add_attr("hw_model", "iiod demo board")?;
    ctx.add_attr("local,kernel", "6.6.0")?;

    let mut rx = Device::new("iio:device0").with_name("demo-adc");
    rx.add_channel(scan("voltage0", Direction::Input, 0, "le:S12/16>>0")?);
    rx.add_channel(scan("voltage1", Direction::Input, 1, "le:S12/16>>0")?);
    let mut temp = Channel::new("temp0", Direction::Input);
    temp.attrs.insert(Attr::new("input"))?;
    rx.add_channel(temp);
    for name in [
        "calibphase",
        "calibscale",
        "enable",
        "sampling_frequency",
        "sampling_frequency_available",
    ] {
        rx.attrs.insert(Attr::new(name))?;
    }
    rx.buffer_attrs.insert(Attr::new("length_align_bytes"))?;
    rx.buffer_attrs.insert(Attr::new("watermark"))?;
    rx.debug_attrs.insert(Attr::new("direct_reg_access"))?;
    rx.debug_attrs.insert(Attr::new("loopback"))?;
    ctx.add_device(rx)?;

    let mut tx = Device::new("iio:device1").with_name("demo-dac");
    tx.add_channel(scan("voltage0", Direction::Output, 0, "le:S16/16>>0")?);
    tx.add_channel(scan("voltage1", Direction::Output, 1, "le:S16/16>>0")?);
    tx.attrs.insert(Attr::new("sampling_frequency"))?;
    tx.buffer_attrs.insert(Attr::new("length_align_bytes"))?;
    ctx.add_device(tx)?;

    ctx.add_device(Device::new("trigger0").with_name("sysfstrig0"))?;
    Ok(ctx)
}

/// The demo context behind a memory backend with plausible values.
pub fn demo_backend() -> Result<MemoryBackend> {
    let backend = MemoryBackend::new(demo_context()?);
    let rx = AttrOwner::Device(0);

    backend.seed(rx, "calibphase", "0\n");
    backend.seed(rx, "calibscale", "1.000000\n");
    backend.seed(rx, "enable", "0\n");
    backend.seed(rx, "sampling_frequency", &b"250000000\n\0\0"[..]);
    backend.seed(rx, "sampling_frequency_available", "[2083333 1 61440000]\n");
    backend.seed(AttrOwner::Buffer { dev: 0, buffer: 0 }, "length_align_bytes", "8\n");
    backend.seed(AttrOwner::Buffer { dev: 0, buffer: 0 }, "watermark", "2048\n");
    backend.seed(AttrOwner::Debug(0), "direct_reg_access", "0x0\n");
    backend.seed(AttrOwner::Debug(0), "loopback", "0\n");
    backend.seed(AttrOwner::Device(1), "sampling_frequency", "61440000\n");

    for chn in 0..2 {
        let owner = AttrOwner::Channel { dev: 0, chn };
        backend.seed(owner, "raw", "0\n");
        backend.seed(owner, "scale", "0.244140625\n");
    }
    backend.seed(AttrOwner::Channel { dev: 0, chn: 2 }, "input", "42500\n");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use iio_model::AttrRef;

    #[test]
    fn test_demo_layout() {
        let ctx = demo_context().unwrap();
        assert_eq!(ctx.devices().len(), 3);
        assert_eq!(ctx.device(0).unwrap().id, "iio:device0");
        assert!(ctx.device(2).unwrap().is_trigger());
        let rx = ctx.device(0).unwrap();
        assert_eq!(rx.attrs.find("sampling_frequency"), Some(3));
        assert_eq!(rx.attrs.find("enable"), Some(2));
        assert_eq!(rx.channel(2).unwrap().id, "temp0");
    }

    #[tokio::test]
    async fn test_demo_values() {
        let backend = demo_backend().unwrap();
        let value = backend
            .read_attr(AttrRef::new(AttrOwner::Device(0), 3))
            .await
            .unwrap();
        assert_eq!(value, b"250000000\n\0\0");
    }
}
