//! Reference exchanges between a client and the daemon: attribute reads
//! and writes, an RX block ring, cyclic TX, cancellation, and the XML
//! compression fallback.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use iio_client::{create_context, ClientConfig, IioContext};
    use iio_model::attr::value_text;
    use iio_model::{AttrOwner, AttrRef, ChannelsMask, Error};
    use iio_transport::{pack_code, Opcode};
    use iiod::{rx_pattern, Backend};

    use crate::harness::{write_payload, TcpDaemon, TestDaemon};

    #[tokio::test]
    async fn test_attribute_read() {
        let td = TestDaemon::new().unwrap();
        let io = td.raw().create_io().unwrap();
        let resp = io
            .exec_command(Opcode::ReadAttr, 0, pack_code(3, 0), Vec::new(), 64)
            .await
            .unwrap();
        assert_eq!(resp.code, 12);
        assert_eq!(resp.data, b"250000000\n\0\0");
        assert_eq!(value_text(&resp.data), "250000000");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let td = TestDaemon::new().unwrap();
        let responder = td.raw();
        let enable = td
            .backend
            .context()
            .find_attr(AttrOwner::Device(0), "enable")
            .unwrap();
        let code = pack_code(enable.index as u16, 0);

        let io = responder.create_io().unwrap();
        let written = io
            .exec_command(Opcode::WriteAttr, 0, code, write_payload(b"1\0"), 0)
            .await
            .unwrap();
        assert_eq!(written.code, 2);

        let read = io
            .exec_command(Opcode::ReadAttr, 0, code, Vec::new(), 64)
            .await
            .unwrap();
        assert_eq!(read.data, b"1\n");
    }

    #[tokio::test]
    async fn test_rx_ring_of_four_blocks() {
        const SIZE: usize = 4096;
        let td = TestDaemon::new().unwrap();
        let responder = td.raw();

        let setup = responder.create_io().unwrap();
        let mask = ChannelsMask::from_bits(3, 0x3);
        let resp = setup
            .exec_command(
                Opcode::CreateBuffer,
                0,
                0,
                vec![Bytes::from(mask.to_le_bytes())],
                mask.wire_size(),
            )
            .await
            .unwrap();
        assert_eq!(ChannelsMask::from_le_bytes(3, &resp.data).unwrap(), mask);

        let mut blocks = Vec::new();
        for idx in 0..4u16 {
            let io = responder.create_io().unwrap();
            io.exec_command(
                Opcode::CreateBlock,
                0,
                pack_code(idx, 0),
                vec![Bytes::copy_from_slice(&(SIZE as u64).to_le_bytes())],
                0,
            )
            .await
            .unwrap();
            blocks.push(io);
        }

        let enqueue = |idx: u16| {
            let io = &blocks[usize::from(idx)];
            io.get_response_async(SIZE).unwrap();
            io.send_command_async(
                Opcode::TransferBlock,
                0,
                pack_code(idx, 0),
                vec![Bytes::copy_from_slice(&(SIZE as u64).to_le_bytes())],
            )
            .unwrap();
        };
        for idx in 1..4 {
            enqueue(idx);
        }
        setup
            .exec_simple_command(Opcode::EnableBuffer, 0, 0)
            .await
            .unwrap();
        enqueue(0);

        // samples are handed out in enqueue order
        for (n, idx) in [1usize, 2, 3, 0].into_iter().enumerate() {
            let resp = blocks[idx].wait_for_response().await.unwrap();
            assert_eq!(resp.code, SIZE as i32);
            assert_eq!(resp.data, rx_pattern((n * SIZE) as u64, SIZE));
        }
    }

    #[tokio::test]
    async fn test_cyclic_tx() {
        let td = TestDaemon::new().unwrap();
        let client = td.client().await.unwrap();
        let buf = client
            .create_buffer(1, 0, &ChannelsMask::from_bits(2, 0x1))
            .await
            .unwrap();
        let mut first = buf.create_block(4096).await.unwrap();
        let mut second = buf.create_block(4096).await.unwrap();
        for (i, b) in first.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }

        first.enqueue(4096, true).await.unwrap();
        first.dequeue(false).await.unwrap();
        second.enqueue(0, true).await.unwrap();
        assert_eq!(second.dequeue(false).await, Err(Error::Busy));

        buf.disable().await.unwrap();
        second.enqueue(0, true).await.unwrap();
        second.dequeue(false).await.unwrap();

        let played = td.backend.tx_data(1);
        assert_eq!(played.len(), 2);
        assert_eq!(played[0], first.data());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiter() {
        let td = TestDaemon::new().unwrap();
        let responder = td.raw();
        responder.set_timeout(0);
        let freq = td
            .backend
            .context()
            .find_attr(AttrOwner::Device(1), "sampling_frequency")
            .unwrap();
        td.backend.stall(freq);

        let io = responder.create_io().unwrap();
        io.get_response_async(64).unwrap();
        io.send_command(Opcode::ReadAttr, 1, pack_code(freq.index as u16, 0), Vec::new())
            .await
            .unwrap();
        let waiter = io.clone();
        let task = tokio::spawn(async move { waiter.wait_for_response().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        io.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(Error::Interrupted));

        let other = responder.create_io().unwrap();
        let resp = other
            .exec_command(Opcode::ReadAttr, 0, pack_code(3, 0), Vec::new(), 64)
            .await
            .unwrap();
        assert_eq!(resp.code, 12);
        assert!(!responder.is_stopped());
    }

    #[tokio::test]
    async fn test_freeing_a_block_cancels_its_blocked_transfer() {
        const SIZE: usize = 1024;
        let td = TestDaemon::new().unwrap();
        let responder = td.raw();
        let setup = responder.create_io().unwrap();
        let mask = ChannelsMask::from_bits(3, 0x3);
        setup
            .exec_command(
                Opcode::CreateBuffer,
                0,
                0,
                vec![Bytes::from(mask.to_le_bytes())],
                mask.wire_size(),
            )
            .await
            .unwrap();

        let create_block = || async {
            let io = responder.create_io().unwrap();
            io.exec_command(
                Opcode::CreateBlock,
                0,
                pack_code(0, 0),
                vec![Bytes::copy_from_slice(&(SIZE as u64).to_le_bytes())],
                0,
            )
            .await
            .unwrap();
            io
        };
        let transfer = |io: &iio_transport::IiodIo| {
            io.get_response_async(SIZE).unwrap();
            io.send_command_async(
                Opcode::TransferBlock,
                0,
                pack_code(0, 0),
                vec![Bytes::copy_from_slice(&(SIZE as u64).to_le_bytes())],
            )
            .unwrap();
        };

        // the buffer is disabled, so the transfer parks on the daemon
        let block = create_block().await;
        transfer(&block);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!block.has_response());

        setup
            .exec_simple_command(Opcode::FreeBlock, 0, pack_code(0, 0))
            .await
            .unwrap();
        assert_eq!(block.wait_for_response().await, Err(Error::BadDescriptor));

        // the index is free again and no samples were consumed
        let block = create_block().await;
        transfer(&block);
        setup
            .exec_simple_command(Opcode::EnableBuffer, 0, 0)
            .await
            .unwrap();
        let resp = block.wait_for_response().await.unwrap();
        assert_eq!(resp.data, rx_pattern(0, SIZE));
    }

    #[tokio::test]
    async fn test_compression_fallback() {
        let td = TestDaemon::with_zstd(None).unwrap();
        let responder = td.raw();
        let io = responder.create_io().unwrap();
        assert_eq!(
            io.exec_command(Opcode::ZPrint, 0, 0, Vec::new(), 1 << 20).await,
            Err(Error::InvalidArgument)
        );
        let plain = io
            .exec_command(Opcode::Print, 0, 0, Vec::new(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(plain.code as usize, plain.data.len());

        let client = td.client().await.unwrap();
        let native = td.backend.context();
        let remote = client.context();
        assert_eq!(remote.devices().len(), native.devices().len());
        for (r, n) in remote.devices().iter().zip(native.devices()) {
            assert_eq!(r.channels().len(), n.channels().len());
            assert_eq!(r.attrs.len(), n.attrs.len());
            assert_eq!(r.buffer_attrs.len(), n.buffer_attrs.len());
            assert_eq!(r.debug_attrs.len(), n.debug_attrs.len());
        }
        assert_eq!(remote.attrs().len(), native.attrs().len());
    }

    #[tokio::test]
    async fn test_compressed_and_plain_descriptions_agree() {
        let td = TestDaemon::new().unwrap();
        let zipped = td.client().await.unwrap();
        let plain = td
            .client_with(ClientConfig {
                use_zstd: false,
                ..ClientConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(zipped.context(), plain.context());
    }

    #[tokio::test]
    async fn test_session_over_tcp() {
        let server = TcpDaemon::start(0).await.unwrap();
        let opened = create_context(&server.uri(), &ClientConfig::default())
            .await
            .unwrap();
        let IioContext::Remote(client) = opened else {
            panic!("expected a remote context");
        };

        let freq = client
            .find_attr(AttrOwner::Device(1), "sampling_frequency")
            .unwrap();
        client.write_longlong(freq, 30_720_000).await.unwrap();
        assert_eq!(client.read_longlong(freq).await.unwrap(), 30_720_000);

        let buf = client
            .create_buffer(0, 0, &ChannelsMask::from_bits(3, 0x1))
            .await
            .unwrap();
        let second = server.client().await.unwrap();
        let watermark = buf.attr("watermark").unwrap();
        assert_eq!(watermark, AttrRef::new(AttrOwner::Buffer { dev: 0, buffer: 0 }, 1));
        assert_eq!(second.read_string(watermark).await.unwrap(), "2048");

        let mut stream = buf.create_stream(3, 128).await.unwrap();
        for n in 0..6u64 {
            let block = stream.next_block().await.unwrap();
            assert_eq!(block.data(), rx_pattern(n * 256, 256).as_slice());
        }
        stream.free().await.unwrap();
        buf.free().await.unwrap();
        assert_eq!(server.daemon.buffer_count(), 0);
        assert_eq!(second.read_attr(watermark).await, Err(Error::BadDescriptor));

        client.shutdown().await;
        second.shutdown().await;
        server.stop().await.unwrap();
    }
}
