//! XML description of a context.
//!
//! [`to_xml`] is what a daemon answers to `PRINT`; [`parse`] rebuilds the
//! same object model on the client. Both sides derive attribute and channel
//! indices from this document, so emission is deterministic and parsing
//! reproduces the emitted order.

use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::attr::Attr;
use crate::channel::{Channel, Direction};
use crate::context::{Context, Device};
use crate::error::{Error, Result};
use crate::format::DataFormat;

/// Fixed document prologue.
pub const XML_HEADER: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<!DOCTYPE context [",
    "<!ELEMENT context (device | context-attribute)*>",
    "<!ELEMENT context-attribute EMPTY>",
    "<!ELEMENT device (channel | attribute | debug-attribute | buffer-attribute)*>",
    "<!ELEMENT channel (scan-element?, attribute*)>",
    "<!ELEMENT attribute EMPTY>",
    "<!ELEMENT scan-element EMPTY>",
    "<!ELEMENT debug-attribute EMPTY>",
    "<!ELEMENT buffer-attribute EMPTY>",
    "<!ATTLIST context name CDATA #REQUIRED description CDATA #IMPLIED>",
    "<!ATTLIST context-attribute name CDATA #REQUIRED value CDATA #REQUIRED>",
    "<!ATTLIST device id CDATA #REQUIRED name CDATA #IMPLIED label CDATA #IMPLIED>",
    "<!ATTLIST channel id CDATA #REQUIRED type (input|output) #REQUIRED name CDATA #IMPLIED label CDATA #IMPLIED>",
    "<!ATTLIST scan-element index CDATA #REQUIRED format CDATA #REQUIRED scale CDATA #IMPLIED>",
    "<!ATTLIST attribute name CDATA #REQUIRED filename CDATA #IMPLIED>",
    "<!ATTLIST debug-attribute name CDATA #REQUIRED>",
    "<!ATTLIST buffer-attribute name CDATA #REQUIRED>",
    "]>",
);

fn push_opt(out: &mut String, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        let _ = write!(out, " {key}=\"{}\"", escape(v));
    }
}

fn write_channel(out: &mut String, chn: &Channel) {
    let _ = write!(out, "<channel id=\"{}\"", escape(&chn.id));
    push_opt(out, "name", chn.name.as_deref());
    push_opt(out, "label", chn.label.as_deref());
    let _ = write!(out, " type=\"{}\" >", chn.direction.as_str());

    if chn.is_scan_element {
        let format = chn.format.to_string();
        let _ = write!(
            out,
            "<scan-element index=\"{}\" format=\"{}\" ",
            chn.index,
            escape(&format)
        );
        if let Some(scale) = chn.format.scale {
            let _ = write!(out, "scale=\"{scale}\" ");
        }
        out.push_str("/>");
    }

    for attr in &chn.attrs {
        let _ = write!(out, "<attribute name=\"{}\"", escape(&attr.name));
        push_opt(out, "filename", attr.filename.as_deref());
        out.push_str(" />");
    }
    out.push_str("</channel>");
}

fn write_device(out: &mut String, dev: &Device) {
    let _ = write!(out, "<device id=\"{}\"", escape(&dev.id));
    push_opt(out, "name", dev.name.as_deref());
    push_opt(out, "label", dev.label.as_deref());
    out.push_str(" >");

    for chn in dev.channels() {
        write_channel(out, chn);
    }
    for (tag, list) in [
        ("attribute", &dev.attrs),
        ("buffer-attribute", &dev.buffer_attrs),
        ("debug-attribute", &dev.debug_attrs),
    ] {
        for attr in list {
            let _ = write!(out, "<{tag} name=\"{}\" />", escape(&attr.name));
        }
    }
    out.push_str("</device>");
}

/// Serializes `ctx`.
pub fn to_xml(ctx: &Context) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str(XML_HEADER);
    let _ = write!(out, "<context name=\"{}\"", escape(&ctx.name));
    push_opt(&mut out, "description", ctx.description.as_deref());
    out.push_str(" >");

    for attr in ctx.attrs() {
        let _ = write!(
            out,
            "<context-attribute name=\"{}\" value=\"{}\" />",
            escape(&attr.name),
            escape(attr.value.as_deref().unwrap_or(""))
        );
    }
    for dev in ctx.devices() {
        write_device(&mut out, dev);
    }
    out.push_str("</context>");
    out
}

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::Xml {
        reason: e.to_string(),
    }
}

/// Attribute values of one element, unescaped.
fn attributes(element: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in element.attributes().with_checks(false) {
        let attr = attr.map_err(xml_err)?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(xml_err)?
            .to_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn required(attrs: &[(String, String)], key: &str, tag: &str) -> Result<String> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .ok_or_else(|| Error::Xml {
            reason: format!("<{tag}> without '{key}'"),
        })
}

fn optional(attrs: &[(String, String)], key: &str) -> Option<String> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn parse_scan_element(chn: &mut Channel, attrs: &[(String, String)]) -> Result<()> {
    let index = required(attrs, "index", "scan-element")?;
    let index: i64 = index.trim().parse().map_err(|_| Error::Xml {
        reason: format!("bad scan-element index '{index}'"),
    })?;
    let mut format: DataFormat = required(attrs, "format", "scan-element")?.parse()?;
    if let Some(scale) = optional(attrs, "scale") {
        match scale.trim().parse::<f64>() {
            Ok(v) => format.scale = Some(v),
            Err(_) => warn!(channel = %chn.id, scale = %scale, "ignoring invalid scale"),
        }
    }
    chn.index = index;
    chn.format = format;
    chn.is_scan_element = true;
    Ok(())
}

/// Element currently being filled.
enum Open {
    Device(Device),
    Channel(Device, Channel),
}

/// Incremental context builder driven by start and end tags.
#[derive(Default)]
struct Builder {
    ctx: Option<Context>,
    open: Option<Open>,
    done: bool,
}

impl Builder {
    fn context(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or_else(|| Error::Xml {
            reason: "element outside <context>".into(),
        })
    }

    fn start(&mut self, tag: &str, attrs: &[(String, String)], is_empty: bool) -> Result<()> {
        let open = self.open.take();
        match (tag, open) {
            ("context", None) if self.ctx.is_none() => {
                let mut c = Context::new(required(attrs, "name", tag)?);
                c.description = optional(attrs, "description");
                self.ctx = Some(c);
                self.done = is_empty;
            }
            ("context-attribute", None) => {
                let name = required(attrs, "name", tag)?;
                let value = required(attrs, "value", tag)?;
                self.context()?.add_attr(name, value)?;
            }
            ("device", None) => {
                let mut dev = Device::new(required(attrs, "id", tag)?);
                dev.name = optional(attrs, "name");
                dev.label = optional(attrs, "label");
                if is_empty {
                    self.context()?.add_device(dev)?;
                } else {
                    self.open = Some(Open::Device(dev));
                }
            }
            ("channel", Some(Open::Device(mut dev))) => {
                let direction = match required(attrs, "type", tag)?.as_str() {
                    "input" => Direction::Input,
                    "output" => Direction::Output,
                    other => {
                        return Err(Error::Xml {
                            reason: format!("bad channel type '{other}'"),
                        })
                    }
                };
                let mut chn = Channel::new(required(attrs, "id", tag)?, direction);
                chn.name = optional(attrs, "name");
                chn.label = optional(attrs, "label");
                if is_empty {
                    dev.add_channel(chn);
                    self.open = Some(Open::Device(dev));
                } else {
                    self.open = Some(Open::Channel(dev, chn));
                }
            }
            ("scan-element", Some(Open::Channel(dev, mut chn))) => {
                parse_scan_element(&mut chn, attrs)?;
                self.open = Some(Open::Channel(dev, chn));
            }
            ("attribute", Some(Open::Channel(dev, mut chn))) => {
                let name = required(attrs, "name", tag)?;
                let attr = match optional(attrs, "filename") {
                    Some(f) => Attr::with_filename(name, f),
                    None => Attr::new(name),
                };
                chn.attrs.insert(attr)?;
                self.open = Some(Open::Channel(dev, chn));
            }
            ("attribute" | "debug-attribute" | "buffer-attribute", Some(Open::Device(mut dev))) => {
                let list = match tag {
                    "attribute" => &mut dev.attrs,
                    "debug-attribute" => &mut dev.debug_attrs,
                    _ => &mut dev.buffer_attrs,
                };
                list.insert(Attr::new(required(attrs, "name", tag)?))?;
                self.open = Some(Open::Device(dev));
            }
            (other, _) => {
                return Err(Error::Xml {
                    reason: format!("unexpected <{other}>"),
                });
            }
        }
        Ok(())
    }

    fn end(&mut self, tag: &[u8]) -> Result<()> {
        match (tag, self.open.take()) {
            (b"channel", Some(Open::Channel(mut dev, chn))) => {
                dev.add_channel(chn);
                self.open = Some(Open::Device(dev));
            }
            (b"device", Some(Open::Device(dev))) => {
                self.context()?.add_device(dev)?;
            }
            (b"context", None) => self.done = true,
            (_, open) => self.open = open,
        }
        Ok(())
    }
}

/// Rebuilds a context from its XML description.
pub fn parse(xml: &str) -> Result<Context> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut builder = Builder::default();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name();
                let tag = std::str::from_utf8(name.as_ref()).map_err(xml_err)?;
                builder.start(tag, &attributes(&e)?, false)?;
            }
            Event::Empty(e) => {
                let name = e.name();
                let tag = std::str::from_utf8(name.as_ref()).map_err(xml_err)?;
                builder.start(tag, &attributes(&e)?, true)?;
            }
            Event::End(e) => builder.end(e.name().as_ref())?,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match builder {
        Builder {
            ctx: Some(ctx),
            open: None,
            done: true,
        } => Ok(ctx),
        _ => Err(Error::Xml {
            reason: "missing or unterminated <context>".into(),
        }),
    }
}
