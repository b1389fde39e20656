//! Context URIs.
//!
//! ```text
//! local:
//! ip:[<host>[:<port>]]          host may be an IPv6 literal in brackets
//! usb:[<bus>.<addr>[.<intf>]]
//! serial:<device>[,<baud>[,<bits><parity><stop>[<flow>]]]
//! xml:<path or inline document>
//! ```

use std::fmt;
use std::str::FromStr;

use iio_model::{Error, Result};
use iio_transport::IIOD_PORT;

/// Default UART speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// UART parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// `n`
    None,
    /// `o`
    Odd,
    /// `e`
    Even,
    /// `m`
    Mark,
    /// `s`
    Space,
}

impl Parity {
    fn from_char(c: char) -> Result<Self> {
        Ok(match c {
            'n' => Parity::None,
            'o' => Parity::Odd,
            'e' => Parity::Even,
            'm' => Parity::Mark,
            's' => Parity::Space,
            _ => return Err(Error::InvalidArgument),
        })
    }

    fn as_char(self) -> char {
        match self {
            Parity::None => 'n',
            Parity::Odd => 'o',
            Parity::Even => 'e',
            Parity::Mark => 'm',
            Parity::Space => 's',
        }
    }
}

/// UART flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// No flow control.
    None,
    /// `x`: XON/XOFF.
    XonXoff,
    /// `r`: RTS/CTS.
    RtsCts,
}

/// UART settings of a `serial:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    /// Device path.
    pub device: String,
    /// Speed.
    pub baud: u32,
    /// Data bits, 5 to 9.
    pub bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Stop bits, 1 or 2.
    pub stop: u8,
    /// Flow control.
    pub flow: FlowControl,
}

/// A parsed context URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uri {
    /// The local sysfs backend.
    Local,
    /// An IIOD daemon reachable over TCP. No host means "discover one".
    Ip {
        /// Host name or address, without brackets.
        host: Option<String>,
        /// TCP port.
        port: u16,
    },
    /// An IIOD daemon behind a USB gadget.
    Usb {
        /// Bus number, `None` to pick the only device.
        bus: Option<u16>,
        /// Address on the bus.
        addr: Option<u16>,
        /// Interface number.
        intf: u16,
    },
    /// An IIOD daemon on a UART.
    Serial(SerialParams),
    /// An offline context described by XML.
    Xml(String),
}

fn parse_ip(rest: &str) -> Result<Uri> {
    if rest.is_empty() {
        return Ok(Uri::Ip {
            host: None,
            port: IIOD_PORT,
        });
    }

    let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
        let (host, tail) = v6.split_once(']').ok_or(Error::InvalidArgument)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or(Error::InvalidArgument)?)),
        }
    } else if rest.matches(':').count() > 1 {
        // bare IPv6 literal, no port possible
        (rest, None)
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(Error::InvalidArgument);
    }
    let port = match port {
        None => IIOD_PORT,
        Some(p) => p.parse().map_err(|_| Error::InvalidArgument)?,
    };
    Ok(Uri::Ip {
        host: Some(host.to_string()),
        port,
    })
}

fn parse_usb(rest: &str) -> Result<Uri> {
    if rest.is_empty() {
        return Ok(Uri::Usb {
            bus: None,
            addr: None,
            intf: 0,
        });
    }
    let parts: Vec<u16> = rest
        .split('.')
        .map(|p| p.parse().map_err(|_| Error::InvalidArgument))
        .collect::<Result<_>>()?;
    match parts.as_slice() {
        [bus, addr] => Ok(Uri::Usb {
            bus: Some(*bus),
            addr: Some(*addr),
            intf: 0,
        }),
        [bus, addr, intf] => Ok(Uri::Usb {
            bus: Some(*bus),
            addr: Some(*addr),
            intf: *intf,
        }),
        _ => Err(Error::InvalidArgument),
    }
}

fn parse_serial(rest: &str) -> Result<Uri> {
    let mut fields = rest.splitn(3, ',');
    let device = fields.next().unwrap_or_default();
    if device.is_empty() {
        return Err(Error::InvalidArgument);
    }
    let baud = match fields.next() {
        None => DEFAULT_BAUD,
        Some(b) => b.parse().map_err(|_| Error::InvalidArgument)?,
    };

    let mut params = SerialParams {
        device: device.to_string(),
        baud,
        bits: 8,
        parity: Parity::None,
        stop: 1,
        flow: FlowControl::None,
    };
    let Some(frame) = fields.next() else {
        return Ok(Uri::Serial(params));
    };

    let chars: Vec<char> = frame.chars().collect();
    let (bits, parity, stop, flow) = match chars.as_slice() {
        [b, p, s] => (*b, *p, *s, None),
        [b, p, s, f] => (*b, *p, *s, Some(*f)),
        _ => return Err(Error::InvalidArgument),
    };
    params.bits = bits
        .to_digit(10)
        .filter(|b| (5..=9).contains(b))
        .ok_or(Error::InvalidArgument)? as u8;
    params.parity = Parity::from_char(parity)?;
    params.stop = stop
        .to_digit(10)
        .filter(|s| (1..=2).contains(s))
        .ok_or(Error::InvalidArgument)? as u8;
    params.flow = match flow {
        None => FlowControl::None,
        Some('x') => FlowControl::XonXoff,
        Some('r') => FlowControl::RtsCts,
        Some(_) => return Err(Error::InvalidArgument),
    };
    Ok(Uri::Serial(params))
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s.split_once(':').ok_or(Error::InvalidArgument)?;
        match scheme {
            "local" if rest.is_empty() => Ok(Uri::Local),
            "ip" => parse_ip(rest),
            "usb" => parse_usb(rest),
            "serial" => parse_serial(rest),
            "xml" if !rest.is_empty() => Ok(Uri::Xml(rest.to_string())),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::Local => write!(f, "local:"),
            Uri::Ip { host: None, .. } => write!(f, "ip:"),
            Uri::Ip {
                host: Some(host),
                port,
            } => {
                if host.contains(':') {
                    write!(f, "ip:[{host}]")?;
                } else {
                    write!(f, "ip:{host}")?;
                }
                if *port != IIOD_PORT {
                    write!(f, ":{port}")?;
                }
                Ok(())
            }
            Uri::Usb {
                bus: Some(bus),
                addr: Some(addr),
                intf,
            } => write!(f, "usb:{bus}.{addr}.{intf}"),
            Uri::Usb { .. } => write!(f, "usb:"),
            Uri::Serial(p) => {
                write!(f, "serial:{},{},{}{}{}", p.device, p.baud, p.bits, p.parity.as_char(), p.stop)?;
                match p.flow {
                    FlowControl::None => Ok(()),
                    FlowControl::XonXoff => write!(f, "x"),
                    FlowControl::RtsCts => write!(f, "r"),
                }
            }
            Uri::Xml(src) => write!(f, "xml:{src}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ip(host: &str, port: u16) -> Uri {
        Uri::Ip {
            host: Some(host.to_string()),
            port,
        }
    }

    #[test]
    fn test_ip_forms() {
        assert_eq!("ip:192.168.2.1".parse::<Uri>().unwrap(), ip("192.168.2.1", 30431));
        assert_eq!("ip:pluto.local:1234".parse::<Uri>().unwrap(), ip("pluto.local", 1234));
        assert_eq!("ip:[fe80::1]:40000".parse::<Uri>().unwrap(), ip("fe80::1", 40000));
        assert_eq!("ip:[::1]".parse::<Uri>().unwrap(), ip("::1", 30431));
        assert_eq!("ip:fe80::1".parse::<Uri>().unwrap(), ip("fe80::1", 30431));
        assert_eq!(
            "ip:".parse::<Uri>().unwrap(),
            Uri::Ip {
                host: None,
                port: 30431
            }
        );
    }

    #[test]
    fn test_ip_rejects_bad_port() {
        assert!("ip:host:notaport".parse::<Uri>().is_err());
        assert!("ip:host:70000".parse::<Uri>().is_err());
        assert!("ip:[::1".parse::<Uri>().is_err());
        assert!("ip::80".parse::<Uri>().is_err());
    }

    #[test]
    fn test_usb_forms() {
        assert_eq!(
            "usb:3.32.5".parse::<Uri>().unwrap(),
            Uri::Usb {
                bus: Some(3),
                addr: Some(32),
                intf: 5
            }
        );
        assert_eq!(
            "usb:1.4".parse::<Uri>().unwrap(),
            Uri::Usb {
                bus: Some(1),
                addr: Some(4),
                intf: 0
            }
        );
        assert!("usb:1".parse::<Uri>().is_err());
    }

    #[test]
    fn test_serial_defaults() {
        let Uri::Serial(p) = "serial:/dev/ttyUSB0".parse::<Uri>().unwrap() else {
            panic!("not a serial uri");
        };
        assert_eq!(p.device, "/dev/ttyUSB0");
        assert_eq!(p.baud, 115_200);
        assert_eq!((p.bits, p.parity, p.stop, p.flow), (8, Parity::None, 1, FlowControl::None));
    }

    #[test]
    fn test_serial_full() {
        let Uri::Serial(p) = "serial:/dev/ttyS1,57600,7e2r".parse::<Uri>().unwrap() else {
            panic!("not a serial uri");
        };
        assert_eq!(p.baud, 57_600);
        assert_eq!((p.bits, p.parity, p.stop, p.flow), (7, Parity::Even, 2, FlowControl::RtsCts));
    }

    #[test]
    fn test_serial_rejects_out_of_range() {
        assert!("serial:/dev/ttyS1,9600,4n1".parse::<Uri>().is_err());
        assert!("serial:/dev/ttyS1,9600,8n3".parse::<Uri>().is_err());
        assert!("serial:/dev/ttyS1,9600,8q1".parse::<Uri>().is_err());
        assert!("serial:/dev/ttyS1,9600,8n1z".parse::<Uri>().is_err());
        assert!("serial:".parse::<Uri>().is_err());
    }

    #[test]
    fn test_other_schemes() {
        assert_eq!("local:".parse::<Uri>().unwrap(), Uri::Local);
        assert_eq!(
            "xml:/tmp/ctx.xml".parse::<Uri>().unwrap(),
            Uri::Xml(String::from("/tmp/ctx.xml"))
        );
        assert!("tcp:host".parse::<Uri>().is_err());
        assert!("nocolon".parse::<Uri>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "ip:10.0.0.2",
            "ip:[fe80::1]:9000",
            "usb:3.32.5",
            "serial:/dev/ttyS0,9600,8n1x",
            "xml:ctx.xml",
            "local:",
        ] {
            assert_eq!(s.parse::<Uri>().unwrap().to_string(), s);
        }
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC{0,40}") {
            let _ = s.parse::<Uri>();
        }

        #[test]
        fn prop_ipv4_with_port_reparses(a: u8, b: u8, port in 1u16..) {
            let uri = ip(&format!("10.{a}.{b}.1"), port);
            prop_assert_eq!(uri.to_string().parse::<Uri>().unwrap(), uri);
        }
    }
}
