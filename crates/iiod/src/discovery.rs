//! DNS-SD naming.
//!
//! The daemon announces itself as `_iio._tcp`. Publishing the record is
//! left to the host's mDNS responder; this module computes the name and
//! resolves collisions the way the responder expects.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::info;

/// Service type announced by the daemon.
pub const SERVICE_TYPE: &str = "_iio._tcp";

/// Name of this host, if it can be read.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its whole length and gethostname
    // writes at most that many bytes.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}

/// Default service name for `host`.
pub fn service_name(host: &str) -> String {
    format!("iiod on {host}")
}

/// `base`, or `base (n)` with the smallest `n >= 2` not in `taken`.
pub fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{base} ({n})"))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| base.to_string())
}

/// A service record ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Instance name.
    pub name: String,
    /// Always [`SERVICE_TYPE`].
    pub service_type: &'static str,
    /// Listening port.
    pub port: u16,
}

impl Announcement {
    /// Builds the record for a daemon listening on `addr`, avoiding the
    /// names already seen on the network.
    pub fn new(addr: SocketAddr, taken: &HashSet<String>) -> Self {
        let host = hostname().unwrap_or_else(|| String::from("localhost"));
        Self {
            name: unique_name(&service_name(&host), taken),
            service_type: SERVICE_TYPE,
            port: addr.port(),
        }
    }

    /// Logs the record.
    pub fn log(&self) {
        info!(
            name = %self.name,
            service_type = self.service_type,
            port = self.port,
            "service announced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name() {
        assert_eq!(service_name("pluto"), "iiod on pluto");
    }

    #[test]
    fn test_unique_name_without_collision() {
        assert_eq!(unique_name("iiod on pluto", &HashSet::new()), "iiod on pluto");
    }

    #[test]
    fn test_unique_name_counts_from_two() {
        let mut taken = HashSet::new();
        taken.insert(String::from("iiod on pluto"));
        assert_eq!(unique_name("iiod on pluto", &taken), "iiod on pluto (2)");
        taken.insert(String::from("iiod on pluto (2)"));
        taken.insert(String::from("iiod on pluto (3)"));
        assert_eq!(unique_name("iiod on pluto", &taken), "iiod on pluto (4)");
    }

    #[test]
    fn test_hostname_is_readable() {
        let host = hostname().unwrap();
        assert!(!host.contains('\0'));
    }

    #[test]
    fn test_announcement_port() {
        let ann = Announcement::new(SocketAddr::from(([0, 0, 0, 0], 30431)), &HashSet::new());
        assert_eq!(ann.service_type, "_iio._tcp");
        assert_eq!(ann.port, 30431);
        assert!(ann.name.starts_with("iiod on "));
    }
}
