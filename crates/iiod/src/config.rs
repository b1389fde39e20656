//! Daemon configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use iio_transport::IIOD_PORT;
use serde::{Deserialize, Serialize};

/// Settings of one daemon instance. Missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IiodConfig {
    /// Address to listen on.
    pub bind_addr: IpAddr,
    /// TCP port.
    pub port: u16,
    /// Context description served by the in-memory backend. The built-in
    /// demo context is used when unset.
    pub xml_path: Option<PathBuf>,
    /// Concurrent connections accepted, 0 = unlimited.
    pub max_connections: usize,
    /// Default timeout of every connection's responder, in milliseconds.
    pub default_timeout_ms: u64,
    /// zstd level of the `ZPRINT` description; `None` refuses `ZPRINT`.
    pub zstd_level: Option<i32>,
    /// Log the service name this daemon would announce.
    pub announce: bool,
    /// Default log filter, `RUST_LOG` takes precedence.
    pub log_level: String,
}

impl Default for IiodConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: IIOD_PORT,
            xml_path: None,
            max_connections: 0,
            default_timeout_ms: 5000,
            zstd_level: Some(3),
            announce: true,
            log_level: String::from("info"),
        }
    }
}

impl IiodConfig {
    /// Loads a TOML or JSON file, picked by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("unsupported config file extension: {}", ext),
        }
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = IiodConfig::default();
        assert_eq!(config.listen_addr(), SocketAddr::from(([0, 0, 0, 0], 30431)));
        assert!(config.xml_path.is_none());
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.zstd_level, Some(3));
        assert!(config.announce);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_file_toml_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
port = 40000
xml_path = "/etc/iiod/context.xml"
max_connections = 8
"#
        )
        .unwrap();

        let config = IiodConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 40000);
        assert_eq!(config.xml_path, Some(PathBuf::from("/etc/iiod/context.xml")));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.default_timeout_ms, 5000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "bind_addr": "127.0.0.1",
                "zstd_level": null,
                "announce": false,
                "log_level": "debug"
            }}"#
        )
        .unwrap();

        let config = IiodConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr(), SocketAddr::from(([127, 0, 0, 1], 30431)));
        assert_eq!(config.zstd_level, None);
        assert!(!config.announce);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(IiodConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(IiodConfig::from_file(Path::new("/nonexistent/iiod.toml")).is_err());
    }
}
