//! Client settings.

use serde::{Deserialize, Serialize};

/// How a client connects and waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default timeout of every request, in milliseconds (0 = infinite).
    pub timeout_ms: u64,
    /// TCP connection timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Ask for the compressed context description first.
    pub use_zstd: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            connect_timeout_ms: 5000,
            nodelay: true,
            use_zstd: true,
        }
    }
}
