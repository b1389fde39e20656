#![warn(missing_docs)]

//! IIOD daemon: serves an IIO context to remote clients over the framed
//! binary protocol.
//!
//! A [`Daemon`] holds the served context behind a [`Backend`] and the
//! buffers and event streams clients create. Each connection gets its own
//! responder and dispatcher; [`Server`] accepts TCP clients, but any byte
//! stream pair can be handed to [`Daemon::run_connection`].

pub mod backend;
pub mod buffer;
pub mod config;
pub mod daemon;
pub mod demo;
pub mod discovery;
pub mod dispatch;
pub mod evstream;
pub mod memory;
pub mod server;

pub use backend::{Backend, BackendBuffer, BackendEventStream};
pub use config::IiodConfig;
pub use daemon::Daemon;
pub use discovery::Announcement;
pub use memory::{rx_pattern, MemoryBackend};
pub use server::Server;
