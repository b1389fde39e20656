//! End-to-end tests for the IIOD daemon and client.
//!
//! The harness starts daemons over the in-memory backend, either behind an
//! in-process pipe or a loopback TCP listener, and hands out connected
//! clients or bare protocol engines for tests that work at frame level.

pub mod fuzz_helpers;
pub mod harness;
pub mod proptest_wire;
pub mod resilience;
pub mod scenarios;

pub use fuzz_helpers::FrameFuzzer;
pub use harness::{write_payload, RejectCommands, TcpDaemon, TestDaemon};
