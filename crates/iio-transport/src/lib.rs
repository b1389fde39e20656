#![warn(missing_docs)]

//! IIOD transport: the framed wire protocol, byte transports and the
//! request/response engine used on both ends of a connection.

pub mod cancel;
pub mod io;
pub mod protocol;
pub mod responder;
pub mod tcp;
pub mod transport;

pub use cancel::CancelToken;
pub use io::{IiodIo, Response};
pub use protocol::{pack_code, Command, Opcode, ALL_ATTRS, HEADER_SIZE, IIOD_PORT, MAX_ATTR_SIZE};
pub use responder::{CommandData, CommandHandler, Responder};
pub use tcp::{TcpTransport, TcpTransportConfig};

