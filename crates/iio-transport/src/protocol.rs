//! IIOD binary protocol definitions.
//!
//! Every frame starts with an 8-byte little-endian header
//! (`client_id:u16, op:u8, dev:u8, code:i32`). For `RESPONSE` frames a
//! non-negative `code` is the payload length and a negative one is `-errno`.
//! Payload layouts of the other opcodes are described on [`Opcode`].

use iio_model::{Error, Result};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Default TCP port of the daemon.
pub const IIOD_PORT: u16 = 30431;

/// `attr_idx` value selecting every attribute of a list at once.
pub const ALL_ATTRS: u16 = 0xffff;

/// Largest attribute value a daemon returns.
pub const MAX_ATTR_SIZE: usize = 64 * 1024;

/// Protocol operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Reply to the request carrying the same client id.
    Response = 0,
    /// Request the raw XML context description.
    Print = 1,
    /// Set the backend I/O timeout, `code` in milliseconds.
    Timeout = 2,
    /// Read a device attribute, `code` high half = attribute index.
    ReadAttr = 3,
    /// Read a debug attribute.
    ReadDbgAttr = 4,
    /// Read a buffer attribute, `code` low half = buffer index.
    ReadBufAttr = 5,
    /// Read a channel attribute, `code` low half = channel index.
    ReadChnAttr = 6,
    /// Write a device attribute; payload `u64 len` then the bytes.
    WriteAttr = 7,
    /// Write a debug attribute.
    WriteDbgAttr = 8,
    /// Write a buffer attribute.
    WriteBufAttr = 9,
    /// Write a channel attribute.
    WriteChnAttr = 10,
    /// Get the device's trigger; reply code is its index or `-ENODEV`.
    GetTrig = 11,
    /// Set the device's trigger to device `code`, `-1` clears it.
    SetTrig = 12,
    /// Create buffer `code`; payload is the channel mask words.
    CreateBuffer = 13,
    /// Free buffer `code`.
    FreeBuffer = 14,
    /// Enable buffer `code`.
    EnableBuffer = 15,
    /// Disable buffer `code`.
    DisableBuffer = 16,
    /// Create a block; payload `u64 size`.
    CreateBlock = 17,
    /// Free a block.
    FreeBlock = 18,
    /// Enqueue a block; payload `u64 bytes_used` then TX data.
    TransferBlock = 19,
    /// Enqueue a block for cyclic replay.
    EnqueueBlockCyclic = 20,
    /// Open the device's event stream.
    CreateEvstream = 21,
    /// Close an event stream, `code` = its client id.
    FreeEvstream = 22,
    /// Read one event; `code != 0` for a non-blocking read.
    ReadEvent = 23,
    /// Request the zstd-compressed XML context description.
    ZPrint = 25,
}

impl Opcode {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(op: u8) -> Result<Self> {
        Ok(match op {
            0 => Opcode::Response,
            1 => Opcode::Print,
            2 => Opcode::Timeout,
            3 => Opcode::ReadAttr,
            4 => Opcode::ReadDbgAttr,
            5 => Opcode::ReadBufAttr,
            6 => Opcode::ReadChnAttr,
            7 => Opcode::WriteAttr,
            8 => Opcode::WriteDbgAttr,
            9 => Opcode::WriteBufAttr,
            10 => Opcode::WriteChnAttr,
            11 => Opcode::GetTrig,
            12 => Opcode::SetTrig,
            13 => Opcode::CreateBuffer,
            14 => Opcode::FreeBuffer,
            15 => Opcode::EnableBuffer,
            16 => Opcode::DisableBuffer,
            17 => Opcode::CreateBlock,
            18 => Opcode::FreeBlock,
            19 => Opcode::TransferBlock,
            20 => Opcode::EnqueueBlockCyclic,
            21 => Opcode::CreateEvstream,
            22 => Opcode::FreeEvstream,
            23 => Opcode::ReadEvent,
            25 => Opcode::ZPrint,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

/// One frame header.
///
/// `op` is kept raw so that unknown opcodes can still be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Correlation tag.
    pub client_id: u16,
    /// Raw opcode.
    pub op: u8,
    /// Device index, 0 when not applicable.
    pub dev: u8,
    /// Request parameter or response code.
    pub code: i32,
}

impl Command {
    /// Builds a header.
    pub fn new(client_id: u16, op: Opcode, dev: u8, code: i32) -> Self {
        Self {
            client_id,
            op: op.as_u8(),
            dev,
            code,
        }
    }

    /// Decoded opcode.
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::try_from(self.op)
    }

    /// True for `RESPONSE` frames.
    pub fn is_response(&self) -> bool {
        self.op == Opcode::Response.as_u8()
    }

    /// High 16 bits of `code`.
    pub fn code_high(&self) -> u16 {
        (self.code as u32 >> 16) as u16
    }

    /// Low 16 bits of `code`.
    pub fn code_low(&self) -> u16 {
        self.code as u32 as u16
    }

    /// Wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..2].copy_from_slice(&self.client_id.to_le_bytes());
        out[2] = self.op;
        out[3] = self.dev;
        out[4..].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    /// Parses a header.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        Self {
            client_id: u16::from_le_bytes([raw[0], raw[1]]),
            op: raw[2],
            dev: raw[3],
            code: i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

/// Packs two 16-bit halves into a `code` (`high << 16 | low`).
pub fn pack_code(high: u16, low: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout_is_little_endian() {
        let cmd = Command::new(0x0102, Opcode::ReadChnAttr, 3, pack_code(2, 5));
        let raw = cmd.encode();
        assert_eq!(raw, [0x02, 0x01, 6, 3, 5, 0, 2, 0]);
        assert_eq!(Command::decode(&raw), cmd);
        assert_eq!(cmd.code_high(), 2);
        assert_eq!(cmd.code_low(), 5);
    }

    #[test]
    fn test_negative_code_round_trip() {
        let cmd = Command::new(7, Opcode::Response, 0, -libc::EBUSY);
        let back = Command::decode(&cmd.encode());
        assert_eq!(back.code, -16);
        assert!(back.is_response());
    }

    #[test]
    fn test_opcode_table_values() {
        assert_eq!(Opcode::ReadEvent.as_u8(), 23);
        assert_eq!(Opcode::ZPrint.as_u8(), 25);
        for op in 0u8..=23 {
            assert_eq!(Opcode::try_from(op).unwrap().as_u8(), op);
        }
        assert!(Opcode::try_from(24).is_err());
        assert!(Opcode::try_from(200).is_err());
    }

    #[test]
    fn test_all_attrs_code() {
        let code = pack_code(ALL_ATTRS, 1);
        let cmd = Command::new(0, Opcode::ReadChnAttr, 0, code);
        assert_eq!(cmd.code_high(), ALL_ATTRS);
        assert!(cmd.code < 0);
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(client_id: u16, op: u8, dev: u8, code: i32) {
            let cmd = Command { client_id, op, dev, code };
            let raw = cmd.encode();
            prop_assert_eq!(Command::decode(&raw), cmd);
            prop_assert_eq!(&raw[4..], &code.to_le_bytes()[..]);
        }

        #[test]
        fn prop_code_halves_survive_packing(high: u16, low: u16) {
            let cmd = Command::new(0, Opcode::ReadBufAttr, 0, pack_code(high, low));
            let back = Command::decode(&cmd.encode());
            prop_assert_eq!(back.code_high(), high);
            prop_assert_eq!(back.code_low(), low);
        }

        #[test]
        fn prop_only_known_opcodes_decode(op: u8) {
            match Opcode::try_from(op) {
                Ok(known) => prop_assert_eq!(known.as_u8(), op),
                Err(e) => {
                    prop_assert!(op == 24 || op > 25);
                    prop_assert_eq!(e, Error::InvalidArgument);
                }
            }
        }
    }
}
