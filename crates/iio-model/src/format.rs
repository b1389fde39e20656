//! Sample data format of a scan element.
//!
//! The textual form is the one used by the kernel's `scan_elements/*_type`
//! files and by the XML description:
//! `<b|l>e:<s|u|S|U><bits>/<length>[X<repeat>]>><shift>`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Storage and interpretation of one channel's samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFormat {
    /// Storage size of one sample, in bits.
    pub length: u32,
    /// Number of meaningful bits.
    pub bits: u32,
    /// Right shift to apply to the stored value.
    pub shift: u32,
    /// Number of consecutive samples per scan, at least 1.
    pub repeat: u32,
    /// Sample is two's complement.
    pub is_signed: bool,
    /// All `length` bits are meaningful.
    pub is_fully_defined: bool,
    /// Stored big-endian.
    pub is_be: bool,
    /// Optional scale factor advertised with the scan element.
    pub scale: Option<f64>,
}

impl Default for DataFormat {
    fn default() -> Self {
        Self {
            length: 0,
            bits: 0,
            shift: 0,
            repeat: 1,
            is_signed: false,
            is_fully_defined: false,
            is_be: false,
            scale: None,
        }
    }
}

impl DataFormat {
    /// Bytes taken by one scan of this channel (`length / 8 * repeat`).
    pub fn storage_bytes(&self) -> usize {
        ((self.length / 8) as usize).saturating_mul(self.repeat.max(1) as usize)
    }

    /// Decodes one raw sample: byte order, shift, truncation to `bits` and
    /// sign extension. Supports containers of 8, 16, 32 and 64 bits.
    pub fn decode(&self, raw: &[u8]) -> Result<i64> {
        let nbytes = (self.length / 8) as usize;
        if !matches!(nbytes, 1 | 2 | 4 | 8) || raw.len() < nbytes {
            return Err(Error::InvalidArgument);
        }

        let mut buf = [0u8; 8];
        let stored = if self.is_be {
            buf[8 - nbytes..].copy_from_slice(&raw[..nbytes]);
            u64::from_be_bytes(buf)
        } else {
            buf[..nbytes].copy_from_slice(&raw[..nbytes]);
            u64::from_le_bytes(buf)
        };

        let mut value = stored.checked_shr(self.shift).unwrap_or(0);
        let bits = self.bits.min(64);
        if bits < 64 {
            value &= (1u64 << bits) - 1;
        }

        if self.is_signed && bits > 0 && bits < 64 {
            let sign = 1u64 << (bits - 1);
            if value & sign != 0 {
                value |= !((1u64 << bits) - 1);
            }
        }

        Ok(value as i64)
    }

    /// Inverse of [`DataFormat::decode`]: masks, shifts and stores `value`.
    pub fn encode(&self, value: i64, out: &mut [u8]) -> Result<()> {
        let nbytes = (self.length / 8) as usize;
        if !matches!(nbytes, 1 | 2 | 4 | 8) || out.len() < nbytes {
            return Err(Error::InvalidArgument);
        }

        let bits = self.bits.min(64);
        let mut v = value as u64;
        if bits < 64 {
            v &= (1u64 << bits) - 1;
        }
        v = v.checked_shl(self.shift).unwrap_or(0);

        if self.is_be {
            out[..nbytes].copy_from_slice(&v.to_be_bytes()[8 - nbytes..]);
        } else {
            out[..nbytes].copy_from_slice(&v.to_le_bytes()[..nbytes]);
        }
        Ok(())
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endian = if self.is_be { 'b' } else { 'l' };
        let sign = match (self.is_signed, self.is_fully_defined) {
            (true, true) => 'S',
            (true, false) => 's',
            (false, true) => 'U',
            (false, false) => 'u',
        };
        write!(f, "{}e:{}{}/{}", endian, sign, self.bits, self.length)?;
        if self.repeat > 1 {
            write!(f, "X{}", self.repeat)?;
        }
        write!(f, ">>{}", self.shift)
    }
}

fn parse_err(s: &str) -> Error {
    Error::Parse {
        reason: format!("bad data format '{s}'"),
    }
}

fn take_number<'a>(s: &'a str, whole: &str) -> Result<(u32, &'a str)> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return Err(parse_err(whole));
    }
    let n = s[..end].parse().map_err(|_| parse_err(whole))?;
    Ok((n, &s[end..]))
}

impl FromStr for DataFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let is_be = match chars.next() {
            Some('b') => true,
            Some('l') => false,
            _ => return Err(parse_err(s)),
        };
        let rest = chars.as_str().strip_prefix("e:").ok_or_else(|| parse_err(s))?;

        let mut chars = rest.chars();
        let sign = chars.next().ok_or_else(|| parse_err(s))?;
        let (is_signed, upper) = match sign {
            's' => (true, false),
            'S' => (true, true),
            'u' => (false, false),
            'U' => (false, true),
            _ => return Err(parse_err(s)),
        };

        let (bits, rest) = take_number(chars.as_str(), s)?;
        let rest = rest.strip_prefix('/').ok_or_else(|| parse_err(s))?;
        let (length, rest) = take_number(rest, s)?;

        let (repeat, rest) = match rest.strip_prefix('X') {
            Some(r) => take_number(r, s)?,
            None => (1, rest),
        };

        let rest = rest.strip_prefix(">>").ok_or_else(|| parse_err(s))?;
        let (shift, rest) = take_number(rest, s)?;
        if !rest.trim().is_empty() {
            return Err(parse_err(s));
        }

        Ok(DataFormat {
            length,
            bits,
            shift,
            repeat: repeat.max(1),
            is_signed,
            is_fully_defined: upper || bits == length,
            is_be,
            scale: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_basic() {
        let f: DataFormat = "le:s12/16>>4".parse().unwrap();
        assert!(!f.is_be);
        assert!(f.is_signed);
        assert!(!f.is_fully_defined);
        assert_eq!(f.bits, 12);
        assert_eq!(f.length, 16);
        assert_eq!(f.shift, 4);
        assert_eq!(f.repeat, 1);
    }

    #[test]
    fn test_parse_repeat_and_upper() {
        let f: DataFormat = "be:U16/32X4>>0".parse().unwrap();
        assert!(f.is_be);
        assert!(!f.is_signed);
        assert!(f.is_fully_defined);
        assert_eq!(f.repeat, 4);
        assert_eq!(f.storage_bytes(), 16);
        assert_eq!(f.to_string(), "be:U16/32X4>>0");
    }

    #[test]
    fn test_equal_bits_and_length_is_fully_defined() {
        let f: DataFormat = "le:s16/16>>0".parse().unwrap();
        assert!(f.is_fully_defined);
        assert_eq!(f.to_string(), "le:S16/16>>0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("xe:s12/16>>4".parse::<DataFormat>().is_err());
        assert!("le:q12/16>>4".parse::<DataFormat>().is_err());
        assert!("le:s12/16".parse::<DataFormat>().is_err());
        assert!("le:s/16>>0".parse::<DataFormat>().is_err());
    }

    #[test]
    fn test_decode_sign_extends() {
        let f: DataFormat = "le:s12/16>>4".parse().unwrap();
        // 0xFFF0 >> 4 = 0xFFF, 12-bit -1
        assert_eq!(f.decode(&[0xF0, 0xFF]).unwrap(), -1);
        assert_eq!(f.decode(&[0x10, 0x00]).unwrap(), 1);
    }

    #[test]
    fn test_decode_big_endian() {
        let f: DataFormat = "be:u16/16>>0".parse().unwrap();
        assert_eq!(f.decode(&[0x12, 0x34]).unwrap(), 0x1234);
    }

    #[test]
    fn test_decode_rejects_odd_container() {
        let f: DataFormat = "le:u24/24>>0".parse().unwrap();
        assert!(f.decode(&[0, 0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_format_string_round_trips(
            be in any::<bool>(),
            signed in any::<bool>(),
            bits in 1u32..=64,
            length_sel in 0usize..4,
            repeat in 1u32..8,
            shift in 0u32..16,
        ) {
            let length = [8u32, 16, 32, 64][length_sel].max(bits);
            let f = DataFormat {
                length,
                bits,
                shift,
                repeat,
                is_signed: signed,
                is_fully_defined: bits == length,
                is_be: be,
                scale: None,
            };
            let parsed: DataFormat = f.to_string().parse().unwrap();
            prop_assert_eq!(parsed, f);
        }

        #[test]
        fn prop_encode_then_decode_keeps_in_range_values(v in -2048i64..2048) {
            let f: DataFormat = "le:s12/16>>4".parse().unwrap();
            let mut out = [0u8; 2];
            f.encode(v, &mut out).unwrap();
            prop_assert_eq!(f.decode(&out).unwrap(), v);
        }
    }
}
