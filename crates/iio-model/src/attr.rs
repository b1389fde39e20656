//! Attributes and their value codecs.
//!
//! Attribute lists are kept sorted by name after every insertion so that an
//! index computed from the XML description means the same attribute on both
//! ends of a connection.

use crate::error::{Error, Result};

/// Owner of an attribute list, expressed as indices into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrOwner {
    /// Context attributes (static values).
    Context,
    /// Regular attributes of device `dev`.
    Device(usize),
    /// Debug attributes of device `dev`.
    Debug(usize),
    /// Buffer attributes of buffer `buffer` on device `dev`.
    Buffer {
        /// Device index.
        dev: usize,
        /// Buffer index.
        buffer: u16,
    },
    /// Attributes of channel `chn` on device `dev`.
    Channel {
        /// Device index.
        dev: usize,
        /// Channel index.
        chn: usize,
    },
}

impl AttrOwner {
    /// Device index, if the owner lives on a device.
    pub fn device(&self) -> Option<usize> {
        match *self {
            AttrOwner::Context => None,
            AttrOwner::Device(dev) | AttrOwner::Debug(dev) => Some(dev),
            AttrOwner::Buffer { dev, .. } | AttrOwner::Channel { dev, .. } => Some(dev),
        }
    }
}

/// An attribute designated by owner and index, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrRef {
    /// List the attribute belongs to.
    pub owner: AttrOwner,
    /// Position inside that list.
    pub index: usize,
}

impl AttrRef {
    /// Builds a reference.
    pub fn new(owner: AttrOwner, index: usize) -> Self {
        Self { owner, index }
    }
}

/// A named attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    /// Attribute name.
    pub name: String,
    /// Backing file name, when different from the name.
    pub filename: Option<String>,
    /// Static value, only for context attributes.
    pub value: Option<String>,
}

impl Attr {
    /// Attribute with a name only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            value: None,
        }
    }

    /// Channel attribute with an explicit file name.
    pub fn with_filename(name: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: Some(filename.into()),
            value: None,
        }
    }

    /// Context attribute.
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            value: Some(value.into()),
        }
    }

    /// True for `*available` attributes.
    pub fn is_available_list(&self) -> bool {
        self.name.ends_with("available")
    }
}

/// Ordered attribute list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttrList {
    attrs: Vec<Attr>,
}

impl AttrList {
    /// Inserts keeping the list sorted by name. Duplicate names are rejected
    /// with [`Error::Busy`].
    pub fn insert(&mut self, attr: Attr) -> Result<usize> {
        match self.attrs.binary_search_by(|a| a.name.as_str().cmp(&attr.name)) {
            Ok(_) => Err(Error::Busy),
            Err(pos) => {
                self.attrs.insert(pos, attr);
                Ok(pos)
            }
        }
    }

    /// Attribute at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Attr> {
        self.attrs.get(idx)
    }

    /// Index of the attribute called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.attrs.binary_search_by(|a| a.name.as_str().cmp(name)).ok()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True when the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Iterates in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, Attr> {
        self.attrs.iter()
    }
}

impl<'a> IntoIterator for &'a AttrList {
    type Item = &'a Attr;
    type IntoIter = std::slice::Iter<'a, Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.iter()
    }
}

/// Parsed content of an `*_available` attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AvailableValues {
    /// `[min step max]`
    Range {
        /// Lower bound.
        min: f64,
        /// Increment.
        step: f64,
        /// Upper bound.
        max: f64,
    },
    /// Whitespace-separated token list.
    List(Vec<String>),
}

impl AvailableValues {
    /// Parses the raw value of an available attribute.
    ///
    /// Returns [`Error::NotSupported`] when the content is neither a
    /// three-number bracketed range nor a token list.
    pub fn parse(raw: &str) -> Result<Self> {
        let text = value_text(raw.as_bytes());
        let text = text.trim();

        if let Some(inner) = text.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or(Error::NotSupported)?;
            let nums: Vec<f64> = inner
                .split_whitespace()
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| Error::NotSupported)?;
            return match nums.as_slice() {
                [min, step, max] => Ok(AvailableValues::Range {
                    min: *min,
                    step: *step,
                    max: *max,
                }),
                _ => Err(Error::NotSupported),
            };
        }

        let tokens: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
        if tokens.is_empty() || tokens.iter().any(|t| t.contains(['[', ']'])) {
            return Err(Error::NotSupported);
        }
        Ok(AvailableValues::List(tokens))
    }
}

/// Text of a raw attribute value: stops at the first NUL and drops one
/// trailing newline.
pub fn value_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let s = String::from_utf8_lossy(&raw[..end]);
    s.strip_suffix('\n').unwrap_or(&*s).to_owned()
}

/// Parses an integer the way `strtoll(s, .., 0)` does: optional sign,
/// `0x` hexadecimal, leading-zero octal or decimal.
pub fn parse_longlong(raw: &[u8]) -> Result<i64> {
    let text = value_text(raw);
    let s = text.trim();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, body) = if let Some(h) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, h)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    if end == 0 {
        return Err(Error::InvalidArgument);
    }
    let magnitude = i128::from_str_radix(&body[..end], radix).map_err(|_| Error::InvalidArgument)?;
    let value = if neg { -magnitude } else { magnitude };
    i64::try_from(value).map_err(|_| Error::InvalidArgument)
}

/// Parses a floating point attribute value.
pub fn parse_double(raw: &[u8]) -> Result<f64> {
    let text = value_text(raw);
    text.trim()
        .parse()
        .map_err(|_| Error::InvalidArgument)
}

/// Composite "read-all" / "write-all" encoding: for each attribute a
/// big-endian `i32` length, the bytes, then padding to 4 bytes. A negative
/// length carries an errno for that attribute and no bytes.
pub mod packed {
    use crate::error::{Error, Result};

    /// One entry of a composite transfer.
    pub type Entry = std::result::Result<Vec<u8>, Error>;

    fn padding(len: usize) -> usize {
        (4 - len % 4) % 4
    }

    /// Encodes entries in index order.
    pub fn encode(entries: &[Entry]) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                Ok(bytes) => {
                    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    out.extend_from_slice(bytes);
                    out.resize(out.len() + padding(bytes.len()), 0);
                }
                Err(e) => out.extend_from_slice(&e.code().to_be_bytes()),
            }
        }
        out
    }

    /// Decodes exactly `count` entries.
    pub fn decode(mut data: &[u8], count: usize) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if data.len() < 4 {
                return Err(Error::InvalidArgument);
            }
            let len = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            data = &data[4..];
            if len < 0 {
                entries.push(Err(Error::from_code(len)));
                continue;
            }
            let len = len as usize;
            let padded = len + padding(len);
            if data.len() < len {
                return Err(Error::InvalidArgument);
            }
            entries.push(Ok(data[..len].to_vec()));
            data = &data[padded.min(data.len())..];
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_keeps_sorted() {
        let mut list = AttrList::default();
        list.insert(Attr::new("sampling_frequency")).unwrap();
        list.insert(Attr::new("enable")).unwrap();
        list.insert(Attr::new("raw")).unwrap();
        let names: Vec<_> = list.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["enable", "raw", "sampling_frequency"]);
        assert_eq!(list.find("raw"), Some(1));
        assert_eq!(list.insert(Attr::new("raw")), Err(Error::Busy));
    }

    #[test]
    fn test_available_range() {
        let v = AvailableValues::parse("[0 1 255]\n").unwrap();
        assert_eq!(
            v,
            AvailableValues::Range {
                min: 0.0,
                step: 1.0,
                max: 255.0
            }
        );
    }

    #[test]
    fn test_available_list() {
        let v = AvailableValues::parse("1000 2000\n4000").unwrap();
        assert_eq!(
            v,
            AvailableValues::List(vec!["1000".into(), "2000".into(), "4000".into()])
        );
    }

    #[test]
    fn test_available_rejects_malformed() {
        assert_eq!(AvailableValues::parse("[0 1]"), Err(Error::NotSupported));
        assert_eq!(AvailableValues::parse("[0 1 2"), Err(Error::NotSupported));
        assert_eq!(AvailableValues::parse(""), Err(Error::NotSupported));
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(b"250000000\n\0\0"), "250000000");
        assert_eq!(value_text(b"1\n"), "1");
        assert_eq!(value_text(b"abc"), "abc");
    }

    #[test]
    fn test_parse_longlong_bases() {
        assert_eq!(parse_longlong(b"42\n").unwrap(), 42);
        assert_eq!(parse_longlong(b"-0x10").unwrap(), -16);
        assert_eq!(parse_longlong(b"010").unwrap(), 8);
        assert_eq!(parse_longlong(b"0").unwrap(), 0);
        assert!(parse_longlong(b"abc").is_err());
    }

    #[test]
    fn test_packed_layout() {
        let data = packed::encode(&[Ok(b"abcde".to_vec()), Err(Error::NotFound), Ok(vec![])]);
        assert_eq!(&data[..4], &5i32.to_be_bytes());
        assert_eq!(&data[4..9], b"abcde");
        assert_eq!(&data[9..12], &[0, 0, 0]);
        assert_eq!(&data[12..16], &(-libc::ENOENT).to_be_bytes());
        assert_eq!(&data[16..20], &0i32.to_be_bytes());
        assert_eq!(data.len(), 20);
    }

    #[test]
    fn test_packed_decode_truncated() {
        assert!(packed::decode(&[0, 0, 0, 8, 1, 2], 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_packed_decode_inverts_encode(values in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..40), 0..8)
        ) {
            let entries: Vec<packed::Entry> = values.iter().cloned().map(Ok).collect();
            let data = packed::encode(&entries);
            prop_assert_eq!(data.len() % 4, 0);
            let back = packed::decode(&data, entries.len()).unwrap();
            prop_assert_eq!(back, entries);
        }
    }
}
