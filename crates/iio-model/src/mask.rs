//! Channel enable masks.

use crate::error::{Error, Result};

/// Fixed-width channel bit set, one bit per channel `number`.
///
/// On the wire the mask is `ceil(n / 32)` little-endian `u32` words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelsMask {
    nb_channels: usize,
    words: Vec<u32>,
}

impl ChannelsMask {
    /// Creates an empty mask able to hold `nb_channels` bits.
    pub fn new(nb_channels: usize) -> Self {
        Self {
            nb_channels,
            words: vec![0; nb_channels.div_ceil(32)],
        }
    }

    /// Number of channels this mask covers.
    pub fn len(&self) -> usize {
        self.nb_channels
    }

    /// True when the mask covers zero channels.
    pub fn is_empty(&self) -> bool {
        self.nb_channels == 0
    }

    /// Sets bit `number`. Out-of-range numbers are ignored.
    pub fn enable(&mut self, number: usize) {
        if number < self.nb_channels {
            self.words[number / 32] |= 1 << (number % 32);
        }
    }

    /// Clears bit `number`.
    pub fn disable(&mut self, number: usize) {
        if number < self.nb_channels {
            self.words[number / 32] &= !(1 << (number % 32));
        }
    }

    /// Tests bit `number`.
    pub fn is_enabled(&self, number: usize) -> bool {
        number < self.nb_channels && self.words[number / 32] & (1 << (number % 32)) != 0
    }

    /// Number of bits set.
    pub fn count_enabled(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// The raw words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Size of the wire representation in bytes.
    pub fn wire_size(&self) -> usize {
        self.words.len() * 4
    }

    /// Little-endian wire representation.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Parses the wire representation of a mask over `nb_channels`.
    /// Bits beyond the channel count are dropped.
    pub fn from_le_bytes(nb_channels: usize, bytes: &[u8]) -> Result<Self> {
        let mut mask = Self::new(nb_channels);
        if bytes.len() != mask.wire_size() {
            return Err(Error::InvalidArgument);
        }
        for (word, chunk) in mask.words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let extra = nb_channels % 32;
        if extra != 0 {
            if let Some(last) = mask.words.last_mut() {
                *last &= (1u32 << extra) - 1;
            }
        }
        Ok(mask)
    }

    /// Builds a mask from the low 64 bits of `bits`.
    pub fn from_bits(nb_channels: usize, bits: u64) -> Self {
        let mut mask = Self::new(nb_channels);
        for i in 0..nb_channels.min(64) {
            if bits & (1 << i) != 0 {
                mask.enable(i);
            }
        }
        mask
    }
}
