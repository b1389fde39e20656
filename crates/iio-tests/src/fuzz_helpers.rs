//! Seeded random inputs for protocol tests.

use iio_model::ChannelsMask;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reproducible generator of attribute values, masks and bogus opcodes.
pub struct FrameFuzzer {
    rng: StdRng,
    /// Seed the generator started from.
    pub seed: u64,
}

impl FrameFuzzer {
    /// Generator starting from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Random bytes.
    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.gen()).collect()
    }

    /// Printable attribute text of 1 to `max_len` characters, without NUL
    /// or newline.
    pub fn attr_value(&mut self, max_len: usize) -> String {
        let len = self.rng.gen_range(1..=max_len.max(1));
        (0..len)
            .map(|_| char::from(self.rng.gen_range(b' '..=b'~')))
            .collect()
    }

    /// Mask over `nb_channels` with at least one channel enabled.
    pub fn mask(&mut self, nb_channels: usize) -> ChannelsMask {
        let mut mask = ChannelsMask::new(nb_channels);
        if nb_channels == 0 {
            return mask;
        }
        mask.enable(self.rng.gen_range(0..nb_channels));
        for chn in 0..nb_channels {
            if self.rng.gen_bool(0.5) {
                mask.enable(chn);
            }
        }
        mask
    }

    /// An opcode byte no daemon assigns.
    pub fn unknown_opcode(&mut self) -> u8 {
        match self.rng.gen_range(0..4) {
            0 => 24,
            _ => self.rng.gen_range(26..=u8::MAX),
        }
    }

    /// A transfer length in `1..=size`.
    pub fn bytes_used(&mut self, size: usize) -> usize {
        self.rng.gen_range(1..=size.max(1))
    }
}
