//! Hardware events and their packed identifiers.
//!
//! An event travels as 16 little-endian bytes: a 64-bit id followed by a
//! 64-bit timestamp in nanoseconds. The id packs, from low to high bits:
//! channel (16), second channel (16), channel type (8), modifier (8),
//! direction (7), differential flag (1) and event type (8).

use crate::channel::{ChannelType, Modifier};
use crate::context::Device;
use crate::error::{Error, Result};

/// Size of one event on the wire.
pub const EVENT_SIZE: usize = 16;

/// Kind of condition that raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventType {
    Thresh,
    Mag,
    Roc,
    ThreshAdaptive,
    MagAdaptive,
    Change,
    MagReferenced,
    Gesture,
}

impl EventType {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => EventType::Thresh,
            1 => EventType::Mag,
            2 => EventType::Roc,
            3 => EventType::ThreshAdaptive,
            4 => EventType::MagAdaptive,
            5 => EventType::Change,
            6 => EventType::MagReferenced,
            7 => EventType::Gesture,
            _ => return None,
        })
    }

    /// Name used by the kernel in event attribute names.
    pub fn name(self) -> &'static str {
        match self {
            EventType::Thresh => "thresh",
            EventType::Mag => "mag",
            EventType::Roc => "roc",
            EventType::ThreshAdaptive => "thresh_adaptive",
            EventType::MagAdaptive => "mag_adaptive",
            EventType::Change => "change",
            EventType::MagReferenced => "mag_referenced",
            EventType::Gesture => "gesture",
        }
    }
}

/// Edge or gesture that raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventDirection {
    Either,
    Rising,
    Falling,
    None,
    SingleTap,
    DoubleTap,
}

impl EventDirection {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => EventDirection::Either,
            1 => EventDirection::Rising,
            2 => EventDirection::Falling,
            3 => EventDirection::None,
            4 => EventDirection::SingleTap,
            5 => EventDirection::DoubleTap,
            _ => return None,
        })
    }

    /// Name used by the kernel in event attribute names.
    pub fn name(self) -> &'static str {
        match self {
            EventDirection::Either => "either",
            EventDirection::Rising => "rising",
            EventDirection::Falling => "falling",
            EventDirection::None => "none",
            EventDirection::SingleTap => "singletap",
            EventDirection::DoubleTap => "doubletap",
        }
    }
}

/// One hardware event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event {
    /// Packed identifier.
    pub id: u64,
    /// Timestamp in nanoseconds.
    pub timestamp: i64,
}

impl Event {
    /// Packs the id fields. Used by backends that synthesize events.
    #[allow(clippy::too_many_arguments)]
    pub fn pack_id(
        chan_type: u8,
        modifier: u8,
        event_type: u8,
        direction: u8,
        chan: i16,
        chan2: i16,
        differential: bool,
    ) -> u64 {
        u64::from(chan as u16)
            | u64::from(chan2 as u16) << 16
            | u64::from(chan_type) << 32
            | u64::from(modifier) << 40
            | u64::from(direction & 0x7f) << 48
            | u64::from(differential) << 55
            | u64::from(event_type) << 56
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut out = [0u8; EVENT_SIZE];
        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Parses the wire representation.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < EVENT_SIZE {
            return Err(Error::InvalidArgument);
        }
        let mut id = [0u8; 8];
        let mut ts = [0u8; 8];
        id.copy_from_slice(&raw[..8]);
        ts.copy_from_slice(&raw[8..16]);
        Ok(Self {
            id: u64::from_le_bytes(id),
            timestamp: i64::from_le_bytes(ts),
        })
    }

    /// Channel type of the source channel.
    pub fn chan_type(&self) -> Option<ChannelType> {
        ChannelType::from_raw(((self.id >> 32) & 0xff) as u32)
    }

    /// Modifier of the source channel.
    pub fn modifier(&self) -> Option<Modifier> {
        Modifier::from_raw(((self.id >> 40) & 0xff) as u32)
    }

    /// Event type.
    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_raw(((self.id >> 56) & 0xff) as u8)
    }

    /// Event direction.
    pub fn direction(&self) -> Option<EventDirection> {
        EventDirection::from_raw(((self.id >> 48) & 0x7f) as u8)
    }

    /// True for events raised by a differential channel pair.
    pub fn is_differential(&self) -> bool {
        self.id & (1 << 55) != 0
    }

    /// Signed channel number, or the second channel when `diff` is set.
    pub fn channel_id(&self, diff: bool) -> i16 {
        if diff {
            (self.id >> 16) as u16 as i16
        } else {
            self.id as u16 as i16
        }
    }

    /// Resolves the channel of `dev` that raised this event.
    ///
    /// With `diff` set, the second channel of a differential pair is looked
    /// up instead; a non-differential event then has no such channel.
    pub fn find_channel(&self, dev: &Device, diff: bool) -> Option<usize> {
        if diff && !self.is_differential() {
            return None;
        }

        let chid = self.channel_id(diff);
        if chid < 0 || chid as usize >= dev.channels().len() {
            return None;
        }

        let raw_type = ((self.id >> 32) & 0xff) as u32;
        let raw_mod = ((self.id >> 40) & 0xff) as u32;

        dev.channels().iter().position(|chn| {
            if chn.type_raw() != raw_type || chn.modifier.raw() != raw_mod {
                return false;
            }
            if chn.id_is_alphabetic() && chid <= 0 {
                return true;
            }
            chid as u64 == chn.id_number()
        })
    }
}
