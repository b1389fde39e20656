#![warn(missing_docs)]

//! IIO object model: contexts, devices, channels, attributes, sample formats,
//! channel masks, hardware events and the XML context description.

pub mod attr;
pub mod channel;
pub mod context;
pub mod error;
pub mod event;
pub mod format;
pub mod mask;
pub mod xml;

pub use attr::{Attr, AttrList, AttrOwner, AttrRef, AvailableValues};
pub use channel::{Channel, ChannelType, Direction, Modifier};
pub use context::{Context, Device};
pub use error::{Error, Result};
pub use event::{Event, EventDirection, EventType, EVENT_SIZE};
pub use format::DataFormat;
pub use mask::ChannelsMask;
