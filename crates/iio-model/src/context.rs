//! Contexts and devices.
//!
//! A [`Context`] owns its devices, a device owns its channels. Cross
//! references are plain indices: device index is the position in the
//! context's sorted device list, channel index the position in the device's
//! sorted channel list. Indices never change once the context is built.

use std::cmp::Ordering;

use crate::attr::{Attr, AttrList, AttrOwner, AttrRef};
use crate::channel::{Channel, Direction};
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;

/// One IIO device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Stable identifier (`iio:device0`, `trigger1`, ...).
    pub id: String,
    /// Optional name.
    pub name: Option<String>,
    /// Optional label.
    pub label: Option<String>,
    channels: Vec<Channel>,
    /// Device attributes.
    pub attrs: AttrList,
    /// Debug attributes.
    pub debug_attrs: AttrList,
    /// Buffer attributes, shared by every buffer of the device.
    pub buffer_attrs: AttrList,
}

fn channel_order(a: &Channel, b: &Channel) -> Ordering {
    match (a.index < 0, b.index < 0) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a
            .index
            .cmp(&b.index)
            .then(a.format.shift.cmp(&b.format.shift)),
    }
}

impl Device {
    /// Creates an empty device.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            label: None,
            channels: Vec::new(),
            attrs: AttrList::default(),
            debug_attrs: AttrList::default(),
            buffer_attrs: AttrList::default(),
        }
    }

    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a channel, keeping the list sorted by `(index, shift)` with
    /// non-scan channels last, then renumbers every channel.
    pub fn add_channel(&mut self, chn: Channel) -> usize {
        let pos = self
            .channels
            .iter()
            .position(|c| channel_order(&chn, c) == Ordering::Less)
            .unwrap_or(self.channels.len());
        self.channels.insert(pos, chn);
        for (i, c) in self.channels.iter_mut().enumerate() {
            c.number = i;
        }
        pos
    }

    /// Sorted channels.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Mutable access to a channel, for adding attributes.
    pub fn channel_mut(&mut self, idx: usize) -> Option<&mut Channel> {
        self.channels.get_mut(idx)
    }

    /// Channel at `idx`.
    pub fn channel(&self, idx: usize) -> Option<&Channel> {
        self.channels.get(idx)
    }

    /// Finds a channel by id (or name) and direction.
    pub fn find_channel(&self, id: &str, direction: Direction) -> Option<usize> {
        self.channels.iter().position(|c| {
            c.direction == direction && (c.id == id || c.name.as_deref() == Some(id))
        })
    }

    /// A trigger is a channel-less device whose id starts with `trigger`.
    pub fn is_trigger(&self) -> bool {
        self.channels.is_empty() && self.id.starts_with("trigger")
    }

    /// An empty mask sized for this device.
    pub fn create_mask(&self) -> ChannelsMask {
        ChannelsMask::new(self.channels.len())
    }

    /// A buffer created with `mask` streams towards the device when any
    /// enabled scan element is an output.
    pub fn is_tx(&self, mask: &ChannelsMask) -> bool {
        self.channels
            .iter()
            .any(|c| c.is_output() && c.is_scan_element && mask.is_enabled(c.number))
    }

    /// Bytes taken by one sample of every channel enabled in `mask`.
    ///
    /// Channels sharing a scan index share storage; each storage slot is
    /// aligned to its own width and the total is aligned to the widest slot.
    pub fn sample_size(&self, mask: &ChannelsMask) -> Result<usize> {
        if mask.len() != self.channels.len() {
            return Err(Error::InvalidArgument);
        }

        let mut size = 0usize;
        let mut largest = 1usize;
        let mut prev: Option<&Channel> = None;

        for chn in &self.channels {
            if chn.index < 0 {
                break;
            }
            if !mask.is_enabled(chn.number) {
                continue;
            }
            if prev.is_some_and(|p| p.index == chn.index) {
                prev = Some(chn);
                continue;
            }

            let length = chn.format.storage_bytes();
            if length == 0 {
                prev = Some(chn);
                continue;
            }
            largest = largest.max(length);
            let step = if size % length != 0 {
                length
                    .checked_mul(2)
                    .map(|twice| twice - size % length)
            } else {
                Some(length)
            };
            size = step
                .and_then(|step| size.checked_add(step))
                .ok_or(Error::InvalidArgument)?;
            prev = Some(chn);
        }

        if size % largest != 0 {
            size = size
                .checked_add(largest - size % largest)
                .ok_or(Error::InvalidArgument)?;
        }
        Ok(size)
    }
}

/// Root of the object model.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    /// Backend tag (`local`, `xml`, `network`...).
    pub name: String,
    /// Human readable description.
    pub description: Option<String>,
    attrs: AttrList,
    devices: Vec<Device>,
}

impl Context {
    /// Creates an empty context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            attrs: AttrList::default(),
            devices: Vec::new(),
        }
    }

    /// Adds a device, keeping the list sorted by id. Returns its index.
    pub fn add_device(&mut self, dev: Device) -> Result<usize> {
        match self.devices.binary_search_by(|d| d.id.as_str().cmp(&dev.id)) {
            Ok(_) => Err(Error::Busy),
            Err(pos) => {
                self.devices.insert(pos, dev);
                Ok(pos)
            }
        }
    }

    /// Adds a context attribute with its static value.
    pub fn add_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<usize> {
        self.attrs.insert(Attr::with_value(name, value))
    }

    /// Context attributes.
    pub fn attrs(&self) -> &AttrList {
        &self.attrs
    }

    /// Sorted devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Device at `idx`.
    pub fn device(&self, idx: usize) -> Option<&Device> {
        self.devices.get(idx)
    }

    /// Mutable device at `idx`.
    pub fn device_mut(&mut self, idx: usize) -> Option<&mut Device> {
        self.devices.get_mut(idx)
    }

    /// Finds a device by id, then name, then label.
    pub fn find_device(&self, name: &str) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.id == name)
            .or_else(|| self.devices.iter().position(|d| d.name.as_deref() == Some(name)))
            .or_else(|| self.devices.iter().position(|d| d.label.as_deref() == Some(name)))
    }

    /// The attribute list owned by `owner`.
    pub fn attr_list(&self, owner: AttrOwner) -> Option<&AttrList> {
        match owner {
            AttrOwner::Context => Some(&self.attrs),
            AttrOwner::Device(dev) => self.device(dev).map(|d| &d.attrs),
            AttrOwner::Debug(dev) => self.device(dev).map(|d| &d.debug_attrs),
            AttrOwner::Buffer { dev, .. } => self.device(dev).map(|d| &d.buffer_attrs),
            AttrOwner::Channel { dev, chn } => self
                .device(dev)
                .and_then(|d| d.channel(chn))
                .map(|c| &c.attrs),
        }
    }

    /// Resolves an attribute reference.
    pub fn attr(&self, r: AttrRef) -> Option<&Attr> {
        self.attr_list(r.owner).and_then(|l| l.get(r.index))
    }

    /// Looks an attribute up by name within `owner`.
    pub fn find_attr(&self, owner: AttrOwner, name: &str) -> Option<AttrRef> {
        self.attr_list(owner)
            .and_then(|l| l.find(name))
            .map(|index| AttrRef::new(owner, index))
    }
}
