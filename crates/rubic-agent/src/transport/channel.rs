//! Channel registry: channel number to sink mapping.
//!
//! Channels are registered once, usually at service bring-up, and looked up
//! on every decoded byte run. Registration order is preserved and numbers
//! are unique; registering a taken number fails rather than replacing the
//! earlier sink.

// Layer 1: Standard library imports
use std::sync::{Arc, PoisonError, RwLock};

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use super::framing::PacketFlags;
use super::TransportError;

/// Receives decoded payload for one channel.
///
/// Packetized channels observe [`PacketFlags`] marking packet boundaries;
/// raw channels always observe the default flags with framing bytes already
/// stripped. A sink that cannot absorb bytes immediately simply keeps the
/// caller (the frame decoder) waiting, which is how inbound backpressure
/// propagates to the host link.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn deliver(&self, bytes: &[u8], flags: PacketFlags);
}

/// One registered channel.
pub struct Channel {
    number: u8,
    packetized: bool,
    sink: Arc<dyn ChannelSink>,
}

impl Channel {
    /// A channel whose sink observes packet boundaries.
    pub fn packetized(number: u8, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            number,
            packetized: true,
            sink,
        }
    }

    /// A channel delivering an unframed byte stream.
    pub fn raw(number: u8, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            number,
            packetized: false,
            sink,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn is_packetized(&self) -> bool {
        self.packetized
    }

    pub(crate) fn sink(&self) -> &Arc<dyn ChannelSink> {
        &self.sink
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("packetized", &self.packetized)
            .finish()
    }
}

/// Insertion-ordered channel table. Lookup is linear; registrations are few
/// and fixed shortly after boot.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel`, failing when its number is already taken.
    pub fn register(&self, channel: Channel) -> Result<Arc<Channel>, TransportError> {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if channels.iter().any(|c| c.number() == channel.number()) {
            return Err(TransportError::ChannelExists {
                number: channel.number(),
            });
        }
        let channel = Arc::new(channel);
        channels.push(channel.clone());
        Ok(channel)
    }

    /// Finds the channel registered under `number`.
    pub fn lookup(&self, number: u8) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.number() == number)
            .cloned()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ChannelRegistry")
            .field("count", &channels.len())
            .finish()
    }
}
