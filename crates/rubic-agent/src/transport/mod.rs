//! Byte-oriented multiplexing transport.
//!
//! One serial byte link carries up to 256 logical channels. The framing
//! codec ([`framing`]) understands the four special bytes (start-of-packet,
//! end-of-packet prefix, channel prefix, escape prefix) and routes decoded
//! payload to per-channel sinks ([`channel`]). [`bridge`] ties a reader and
//! a writer half together: the receiver loop feeds the decoder, and
//! `source` frames outbound bytes under the transport lock.
//!
//! Built-in sinks live alongside: the read-only memory-inspection channel
//! ([`avm`], channel 0) and dynamically registered byte pipes ([`pipe`]).

// Layer 1: Standard library imports
// (None at the module root)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (None at the module root)

pub mod avm;
pub mod bridge;
pub mod channel;
pub mod framing;
pub mod pipe;

pub use bridge::{HostBridge, HostSource, SourceFlags};
pub use channel::{Channel, ChannelRegistry, ChannelSink};
pub use framing::{FrameDecoder, PacketFlags};

/// Transport-level error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O failure on the host link.
    #[error("host link I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A channel number was registered twice.
    #[error("channel {number} is already registered")]
    ChannelExists { number: u8 },

    /// Outbound data was sourced on an unregistered channel.
    #[error("channel {number} is not registered")]
    NoSuchChannel { number: u8 },
}
