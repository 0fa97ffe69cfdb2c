//! Wire framing: special bytes, escaping, and the receive-side decoder.
//!
//! Four byte values are reserved on the link. Any payload byte falling into
//! the reserved range travels as `ESCAPE_PREFIX` followed by the byte XORed
//! with [`ESCAPE_XOR`], so the stream stays 8-bit clean for every payload
//! value.
//!
//! The decoder is a byte-at-a-time state machine: feeding it one byte at a
//! time produces exactly the same sink output as feeding the whole stream
//! in one call, which is what makes it safe to drive straight from a serial
//! driver's arbitrary read chunking.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use bytes::{BufMut, BytesMut};

// Layer 3: Internal module imports
use super::channel::{Channel, ChannelRegistry};

/// Start of packet.
pub const SOP: u8 = 0x7a;
/// The next unescaped payload byte is the last byte of the packet.
pub const EOP_PREFIX: u8 = 0x7b;
/// The next unescaped byte selects the destination channel.
pub const CHANNEL_PREFIX: u8 = 0x7c;
/// The next byte is payload, XORed with [`ESCAPE_XOR`].
pub const ESCAPE_PREFIX: u8 = 0x7d;
/// XOR mask applied to escaped bytes.
pub const ESCAPE_XOR: u8 = 0x20;

/// True for byte values that must be escaped on the wire.
pub const fn needs_escape(byte: u8) -> bool {
    SOP <= byte && byte <= ESCAPE_PREFIX
}

/// Packet boundary markers accompanying each payload run delivered to a
/// packetized sink. Raw sinks always observe the default (no markers).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// The first byte of this run is the first byte of a packet.
    pub start: bool,
    /// The last byte of this run is the last byte of the packet.
    pub end: bool,
}

/// Appends `byte` to `out`, escaping it when it collides with framing.
pub(crate) fn push_escaped(out: &mut BytesMut, byte: u8) {
    if needs_escape(byte) {
        out.put_u8(ESCAPE_PREFIX);
        out.put_u8(byte ^ ESCAPE_XOR);
    } else {
        out.put_u8(byte);
    }
}

/// Receive-side framing state machine.
///
/// Payload is buffered into short runs and handed to the current channel's
/// sink: on packet end, on a channel switch, and at the end of each `feed`
/// call. Escape and channel-prefix state persists across `feed` boundaries,
/// so the input may be chunked arbitrarily.
pub struct FrameDecoder {
    registry: Arc<ChannelRegistry>,
    current: Option<Arc<Channel>>,
    /// Next unescaped byte selects the channel.
    channel_pending: bool,
    /// Next byte is payload XOR `ESCAPE_XOR`.
    escape_pending: bool,
    /// A packet is open on the current (packetized) channel.
    in_packet: bool,
    /// The next payload byte is the last of the packet.
    eop_pending: bool,
    /// The next payload byte is the first of the packet.
    start_pending: bool,
    run: Vec<u8>,
    run_starts_packet: bool,
}

impl FrameDecoder {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            current: None,
            channel_pending: false,
            escape_pending: false,
            in_packet: false,
            eop_pending: false,
            start_pending: false,
            run: Vec::new(),
            run_starts_packet: false,
        }
    }

    /// Advances the state machine over `bytes`, delivering decoded payload
    /// to the registered sinks.
    pub async fn feed(&mut self, bytes: &[u8]) {
        for &raw in bytes {
            let payload = if self.escape_pending {
                self.escape_pending = false;
                raw ^ ESCAPE_XOR
            } else {
                match raw {
                    CHANNEL_PREFIX => {
                        // Flush buffered payload before the switch takes effect
                        self.flush(PacketFlags::default()).await;
                        self.channel_pending = true;
                        continue;
                    }
                    ESCAPE_PREFIX => {
                        self.escape_pending = true;
                        continue;
                    }
                    SOP if !self.channel_pending => {
                        if self.current_is_packetized() {
                            // A second SOP mid-packet restarts without EOP
                            self.flush(PacketFlags::default()).await;
                            self.in_packet = true;
                            self.eop_pending = false;
                            self.start_pending = true;
                        }
                        continue;
                    }
                    EOP_PREFIX if !self.channel_pending => {
                        if self.in_packet {
                            self.eop_pending = true;
                        }
                        continue;
                    }
                    other => other,
                }
            };

            if self.channel_pending {
                self.channel_pending = false;
                self.switch_channel(payload).await;
                continue;
            }

            let Some(channel) = self.current.as_ref() else {
                // No destination selected: discard
                continue;
            };

            if channel.is_packetized() {
                if !self.in_packet {
                    continue;
                }
                if self.start_pending {
                    self.start_pending = false;
                    self.run_starts_packet = self.run.is_empty();
                }
                self.run.push(payload);
                if self.eop_pending {
                    self.eop_pending = false;
                    self.in_packet = false;
                    self.flush(PacketFlags {
                        start: false,
                        end: true,
                    })
                    .await;
                }
            } else {
                self.run.push(payload);
            }
        }

        // Hand over whatever this chunk produced; boundaries between feed
        // calls must not change the concatenated sink output
        self.flush(PacketFlags::default()).await;
    }

    fn current_is_packetized(&self) -> bool {
        self.current
            .as_ref()
            .map(|channel| channel.is_packetized())
            .unwrap_or(false)
    }

    async fn switch_channel(&mut self, number: u8) {
        // A switch mid-packet closes the packet without asserting EOP
        self.flush(PacketFlags::default()).await;
        self.in_packet = false;
        self.eop_pending = false;
        self.start_pending = false;
        self.current = self.registry.lookup(number);
        if self.current.is_none() {
            tracing::trace!(number, "bytes for unregistered channel will be discarded");
        }
    }

    async fn flush(&mut self, mut flags: PacketFlags) {
        if self.run.is_empty() {
            return;
        }
        flags.start = self.run_starts_packet;
        self.run_starts_packet = false;
        if let Some(channel) = self.current.as_ref() {
            channel.sink().deliver(&self.run, flags).await;
        }
        self.run.clear();
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field(
                "current",
                &self.current.as_ref().map(|channel| channel.number()),
            )
            .field("channel_pending", &self.channel_pending)
            .field("escape_pending", &self.escape_pending)
            .field("in_packet", &self.in_packet)
            .finish()
    }
}
