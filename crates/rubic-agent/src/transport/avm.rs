//! Channel 0: read-only memory-inspection transactions.
//!
//! The host issues fixed 8-byte transaction headers; the agent answers on
//! the same channel with the header's code high bit inverted. Only reads
//! inside the configured window are served; writes are refused and
//! out-of-window reads answer with a single zero byte. The window is an
//! ordinary owned buffer published at registration; nothing here touches
//! raw addresses.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::Mutex;

// Layer 3: Internal module imports
use super::bridge::{HostSource, SourceFlags};
use super::channel::{Channel, ChannelRegistry, ChannelSink};
use super::framing::PacketFlags;
use super::TransportError;

/// The introspection channel is always channel 0.
pub const AVM_CHANNEL_NUMBER: u8 = 0x00;

const HEADER_LEN: usize = 8;

const CODE_WRITE: u8 = 0x00;
const CODE_WRITE_INCREMENTING: u8 = 0x04;
const CODE_READ: u8 = 0x10;
const CODE_READ_INCREMENTING: u8 = 0x14;
const CODE_NO_TRANSACTION: u8 = 0x7f;

/// Reply code: request code with the high bit inverted.
const CODE_REPLY_BIT: u8 = 0x80;

#[derive(Default)]
struct AvmState {
    header: [u8; HEADER_LEN],
    filled: usize,
}

/// The built-in packetized sink behind channel 0.
pub struct AvmChannel {
    source: Arc<dyn HostSource>,
    window_base: u32,
    window: Vec<u8>,
    state: Mutex<AvmState>,
}

impl AvmChannel {
    /// Registers the introspection channel. `window` becomes readable at
    /// addresses `[window_base, window_base + window.len())`.
    pub fn register(
        registry: &ChannelRegistry,
        source: Arc<dyn HostSource>,
        window_base: u32,
        window: Vec<u8>,
    ) -> Result<Arc<Channel>, TransportError> {
        let sink = Arc::new(Self {
            source,
            window_base,
            window,
            state: Mutex::new(AvmState::default()),
        });
        registry.register(Channel::packetized(AVM_CHANNEL_NUMBER, sink))
    }

    async fn respond(&self, header: [u8; HEADER_LEN], complete: bool) {
        let code = header[0];
        let mut reply = header;
        reply[0] = code ^ CODE_REPLY_BIT;
        reply[1] = 0x00;

        let mut flags = SourceFlags::packetized();
        if code == CODE_NO_TRANSACTION {
            flags = flags.with_reset();
        }

        let result = match code {
            CODE_READ | CODE_READ_INCREMENTING if complete => {
                let size = u16::from_be_bytes([header[2], header[3]]) as usize;
                let address = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
                let window_end = u64::from(self.window_base) + self.window.len() as u64;
                if u64::from(address) < u64::from(self.window_base)
                    || u64::from(address) + size as u64 > window_end
                {
                    // Out of range: a single zero byte
                    self.source
                        .source(AVM_CHANNEL_NUMBER, &[0x00], flags)
                        .await
                } else {
                    let offset = (address - self.window_base) as usize;
                    self.source
                        .source(AVM_CHANNEL_NUMBER, &self.window[offset..offset + size], flags)
                        .await
                }
            }
            CODE_WRITE | CODE_WRITE_INCREMENTING if complete => {
                tracing::debug!(code, "rejecting write transaction on channel 0");
                reply[2] = 0x00;
                reply[3] = 0x00;
                self.source
                    .source(AVM_CHANNEL_NUMBER, &reply[..4], flags)
                    .await
            }
            _ => {
                // No transaction, unknown code, or a short header
                reply[2] = 0x00;
                reply[3] = 0x00;
                self.source
                    .source(AVM_CHANNEL_NUMBER, &reply[..4], flags)
                    .await
            }
        };

        if let Err(error) = result {
            tracing::warn!(%error, "failed to emit channel 0 reply");
        }
    }
}

#[async_trait]
impl ChannelSink for AvmChannel {
    async fn deliver(&self, bytes: &[u8], flags: PacketFlags) {
        let mut state = self.state.lock().await;
        if flags.start {
            state.filled = 0;
        }
        for &byte in bytes {
            if state.filled < HEADER_LEN {
                let at = state.filled;
                state.header[at] = byte;
                state.filled += 1;
            }
            // Payload past the header is ignored; reads carry none
        }
        if !flags.end {
            return;
        }

        let header = state.header;
        let complete = state.filled == HEADER_LEN;
        state.filled = 0;
        drop(state);

        self.respond(header, complete).await;
    }
}

impl std::fmt::Debug for AvmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvmChannel")
            .field("window_base", &self.window_base)
            .field("window_len", &self.window.len())
            .finish()
    }
}
