//! Dynamically registered byte-pipe channels.
//!
//! A pipe gives in-agent code a plain read/write byte stream multiplexed
//! over the host link: host bytes arriving on the channel land in a bounded
//! buffer for the reader, and writes go out unpacketized on the same
//! channel. When the buffer is full, excess input is dropped; the host
//! side is expected to pace itself.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

// Layer 3: Internal module imports
use super::bridge::{HostSource, SourceFlags};
use super::channel::{Channel, ChannelRegistry, ChannelSink};
use super::framing::PacketFlags;
use super::TransportError;

struct PipeShared {
    capacity: usize,
    buffer: Mutex<VecDeque<u8>>,
    readable: Notify,
}

struct PipeSink {
    shared: Arc<PipeShared>,
}

#[async_trait]
impl ChannelSink for PipeSink {
    async fn deliver(&self, bytes: &[u8], _flags: PacketFlags) {
        let mut buffer = self.shared.buffer.lock().await;
        let free = self.shared.capacity - buffer.len();
        let take = bytes.len().min(free);
        buffer.extend(&bytes[..take]);
        drop(buffer);

        if take < bytes.len() {
            tracing::debug!(dropped = bytes.len() - take, "pipe buffer full, dropping input");
        }
        if take > 0 {
            self.shared.readable.notify_one();
        }
    }
}

/// Reading half of a pipe channel.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Reads up to `out.len()` buffered bytes, waiting until at least one
    /// byte is available.
    pub async fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        loop {
            {
                let mut buffer = self.shared.buffer.lock().await;
                if !buffer.is_empty() {
                    let take = out.len().min(buffer.len());
                    for slot in out.iter_mut().take(take) {
                        // Capacity-bounded pop; cannot fail while non-empty
                        *slot = buffer.pop_front().unwrap_or_default();
                    }
                    return take;
                }
            }
            self.shared.readable.notified().await;
        }
    }
}

/// Writing half of a pipe channel.
pub struct PipeWriter {
    source: Arc<dyn HostSource>,
    number: u8,
}

impl PipeWriter {
    /// Writes `bytes` to the host on this pipe's channel.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.source
            .source(self.number, bytes, SourceFlags::default())
            .await
    }
}

/// Registers a raw pipe channel and returns its two halves.
pub fn register(
    registry: &ChannelRegistry,
    source: Arc<dyn HostSource>,
    number: u8,
    capacity: usize,
) -> Result<(PipeReader, PipeWriter), TransportError> {
    let shared = Arc::new(PipeShared {
        capacity: capacity.max(1),
        buffer: Mutex::new(VecDeque::new()),
        readable: Notify::new(),
    });
    registry.register(Channel::raw(
        number,
        Arc::new(PipeSink {
            shared: shared.clone(),
        }),
    ))?;
    Ok((
        PipeReader { shared },
        PipeWriter { source, number },
    ))
}
