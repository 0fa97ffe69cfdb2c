//! The host bridge: one serial link, many channels.
//!
//! `HostBridge` owns the writer half of the link behind the transport lock
//! and spawns a receiver loop that drives the [`FrameDecoder`] from the
//! reader half. Both halves are generic over tokio I/O traits so tests (and
//! alternative links) inject in-memory duplex streams the same way the
//! production build injects its serial device.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

// Layer 3: Internal module imports
use super::channel::{Channel, ChannelRegistry};
use super::framing::{push_escaped, FrameDecoder, CHANNEL_PREFIX, EOP_PREFIX, SOP};
use super::TransportError;

/// Read chunk size for the receiver loop.
const READ_BUFFER_LEN: usize = 256;

/// Outbound framing options for a single `source` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceFlags {
    /// Bracket the payload with SOP/EOP markers.
    pub packetized: bool,
    /// Re-emit the channel select prefix even if the destination matches
    /// the previous write.
    pub reset: bool,
}

impl SourceFlags {
    pub fn packetized() -> Self {
        Self {
            packetized: true,
            reset: false,
        }
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Outbound half of the bridge, as seen by channel implementations.
///
/// Sinks hold this as a trait object so they stay independent of the
/// concrete writer type behind the bridge.
#[async_trait]
pub trait HostSource: Send + Sync {
    /// Frames `bytes` for `channel` and writes them to the host link.
    async fn source(
        &self,
        channel: u8,
        bytes: &[u8],
        flags: SourceFlags,
    ) -> Result<(), TransportError>;
}

struct SourceState<W> {
    writer: W,
    /// Channel number of the previous write; a differing destination emits
    /// a channel select prefix.
    last_channel: Option<u8>,
}

/// Byte-oriented multiplexing bridge over one host link.
pub struct HostBridge<W> {
    registry: Arc<ChannelRegistry>,
    source: Arc<Mutex<SourceState<W>>>,
}

impl<W> Clone for HostBridge<W> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            source: self.source.clone(),
        }
    }
}

impl<W> HostBridge<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a bridge around the writer half of the link. Channels are
    /// registered afterwards, before traffic starts flowing.
    pub fn new(writer: W) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new()),
            source: Arc::new(Mutex::new(SourceState {
                writer,
                last_channel: None,
            })),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Registers a channel on this bridge.
    pub fn register_channel(&self, channel: Channel) -> Result<Arc<Channel>, TransportError> {
        self.registry.register(channel)
    }

    /// Spawns the receiver loop: reads link bytes and feeds the frame
    /// decoder until the reader reaches EOF or fails.
    pub fn start<R>(&self, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(registry);
            let mut buffer = [0u8; READ_BUFFER_LEN];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        tracing::debug!("host link closed, receiver loop exiting");
                        break;
                    }
                    Ok(read_len) => decoder.feed(&buffer[..read_len]).await,
                    Err(error) => {
                        tracing::warn!(%error, "host link read failed, receiver loop exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Frames `bytes` for `channel` and writes them out.
    ///
    /// The transport lock is held for exactly one call, so concurrent
    /// writers interleave only at packet boundaries. A channel select
    /// prefix is emitted when the destination differs from the previous
    /// write or `flags.reset` is set. With `flags.packetized` the payload
    /// is bracketed with SOP/EOP and escaped; without it, payload on a raw
    /// channel is still escaped, while a packetized channel passes bytes
    /// through untouched (its packets were framed by the caller).
    pub async fn source(
        &self,
        channel: &Channel,
        bytes: &[u8],
        flags: SourceFlags,
    ) -> Result<(), TransportError> {
        let mut state = self.source.lock().await;

        let mut out = BytesMut::with_capacity(bytes.len() * 2 + 4);
        if state.last_channel != Some(channel.number()) || flags.reset {
            out.put_u8(CHANNEL_PREFIX);
            push_escaped(&mut out, channel.number());
            state.last_channel = Some(channel.number());
        }

        if bytes.is_empty() {
            // Nothing beyond the channel select
        } else if channel.is_packetized() && !flags.packetized {
            out.put_slice(bytes);
        } else {
            if flags.packetized {
                out.put_u8(SOP);
            }
            let last = bytes.len() - 1;
            for (index, &byte) in bytes.iter().enumerate() {
                if flags.packetized && index == last {
                    out.put_u8(EOP_PREFIX);
                }
                push_escaped(&mut out, byte);
            }
        }

        state.writer.write_all(&out).await?;
        state.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> HostSource for HostBridge<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn source(
        &self,
        channel: u8,
        bytes: &[u8],
        flags: SourceFlags,
    ) -> Result<(), TransportError> {
        let Some(target) = self.registry.lookup(channel) else {
            return Err(TransportError::NoSuchChannel { number: channel });
        };
        HostBridge::source(self, &target, bytes, flags).await
    }
}

impl<W> std::fmt::Debug for HostBridge<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("registry", &self.registry)
            .finish()
    }
}
