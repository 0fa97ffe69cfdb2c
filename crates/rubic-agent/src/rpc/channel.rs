//! The RPC channel: packet reassembly into dispatchable jobs.
//!
//! Each packet on the RPC channel carries exactly one BSON request. The
//! document's own little-endian length prefix doubles as the frame length,
//! so assembly reads four bytes, sizes the job buffer once, and then fills
//! it until the end-of-packet marker lands on the final byte. Anything
//! else (oversized declarations, overruns, short packets) drops the job
//! silently, and assembly waits for the next packet.
//!
//! Accepted jobs go into a single-slot mailbox. While the slot is occupied
//! the sink simply blocks, which stops the frame decoder from consuming
//! further link bytes until the dispatcher catches up.

// Layer 1: Standard library imports
// (None)

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

// Layer 3: Internal module imports
use crate::bson::{read_i32_le, MIN_DOCUMENT_LEN};
use crate::transport::{Channel, ChannelRegistry, ChannelSink, PacketFlags, TransportError};

/// One reassembled request bound for dispatch.
#[derive(Debug)]
pub struct Job {
    doc: Vec<u8>,
}

impl Job {
    pub fn document(&self) -> &[u8] {
        &self.doc
    }

    pub(crate) fn into_document(self) -> Vec<u8> {
        self.doc
    }

    #[cfg(test)]
    pub(crate) fn from_document(doc: Vec<u8>) -> Self {
        Self { doc }
    }
}

enum Assembly {
    /// Accumulating the four-byte length prefix.
    Prefix { buf: [u8; 4], filled: usize },
    /// Filling the job buffer up to the declared length.
    Body { job: Vec<u8>, total: usize },
    /// Discarding the rest of a rejected packet.
    Dropping,
}

impl Assembly {
    fn reset() -> Self {
        Assembly::Prefix {
            buf: [0; 4],
            filled: 0,
        }
    }
}

struct RpcSink {
    max_request: usize,
    state: Mutex<Assembly>,
    jobs: mpsc::Sender<Job>,
}

#[async_trait]
impl ChannelSink for RpcSink {
    async fn deliver(&self, bytes: &[u8], flags: PacketFlags) {
        let mut state = self.state.lock().await;
        if flags.start {
            // A new packet abandons any half-assembled predecessor
            *state = Assembly::reset();
        }

        let last_index = bytes.len().saturating_sub(1);
        for (index, &byte) in bytes.iter().enumerate() {
            let ends_packet = flags.end && index == last_index;

            match &mut *state {
                Assembly::Prefix { buf, filled } => {
                    buf[*filled] = byte;
                    *filled += 1;
                    if *filled == 4 {
                        let declared = read_i32_le(&buf[..], 0)
                            .and_then(|v| usize::try_from(v).ok())
                            .unwrap_or(0);
                        if declared < MIN_DOCUMENT_LEN || declared > self.max_request {
                            tracing::debug!(declared, "dropping oversized or short request");
                            *state = Assembly::Dropping;
                        } else {
                            let mut job = Vec::with_capacity(declared);
                            job.extend_from_slice(&buf[..]);
                            *state = Assembly::Body {
                                job,
                                total: declared,
                            };
                        }
                    }
                    if ends_packet {
                        // Shorter than its own length prefix: drop
                        *state = Assembly::reset();
                    }
                }
                Assembly::Body { job, total } => {
                    job.push(byte);
                    if job.len() == *total {
                        if ends_packet {
                            let doc = std::mem::take(job);
                            *state = Assembly::reset();
                            if self.jobs.send(Job { doc }).await.is_err() {
                                tracing::warn!("job mailbox closed, dropping request");
                            }
                        } else {
                            tracing::debug!(total = *total, "packet overruns its declared length");
                            *state = Assembly::Dropping;
                        }
                    } else if ends_packet {
                        tracing::debug!(
                            got = job.len(),
                            total = *total,
                            "packet ended before its declared length"
                        );
                        *state = Assembly::reset();
                    }
                }
                Assembly::Dropping => {
                    if ends_packet {
                        *state = Assembly::reset();
                    }
                }
            }
        }
    }
}

/// Registers the RPC channel and returns the job mailbox receiver.
///
/// The mailbox holds a single job; the dispatcher side consumes it through
/// the returned receiver.
pub fn register(
    registry: &ChannelRegistry,
    number: u8,
    max_request: usize,
) -> Result<mpsc::Receiver<Job>, TransportError> {
    let (jobs, receiver) = mpsc::channel(1);
    registry.register(Channel::packetized(
        number,
        std::sync::Arc::new(RpcSink {
            max_request,
            state: Mutex::new(Assembly::reset()),
            jobs,
        }),
    ))?;
    Ok(receiver)
}
