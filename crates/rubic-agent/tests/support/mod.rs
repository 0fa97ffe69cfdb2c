//! Shared helpers for the integration tests: a host-side packet collector
//! and encoders for host-originated frames and request documents.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use rubic_agent::bson::{get_props, DocumentBuilder, Prop};
use rubic_agent::transport::framing::{
    needs_escape, CHANNEL_PREFIX, EOP_PREFIX, ESCAPE_PREFIX, ESCAPE_XOR, SOP,
};
use rubic_agent::transport::{ChannelSink, PacketFlags};

/// Host-side sink that reassembles whole packets from one channel.
pub struct PacketCollector {
    packets: Mutex<VecDeque<Vec<u8>>>,
    partial: Mutex<Vec<u8>>,
    arrived: Notify,
}

impl PacketCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packets: Mutex::new(VecDeque::new()),
            partial: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        })
    }

    /// Next complete packet, waiting for it to arrive.
    pub async fn next(&self) -> Vec<u8> {
        loop {
            if let Some(packet) = self.packets.lock().unwrap().pop_front() {
                return packet;
            }
            self.arrived.notified().await;
        }
    }

    /// Non-blocking pop, for asserting that nothing arrived.
    pub fn try_next(&self) -> Option<Vec<u8>> {
        self.packets.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl ChannelSink for PacketCollector {
    async fn deliver(&self, bytes: &[u8], flags: PacketFlags) {
        let mut partial = self.partial.lock().unwrap();
        if flags.start {
            partial.clear();
        }
        partial.extend_from_slice(bytes);
        if flags.end {
            let packet = std::mem::take(&mut *partial);
            drop(partial);
            self.packets.lock().unwrap().push_back(packet);
            self.arrived.notify_one();
        }
    }
}

/// Escapes one byte into `out` the way the wire format requires.
pub fn escape_into(out: &mut Vec<u8>, byte: u8) {
    if needs_escape(byte) {
        out.push(ESCAPE_PREFIX);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

/// Frames one host-originated packet for `channel`.
pub fn frame_packet(channel: u8, payload: &[u8]) -> Vec<u8> {
    assert!(!payload.is_empty(), "frames carry at least one payload byte");
    let mut out = Vec::with_capacity(payload.len() * 2 + 4);
    out.push(CHANNEL_PREFIX);
    escape_into(&mut out, channel);
    out.push(SOP);
    let last = payload.len() - 1;
    for (index, &byte) in payload.iter().enumerate() {
        if index == last {
            out.push(EOP_PREFIX);
        }
        escape_into(&mut out, byte);
    }
    out
}

/// Builds a request document with optional id and params.
pub fn request(method: &str, id: Option<i32>, params: Option<&[u8]>) -> Vec<u8> {
    let mut doc = DocumentBuilder::with_limit(1024);
    doc.append_str("jsonrpc", "2.0").unwrap();
    doc.append_str("method", method).unwrap();
    if let Some(params) = params {
        doc.append_document("params", params).unwrap();
    }
    if let Some(id) = id {
        doc.append_i32("id", id).unwrap();
    }
    doc.into_bytes()
}

/// Offset of `key` in `doc`, if present.
pub fn field_offset(doc: &[u8], key: &str) -> Option<usize> {
    let mut props = [Prop::new(key)];
    get_props(doc, &mut props);
    props[0].offset
}
