//! Strict-subset BSON wire codec.
//!
//! Every message on the RPC channel is one BSON document: a little-endian
//! `int32` total length, a sequence of `{type, cstring key, value}` elements,
//! and a trailing `0x00` terminator. The total length includes itself and the
//! terminator.
//!
//! The codec is split the way it is used:
//!
//! - [`reader`]: batch offset scanning ([`get_props`]) plus typed getters
//!   that bounds-check everything and fall back to caller defaults. A
//!   malformed document reads as "every key missing"; the reader never
//!   panics and never returns partial garbage.
//! - [`writer`]: an append-only [`DocumentBuilder`] over a buffer sized once
//!   up front, with `measure` twins so callers can compute that size exactly
//!   before building.
//!
//! `serde` is deliberately not involved: the agent controls every byte it
//! emits, and ingress documents come from an untrusted host link.
//!
//! # Examples
//!
//! ```rust
//! use rubic_agent::bson::{get_props, get_str, DocumentBuilder, Prop};
//!
//! let mut doc = DocumentBuilder::with_limit(64);
//! doc.append_str("method", "rubic.info").unwrap();
//! let doc = doc.into_bytes();
//!
//! let mut props = [Prop::new("method")];
//! get_props(&doc, &mut props);
//! assert_eq!(get_str(&doc, props[0].offset, ""), "rubic.info");
//! ```

pub mod reader;
pub mod writer;

pub use reader::{
    get_binary, get_bool, get_document, get_f64, get_i32, get_props, get_str, Prop,
};
pub use writer::{measure, BuildError, DocumentBuilder};

/// Element type tags of the recognized wire subset.
pub(crate) mod elem {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const BOOLEAN: u8 = 0x08;
    pub const NULL: u8 = 0x0a;
    pub const INT32: u8 = 0x10;
}

/// The shortest legal document: a length of five and the terminator.
pub const EMPTY_DOCUMENT: [u8; 5] = [5, 0, 0, 0, 0];

/// Minimum legal document length in bytes.
pub const MIN_DOCUMENT_LEN: usize = EMPTY_DOCUMENT.len();

/// Generic binary subtype used for all agent-originated binary values.
pub const BINARY_SUBTYPE_GENERIC: u8 = 0x00;

/// Checked little-endian `i32` read at `at`.
pub(crate) fn read_i32_le(bytes: &[u8], at: usize) -> Option<i32> {
    let raw = bytes.get(at..at + 4)?;
    Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Checked little-endian `f64` read at `at`.
pub(crate) fn read_f64_le(bytes: &[u8], at: usize) -> Option<f64> {
    let raw = bytes.get(at..at + 8)?;
    let mut octets = [0u8; 8];
    octets.copy_from_slice(raw);
    Some(f64::from_le_bytes(octets))
}

pub(crate) fn write_i32_le(bytes: &mut [u8], at: usize, value: i32) {
    if let Some(raw) = bytes.get_mut(at..at + 4) {
        raw.copy_from_slice(&value.to_le_bytes());
    }
}

/// Validates the framing of the document at the start of `doc` and returns
/// its declared total length.
///
/// `doc` may be a larger buffer; only the leading `total_length` bytes are
/// considered. Returns `None` when the declared length is shorter than the
/// minimum, runs past the buffer, or the terminator byte is missing.
pub fn document_len(doc: &[u8]) -> Option<usize> {
    let declared = read_i32_le(doc, 0)?;
    let total = usize::try_from(declared).ok()?;
    if total < MIN_DOCUMENT_LEN || total > doc.len() {
        return None;
    }
    if doc[total - 1] != 0x00 {
        return None;
    }
    Some(total)
}

/// Size in bytes of the element value of type `ty` starting at `at`,
/// including any length prefixes the type carries.
///
/// `doc` must already be bounded to the document's total length. Types
/// outside the recognized subset are still skippable so foreign elements in
/// an ingress document do not poison the scan. Returns `None` for a value
/// that is malformed or runs into the terminator.
pub(crate) fn measure_value(doc: &[u8], ty: u8, at: usize) -> Option<usize> {
    let end = doc.len();
    let as_len = |declared: i32| -> Option<usize> { usize::try_from(declared).ok() };
    let len = match ty {
        0x01 | 0x09 | 0x11 | 0x12 => 8,
        // String-likes: int32 byte count (incl. NUL) then the bytes
        0x02 | 0x0d | 0x0e | 0x0f => 4 + as_len(read_i32_le(doc, at)?)?,
        // Embedded document / array: the declared length covers everything
        0x03 | 0x04 => as_len(read_i32_le(doc, at)?)?,
        // Binary: int32 length, subtype byte, payload
        0x05 => 4 + 1 + as_len(read_i32_le(doc, at)?)?,
        0x06 | 0x0a => 0,
        0x07 => 12,
        0x08 => 1,
        // Regular expression: two cstrings
        0x0b => {
            let first = doc.get(at..end)?.iter().position(|&b| b == 0)?;
            let rest = at + first + 1;
            let second = doc.get(rest..end)?.iter().position(|&b| b == 0)?;
            first + 1 + second + 1
        }
        0x0c => 4 + 12 + as_len(read_i32_le(doc, at)?)?,
        0x10 => 4,
        0x13 => 16,
        _ => return None,
    };
    // The value must leave room for the document terminator
    if at.checked_add(len)? < end {
        Some(len)
    } else {
        None
    }
}
