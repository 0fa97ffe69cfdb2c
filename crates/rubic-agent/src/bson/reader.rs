//! Read-side BSON accessors.
//!
//! Reading is two-phase, mirroring how the dispatcher consumes a request:
//! one left-to-right [`get_props`] scan records the byte offsets of the
//! elements of interest, then typed getters pull values out by offset. Every
//! getter re-validates type and bounds against the outer document, so a
//! hostile or truncated document degrades to "use the default" rather than
//! to a panic or an out-of-bounds read.

use super::{document_len, elem, measure_value, read_f64_le, read_i32_le};

/// One key the caller wants located, and where it was found.
///
/// Offsets point at the element's type byte, relative to the document start.
/// `None` means the key was absent (or the document was malformed before the
/// key could be located).
#[derive(Debug, Clone)]
pub struct Prop<'k> {
    pub key: &'k str,
    pub offset: Option<usize>,
}

impl<'k> Prop<'k> {
    pub fn new(key: &'k str) -> Self {
        Self { key, offset: None }
    }
}

/// Scans `doc` once, left to right, filling in the offset of each requested
/// key. Returns the number of keys located.
///
/// Duplicate keys resolve first-match-wins. The scan stops early once every
/// requested key is found, and stops silently at the first malformed
/// element; keys not located by then simply stay `None`.
pub fn get_props(doc: &[u8], props: &mut [Prop<'_>]) -> usize {
    for prop in props.iter_mut() {
        prop.offset = None;
    }

    let Some(total) = document_len(doc) else {
        return 0;
    };
    let doc = &doc[..total];

    let mut matched = 0;
    let mut at = 4;
    while at < total - 1 {
        let elem_offset = at;
        let ty = doc[at];
        if ty == 0x00 {
            break;
        }
        at += 1;

        // Element key: cstring bounded by the terminator position
        let Some(key_len) = doc[at..total - 1].iter().position(|&b| b == 0) else {
            return matched;
        };
        let key = &doc[at..at + key_len];
        at += key_len + 1;

        for prop in props.iter_mut() {
            if prop.offset.is_none() && prop.key.as_bytes() == key {
                prop.offset = Some(elem_offset);
                matched += 1;
                break;
            }
        }
        if matched == props.len() {
            return matched;
        }

        let Some(value_len) = measure_value(doc, ty, at) else {
            return matched;
        };
        at += value_len;
    }

    matched
}

/// Positions past the element header at `offset`, validating the type byte
/// against the two accepted tags. Returns the bounded document and the
/// offset of the element's value.
fn seek_value(doc: &[u8], offset: Option<usize>, ty_a: u8, ty_b: u8) -> Option<(&[u8], usize)> {
    let offset = offset?;
    let total = document_len(doc)?;
    if offset < 4 || offset >= total - 1 {
        return None;
    }
    let doc = &doc[..total];

    let ty = doc[offset];
    if ty != ty_a && ty != ty_b {
        return None;
    }

    let key_start = offset + 1;
    let key_len = doc[key_start..total - 1].iter().position(|&b| b == 0)?;
    Some((doc, key_start + key_len + 1))
}

/// UTF-8 string element at `offset`, or `default` when the element is
/// absent, of another type, not NUL-terminated, or not valid UTF-8.
pub fn get_str<'d>(doc: &'d [u8], offset: Option<usize>, default: &'d str) -> &'d str {
    let Some((doc, at)) = seek_value(doc, offset, elem::STRING, elem::STRING) else {
        return default;
    };
    let Some(len) = read_i32_le(doc, at).and_then(|v| usize::try_from(v).ok()) else {
        return default;
    };
    let start = at + 4;
    if len == 0 || start + len > doc.len() || doc[start + len - 1] != 0 {
        return default;
    }
    std::str::from_utf8(&doc[start..start + len - 1]).unwrap_or(default)
}

/// `int32` element at `offset`, or `default`.
pub fn get_i32(doc: &[u8], offset: Option<usize>, default: i32) -> i32 {
    match seek_value(doc, offset, elem::INT32, elem::INT32) {
        Some((doc, at)) => read_i32_le(doc, at).unwrap_or(default),
        None => default,
    }
}

/// Boolean element at `offset`, or `default`. Any non-zero payload byte
/// reads as true.
pub fn get_bool(doc: &[u8], offset: Option<usize>, default: bool) -> bool {
    match seek_value(doc, offset, elem::BOOLEAN, elem::BOOLEAN) {
        Some((doc, at)) => doc.get(at).map(|&b| b != 0).unwrap_or(default),
        None => default,
    }
}

/// Double element at `offset`, or `default`.
pub fn get_f64(doc: &[u8], offset: Option<usize>, default: f64) -> f64 {
    match seek_value(doc, offset, elem::DOUBLE, elem::DOUBLE) {
        Some((doc, at)) => read_f64_le(doc, at).unwrap_or(default),
        None => default,
    }
}

/// Binary element at `offset` as `(subtype, payload)`.
pub fn get_binary(doc: &[u8], offset: Option<usize>) -> Option<(u8, &[u8])> {
    let (doc, at) = seek_value(doc, offset, elem::BINARY, elem::BINARY)?;
    let len = usize::try_from(read_i32_le(doc, at)?).ok()?;
    let subtype = *doc.get(at + 4)?;
    let start = at + 5;
    if len == 0 || start + len > doc.len() {
        return None;
    }
    Some((subtype, &doc[start..start + len]))
}

/// Embedded document or array element at `offset`, as a document slice that
/// can itself be fed back into the reader.
pub fn get_document(doc: &[u8], offset: Option<usize>) -> Option<&[u8]> {
    let (doc, at) = seek_value(doc, offset, elem::DOCUMENT, elem::ARRAY)?;
    let inner = usize::try_from(read_i32_le(doc, at)?).ok()?;
    if inner < super::MIN_DOCUMENT_LEN || at + inner > doc.len() {
        return None;
    }
    Some(&doc[at..at + inner])
}

/// Raw `(type, value bytes)` of the element at `offset`, used for verbatim
/// element copies between documents.
pub(crate) fn element_value(doc: &[u8], offset: Option<usize>) -> Option<(u8, &[u8])> {
    let offset = offset?;
    let total = document_len(doc)?;
    if offset < 4 || offset >= total - 1 {
        return None;
    }
    let doc = &doc[..total];

    let ty = doc[offset];
    let key_start = offset + 1;
    let key_len = doc[key_start..total - 1].iter().position(|&b| b == 0)?;
    let at = key_start + key_len + 1;
    let len = measure_value(doc, ty, at)?;
    Some((ty, &doc[at..at + len]))
}
