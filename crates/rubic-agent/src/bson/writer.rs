//! Write-side BSON construction.
//!
//! Documents are built append-only: the buffer is primed with the empty
//! document and every append rewrites the trailing terminator and the total
//! length. The builder is given its byte budget up front; the [`measure`]
//! twins let callers compute that budget exactly, so reply construction
//! allocates once and an oversized reply surfaces as [`BuildError::Full`]
//! instead of unbounded growth.

use thiserror::Error;

use super::{
    document_len, elem, read_i32_le, reader::element_value, write_i32_le, BINARY_SUBTYPE_GENERIC,
    EMPTY_DOCUMENT, MIN_DOCUMENT_LEN,
};

/// Errors raised while building a document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The append would push the document past the builder's byte budget.
    #[error("document would grow to {needed} bytes, over the {limit}-byte budget")]
    Full { needed: usize, limit: usize },

    /// `shrink_binary` was called but the trailing element is not a binary.
    #[error("only a trailing binary element can be shrunk")]
    NotTrailingBinary,

    /// `shrink_binary` was asked to grow the element.
    #[error("binary elements cannot grow in place")]
    BinaryGrowth,
}

/// Append-only document builder with a fixed byte budget.
pub struct DocumentBuilder {
    buf: Vec<u8>,
    limit: usize,
    /// Offset of the trailing binary element's value, when the last append
    /// was a binary. Cleared by any other append.
    trailing_binary: Option<usize>,
}

impl DocumentBuilder {
    /// Creates a builder primed with the empty document. `limit` is the
    /// total document budget in bytes; the buffer is allocated once here.
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(MIN_DOCUMENT_LEN);
        let mut buf = Vec::with_capacity(limit);
        buf.extend_from_slice(&EMPTY_DOCUMENT);
        Self {
            buf,
            limit,
            trailing_binary: None,
        }
    }

    /// Current total document length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True while no element has been appended.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == MIN_DOCUMENT_LEN
    }

    /// Bytes remaining in the budget.
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Replaces the trailing terminator with an element header, leaving the
    /// buffer positioned for the value bytes.
    fn begin_element(&mut self, ty: u8, key: &str, value_len: usize) -> Result<(), BuildError> {
        let needed = self.buf.len() + 1 + key.len() + 1 + value_len;
        if needed > self.limit {
            return Err(BuildError::Full {
                needed,
                limit: self.limit,
            });
        }
        self.trailing_binary = None;
        self.buf.pop();
        self.buf.push(ty);
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Restores the terminator and rewrites the total length.
    fn finish_element(&mut self) {
        self.buf.push(0);
        let total = self.buf.len() as i32;
        write_i32_le(&mut self.buf, 0, total);
    }

    /// Appends a UTF-8 string element.
    pub fn append_str(&mut self, key: &str, value: &str) -> Result<(), BuildError> {
        self.begin_element(elem::STRING, key, 4 + value.len() + 1)?;
        let bytes = (value.len() as i32 + 1).to_le_bytes();
        self.buf.extend_from_slice(&bytes);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self.finish_element();
        Ok(())
    }

    /// Appends an `int32` element.
    pub fn append_i32(&mut self, key: &str, value: i32) -> Result<(), BuildError> {
        self.begin_element(elem::INT32, key, 4)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        self.finish_element();
        Ok(())
    }

    /// Appends a double element.
    pub fn append_f64(&mut self, key: &str, value: f64) -> Result<(), BuildError> {
        self.begin_element(elem::DOUBLE, key, 8)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        self.finish_element();
        Ok(())
    }

    /// Appends a boolean element.
    pub fn append_bool(&mut self, key: &str, value: bool) -> Result<(), BuildError> {
        self.begin_element(elem::BOOLEAN, key, 1)?;
        self.buf.push(u8::from(value));
        self.finish_element();
        Ok(())
    }

    /// Appends a null element.
    pub fn append_null(&mut self, key: &str) -> Result<(), BuildError> {
        self.begin_element(elem::NULL, key, 0)?;
        self.finish_element();
        Ok(())
    }

    /// Appends an embedded document element. An invalid `sub` degrades to
    /// the empty document so the output stays well-formed.
    pub fn append_document(&mut self, key: &str, sub: &[u8]) -> Result<(), BuildError> {
        self.append_sub(elem::DOCUMENT, key, sub)
    }

    /// Appends an array element. Arrays share the document encoding with
    /// `"0"`, `"1"`, ... keys.
    pub fn append_array(&mut self, key: &str, sub: &[u8]) -> Result<(), BuildError> {
        self.append_sub(elem::ARRAY, key, sub)
    }

    fn append_sub(&mut self, ty: u8, key: &str, sub: &[u8]) -> Result<(), BuildError> {
        let sub = match document_len(sub) {
            Some(total) => &sub[..total],
            None => &EMPTY_DOCUMENT[..],
        };
        self.begin_element(ty, key, sub.len())?;
        self.buf.extend_from_slice(sub);
        self.finish_element();
        Ok(())
    }

    /// Appends a binary element with an explicit subtype.
    pub fn append_binary(&mut self, key: &str, subtype: u8, value: &[u8]) -> Result<(), BuildError> {
        self.begin_element(elem::BINARY, key, 4 + 1 + value.len())?;
        self.buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
        self.buf.push(subtype);
        let value_at = self.buf.len();
        self.buf.extend_from_slice(value);
        self.finish_element();
        self.trailing_binary = Some(value_at);
        Ok(())
    }

    /// Appends a zero-filled generic binary element of `len` bytes and
    /// returns the payload slice for in-place filling. Pair with
    /// [`shrink_binary`](Self::shrink_binary) when the producer ends up
    /// writing less than it reserved.
    pub fn reserve_binary(&mut self, key: &str, len: usize) -> Result<&mut [u8], BuildError> {
        self.begin_element(elem::BINARY, key, 4 + 1 + len)?;
        self.buf.extend_from_slice(&(len as i32).to_le_bytes());
        self.buf.push(BINARY_SUBTYPE_GENERIC);
        let value_at = self.buf.len();
        self.buf.resize(value_at + len, 0);
        self.finish_element();
        self.trailing_binary = Some(value_at);
        Ok(&mut self.buf[value_at..value_at + len])
    }

    /// Shrinks the trailing binary element to `new_len` bytes, adjusting the
    /// element and document lengths in place. Growth is refused, as is
    /// shrinking anything but the most recently appended binary.
    pub fn shrink_binary(&mut self, new_len: usize) -> Result<(), BuildError> {
        let value_at = self.trailing_binary.ok_or(BuildError::NotTrailingBinary)?;
        let old_len = read_i32_le(&self.buf, value_at - 5)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or(BuildError::NotTrailingBinary)?;
        if new_len > old_len {
            return Err(BuildError::BinaryGrowth);
        }
        if new_len == old_len {
            return Ok(());
        }

        write_i32_le(&mut self.buf, value_at - 5, new_len as i32);
        self.buf.truncate(value_at + new_len);
        self.finish_element();
        Ok(())
    }

    /// Copies the element at `offset` in `src` under a new key, preserving
    /// its type and value bytes verbatim. A missing or malformed source
    /// element appends nothing, mirroring the read side's tolerance.
    pub fn append_element(
        &mut self,
        key: &str,
        src: &[u8],
        offset: Option<usize>,
    ) -> Result<(), BuildError> {
        let Some((ty, value)) = element_value(src, offset) else {
            return Ok(());
        };
        // element_value hands back borrowed bytes; stage them so the borrow
        // does not overlap the append
        let staged = value.to_vec();
        self.begin_element(ty, key, staged.len())?;
        self.buf.extend_from_slice(&staged);
        self.finish_element();
        Ok(())
    }
}

impl std::fmt::Debug for DocumentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBuilder")
            .field("len", &self.buf.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Byte-size calculators matching the builder's appends one to one.
///
/// `5 + sum(measure::*)` is exactly the buffer a reply needs, which is how
/// the dispatcher sizes its response documents before building them.
pub mod measure {
    use super::super::{document_len, reader::element_value, MIN_DOCUMENT_LEN};

    fn header(key: &str) -> usize {
        1 + key.len() + 1
    }

    pub fn str(key: &str, value: &str) -> usize {
        header(key) + 4 + value.len() + 1
    }

    pub fn i32(key: &str) -> usize {
        header(key) + 4
    }

    pub fn f64(key: &str) -> usize {
        header(key) + 8
    }

    pub fn boolean(key: &str) -> usize {
        header(key) + 1
    }

    pub fn null(key: &str) -> usize {
        header(key)
    }

    pub fn document(key: &str, sub: &[u8]) -> usize {
        header(key) + document_len(sub).unwrap_or(MIN_DOCUMENT_LEN)
    }

    pub fn binary(key: &str, len: usize) -> usize {
        header(key) + 4 + 1 + len
    }

    /// Size of a verbatim element copy; zero when the source element is
    /// missing, matching `append_element`.
    pub fn element(key: &str, src: &[u8], offset: Option<usize>) -> usize {
        match element_value(src, offset) {
            Some((_, value)) => header(key) + value.len(),
            None => 0,
        }
    }
}
