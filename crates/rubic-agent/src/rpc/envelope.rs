//! JSON-RPC 2.0 envelope over BSON.
//!
//! Requests arrive as one BSON document per packet with the keys `jsonrpc`,
//! `method`, `params` and `id`. Replies carry `jsonrpc`, the request's `id`
//! element cloned byte for byte, and either `result` or `error {code}`.
//! Reply documents are measured first and built into a buffer of exactly
//! that size, so an oversized reply is detected before any bytes move.

// Layer 1: Standard library imports
// (None)

// Layer 2: Third-party crate imports
// (None; the envelope is plain BSON)

// Layer 3: Internal module imports
use super::error::ErrorCode;
use crate::bson::{
    document_len, get_props, get_str, measure, BuildError, DocumentBuilder, Prop, EMPTY_DOCUMENT,
    MIN_DOCUMENT_LEN,
};

/// The only protocol version the agent speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outcome of envelope validation on one inbound document.
#[derive(Debug)]
pub(crate) enum ParseOutcome {
    /// A routable call (or notification, when `id_offset` is `None`).
    Call {
        method: String,
        params_offset: Option<usize>,
        id_offset: Option<usize>,
    },
    /// The document cannot be dispatched; reply with `error` when an `id`
    /// was recoverable.
    Invalid {
        error: ErrorCode,
        id_offset: Option<usize>,
    },
}

/// Validates the JSON-RPC envelope of `doc`.
pub(crate) fn parse_request(doc: &[u8]) -> ParseOutcome {
    if document_len(doc).is_none() {
        return ParseOutcome::Invalid {
            error: ErrorCode::PARSE_ERROR,
            id_offset: None,
        };
    }

    let mut props = [
        Prop::new("jsonrpc"),
        Prop::new("method"),
        Prop::new("params"),
        Prop::new("id"),
    ];
    get_props(doc, &mut props);
    let id_offset = props[3].offset;

    if get_str(doc, props[0].offset, "") != JSONRPC_VERSION {
        return ParseOutcome::Invalid {
            error: ErrorCode::INVALID_REQUEST,
            id_offset,
        };
    }
    let method = get_str(doc, props[1].offset, "");
    if method.is_empty() {
        return ParseOutcome::Invalid {
            error: ErrorCode::INVALID_REQUEST,
            id_offset,
        };
    }

    ParseOutcome::Call {
        method: method.to_owned(),
        params_offset: props[2].offset,
        id_offset,
    }
}

/// Error value for a reply: a bare code, or a handler-built error document
/// whose extra fields are preserved.
#[derive(Debug)]
pub(crate) enum ErrorPayload {
    Code(ErrorCode),
    Doc(Vec<u8>),
}

/// What a reply carries next to `jsonrpc` and `id`.
#[derive(Debug)]
pub(crate) enum ReplyBody {
    /// `result` as a subdocument, or null when `None`.
    Result(Option<Vec<u8>>),
    /// `result` as a bare int32.
    ResultInt(i32),
    /// `error` document.
    Error(ErrorPayload),
}

fn error_document(code: ErrorCode) -> Result<Vec<u8>, BuildError> {
    let mut doc = DocumentBuilder::with_limit(MIN_DOCUMENT_LEN + measure::i32("code"));
    doc.append_i32("code", code.value())?;
    Ok(doc.into_bytes())
}

/// Builds a full reply document for `request`, within `limit` bytes.
///
/// The buffer is sized exactly from the measured element sizes; exceeding
/// `limit` fails before construction so the caller can retry with a
/// smaller body.
pub(crate) fn build_reply(
    request: &[u8],
    id_offset: Option<usize>,
    body: &ReplyBody,
    limit: usize,
) -> Result<Vec<u8>, BuildError> {
    let error_doc = match body {
        ReplyBody::Error(ErrorPayload::Code(code)) => Some(error_document(*code)?),
        _ => None,
    };

    let body_size = match body {
        ReplyBody::Result(Some(result)) => measure::document("result", result),
        ReplyBody::Result(None) => measure::null("result"),
        ReplyBody::ResultInt(_) => measure::i32("result"),
        ReplyBody::Error(ErrorPayload::Code(_)) => {
            measure::document("error", error_doc.as_deref().unwrap_or(&EMPTY_DOCUMENT))
        }
        ReplyBody::Error(ErrorPayload::Doc(doc)) => measure::document("error", doc),
    };
    let needed = MIN_DOCUMENT_LEN
        + measure::str("jsonrpc", JSONRPC_VERSION)
        + body_size
        + measure::element("id", request, id_offset);
    if needed > limit {
        return Err(BuildError::Full { needed, limit });
    }

    let mut reply = DocumentBuilder::with_limit(needed);
    reply.append_str("jsonrpc", JSONRPC_VERSION)?;
    match body {
        ReplyBody::Result(Some(result)) => reply.append_document("result", result)?,
        ReplyBody::Result(None) => reply.append_null("result")?,
        ReplyBody::ResultInt(value) => reply.append_i32("result", *value)?,
        ReplyBody::Error(ErrorPayload::Code(_)) => {
            reply.append_document("error", error_doc.as_deref().unwrap_or(&EMPTY_DOCUMENT))?
        }
        ReplyBody::Error(ErrorPayload::Doc(doc)) => reply.append_document("error", doc)?,
    }
    reply.append_element("id", request, id_offset)?;
    Ok(reply.into_bytes())
}
