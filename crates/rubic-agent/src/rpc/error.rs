//! RPC error codes and registration errors.

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use thiserror::Error;

/// Numeric code carried in a reply's `error.code` element.
///
/// The reserved JSON-RPC 2.0 codes cover protocol-level failures; handlers
/// may additionally surface POSIX-style error numbers as negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Invalid BSON was received.
    pub const PARSE_ERROR: Self = Self(-32700);
    /// The document is not a valid JSON-RPC 2.0 request.
    pub const INVALID_REQUEST: Self = Self(-32600);
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    /// Invalid method parameters.
    pub const INVALID_PARAMS: Self = Self(-32602);
    /// Internal server error.
    pub const INTERNAL_ERROR: Self = Self(-32603);

    // POSIX-style error numbers, negated on the wire
    pub const NO_SUCH_PROCESS: Self = Self(-3); // ESRCH
    pub const NO_MEMORY: Self = Self(-12); // ENOMEM
    pub const BUSY: Self = Self(-16); // EBUSY
    pub const INVALID: Self = Self(-22); // EINVAL
    pub const BAD_MESSAGE: Self = Self(-74); // EBADMSG

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ErrorCode {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<crate::bson::BuildError> for ErrorCode {
    fn from(_: crate::bson::BuildError) -> Self {
        ErrorCode::INTERNAL_ERROR
    }
}

/// Errors raised while registering methods.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The method name is already taken.
    #[error("method '{name}' is already registered")]
    Duplicate { name: String },

    /// Empty method names are not routable.
    #[error("method name cannot be empty")]
    EmptyName,
}
