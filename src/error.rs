//! # Error
//!
//! The crate-wide error type. Handlers convert any error reaching the
//! [`crate::endpoint::handle`] boundary into a `{status, detail}` reply;
//! nothing below that boundary needs to know about HTTP status codes.

use thiserror::Error;

/// `dwn-core` result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the DWN core.
///
/// Variant names map directly onto §7 of the specification: each taxonomy
/// row becomes one status-bearing variant, with the exception of storage
/// and I/O failures which are folded into [`Error::InternalError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Message or descriptor failed JSON-schema or semantic validation.
    /// Surfaced as HTTP 400.
    #[error("{0}")]
    BadRequest(String),

    /// Authorization failed: signature invalid, key not found, protocol/role
    /// rule denied, grant invalid, or visibility rule denied. Surfaced as 401.
    #[error("{0}")]
    Unauthorized(String),

    /// No matching message/record found. Surfaced as 404.
    #[error("{0}")]
    NotFound(String),

    /// The message lost conflict resolution against a newer or
    /// lexicographically larger write. Surfaced as 409.
    #[error("{0}")]
    Conflict(String),

    /// Any other failure — storage I/O, serialization, cryptography,
    /// DID resolution infrastructure. Surfaced as 500.
    #[error(transparent)]
    InternalError(#[from] anyhow::Error),
}

impl Error {
    /// The HTTP-style status code associated with this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::InternalError(_) => 500,
        }
    }

    /// The human-readable detail carried by this error.
    #[must_use]
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// Shorthand for constructing [`Error::BadRequest`].
#[macro_export]
macro_rules! bad_request {
    ($($arg:tt)*) => {
        $crate::Error::BadRequest(format!($($arg)*))
    };
}

/// Shorthand for constructing [`Error::Unauthorized`].
#[macro_export]
macro_rules! forbidden {
    ($($arg:tt)*) => {
        $crate::Error::Unauthorized(format!($($arg)*))
    };
}

/// Shorthand for constructing [`Error::InternalError`] from a formatted
/// message — used for faults that are unexpected but not a protocol-level
/// bad request (schema bugs, invariant violations).
#[macro_export]
macro_rules! unexpected {
    ($($arg:tt)*) => {
        $crate::Error::InternalError(anyhow::anyhow!($($arg)*))
    };
}
