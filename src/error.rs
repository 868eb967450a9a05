//! Error taxonomy and the per-context status channel.
//!
//! The crate distinguishes two layers of failure: an internal [`Error`] enum used
//! by `Result`-returning functions throughout the crate, and the [`Status`] struct
//! that crosses the pump boundary (`status(out)` in the driver API). A state
//! machine converts an `Error` into a `Status` exactly once, the first time it is
//! observed, per §7 of the design.

use thiserror::Error;

/// Result type for fle-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the core.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller misuse: bad input, wrong state, malformed documents.
    #[error("client error: {0}")]
    Client(String),

    /// A KMS subcontext failed: malformed or error response, or the host
    /// reported a transport failure via `kms_ctx.fail(...)`.
    #[error("KMS error: {0}")]
    Kms(String),

    /// Errors related to cryptographic operations (AEAD, key derivation).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// JSON serialization/deserialization errors (KMS wire envelopes).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// BSON document decoding errors (key documents, markings, payloads).
    #[error("BSON error: {0}")]
    Bson(String),

    /// A key or broker entry reached an unexpected state.
    #[error("invalid key state: {0}")]
    InvalidKeyState(String),

    /// General internal errors that don't fit another variant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classifies this error into the three-way [`StatusKind`] taxonomy that
    /// crosses the pump boundary.
    pub fn status_kind(&self) -> StatusKind {
        match self {
            Error::Kms(_) => StatusKind::Kms,
            Error::Client(_)
            | Error::Crypto(_)
            | Error::Json(_)
            | Error::Bson(_)
            | Error::InvalidKeyState(_)
            | Error::Internal(_) => StatusKind::Client,
        }
    }
}

/// The kind of status a context can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// No error; the operation may proceed.
    Ok,
    /// Caller misuse, bad input, or a malformed document.
    Client,
    /// The remote KMS returned an error or an undecryptable response.
    Kms,
    /// A transport failure the caller surfaced via `fail(...)`.
    Network,
}

/// The numeric code carried alongside a [`StatusKind`]. Stable per error site.
pub type StatusCode = u32;

pub const CODE_OK: StatusCode = 0;
pub const CODE_WRONG_STATE: StatusCode = 1;
pub const CODE_UNRECOGNIZED_PROVIDER: StatusCode = 2;
pub const CODE_MALFORMED_DOCUMENT: StatusCode = 3;
pub const CODE_UNRESOLVED_KEY: StatusCode = 4;
pub const CODE_NO_MATCHING_REQUEST: StatusCode = 5;
pub const CODE_KMS_FAILURE: StatusCode = 6;
pub const CODE_NETWORK_FAILURE: StatusCode = 7;
pub const CODE_INTERNAL: StatusCode = 8;

/// The status channel attached to a [`crate::context::Context`] and a
/// [`crate::broker::KeyBroker`].
///
/// First failure wins: once `kind` is non-[`StatusKind::Ok`], subsequent writes
/// are refused by [`Status::set`] unless the status is first reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    kind: StatusKind,
    code: StatusCode,
    message: String,
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl Status {
    /// Returns a fresh, ok status.
    pub fn ok() -> Self {
        Self {
            kind: StatusKind::Ok,
            code: CODE_OK,
            message: String::new(),
        }
    }

    /// Returns whether this status represents success.
    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Writes a failure into this status. Refuses to overwrite an existing
    /// failure: first failure wins (§7).
    pub fn set(&mut self, kind: StatusKind, code: StatusCode, message: impl Into<String>) {
        if !self.is_ok() {
            return;
        }
        self.kind = kind;
        self.code = code;
        self.message = message.into();
    }

    /// Writes an [`Error`] into this status, classifying its kind and
    /// assigning a stable code.
    pub fn set_error(&mut self, err: &Error) {
        let code = match err {
            Error::Client(msg) if msg.contains("wrong state") => CODE_WRONG_STATE,
            Error::Client(msg) if msg.starts_with("unrecognized KMS provider") => {
                CODE_UNRECOGNIZED_PROVIDER
            }
            Error::Client(msg) if msg.contains("does not match any outstanding request") => {
                CODE_NO_MATCHING_REQUEST
            }
            Error::Client(msg) if msg.contains("unresolved") => CODE_UNRESOLVED_KEY,
            Error::Bson(_) => CODE_MALFORMED_DOCUMENT,
            Error::Kms(_) => CODE_KMS_FAILURE,
            _ => CODE_INTERNAL,
        };
        self.set(err.status_kind(), code, err.to_string());
    }

    /// Resets this status back to ok. Used by the state machine after a fresh
    /// context is built, never to paper over an existing failure mid-operation.
    pub fn reset(&mut self) {
        *self = Status::ok();
    }
}
