//! Error types for the CouchDB client.
//!
//! Every fallible operation returns [`Result<T>`], an alias over [`CouchError`].
//!
//! # Taxonomy
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | [`CouchError::Shape`] | A value failed local validation; no request was issued |
//! | [`CouchError::Conflict`] | The server rejected a save because of a stale revision |
//! | [`CouchError::View`] | A view response did not carry a `rows` list |
//! | [`CouchError::Unknown`] | The server reported any other error in its body |
//! | [`CouchError::Transport`] | The connection failed or the body was abandoned |
//! | [`CouchError::Decode`] | The body could not be decoded by the selected decoder |
//! | [`CouchError::InvalidUrl`] | The configured base URL could not be parsed |
//! | [`CouchError::Cancelled`] | The producer of a pending result went away |
//!
//! The end of a changes stream is not an error: subscribers receive a `None`
//! change instead.

use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CouchError>;

/// Errors produced by the client.
#[derive(Debug, Error)]
pub enum CouchError {
    /// Local validation failure.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Revision conflict reported by the server on save.
    ///
    /// `id` and `rev` are the values the caller attempted to write.
    #[error("Document update conflict for {id:?} at revision {rev:?}")]
    Conflict {
        /// Id of the document that conflicted
        id: Option<String>,
        /// Revision the caller attempted to save against
        rev: Option<String>,
        /// Raw server response
        response: Value,
    },

    /// View response without a row list.
    #[error("View error for {name}: {response}")]
    View {
        /// View path that was queried
        name: String,
        /// Raw server response
        response: Value,
    },

    /// Any other server-reported error.
    #[error("Unknown error: {0}")]
    Unknown(Value),

    /// Connection-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Body decoding failure.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The base URL or request path could not be turned into a URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The pending result will never be produced.
    #[error("Request cancelled")]
    Cancelled,
}

impl CouchError {
    /// Whether the failure is a transport failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CouchError::Transport(_))
    }

    /// Whether this is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CouchError::Conflict { .. })
    }

    /// Raw server response carried by the error, if any.
    pub fn response(&self) -> Option<&Value> {
        match self {
            CouchError::Conflict { response, .. }
            | CouchError::View { response, .. }
            | CouchError::Unknown(response) => Some(response),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CouchError {
    fn from(err: serde_json::Error) -> Self {
        CouchError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for CouchError {
    fn from(err: url::ParseError) -> Self {
        CouchError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        CouchError::Transport(err.to_string())
    }
}
