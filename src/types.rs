//! Core value types shared by the client modules.
//!
//! - [`SubscriptionKey`] identifies one multiplexed changes feed
//! - [`ChangeListener`] and [`StatusObserver`] are identity-compared callbacks
//! - [`Decoder`] / [`Decoded`] select and carry the decoded response body
//! - [`ViewRows`] is the result of a view query

use crate::error::{CouchError, Result};
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Identifies one changes feed of a database: the `(filter, view)` pair.
///
/// Every subscriber registered with the same key shares one streaming
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Server-side filter function, e.g. `design/by_type` or `_view`
    pub filter: Option<String>,
    /// View used by the `_view` filter, e.g. `design/text`
    pub view: Option<String>,
}

impl SubscriptionKey {
    /// Create a key from optional filter and view names.
    pub fn new(filter: Option<&str>, view: Option<&str>) -> Self {
        Self {
            filter: filter.map(str::to_string),
            view: view.map(str::to_string),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}__{}",
            self.filter.as_deref().unwrap_or("None"),
            self.view.as_deref().unwrap_or("None")
        )
    }
}

type ChangeFn = dyn Fn(Option<&Value>, &SubscriptionKey) + Send + Sync;

/// Callback receiving changes of a subscription.
///
/// A `None` change means the stream ended and the listener was detached; it
/// has to subscribe again to keep receiving changes.
///
/// Listeners compare by identity: clones of the same listener are equal,
/// two listeners built from identical closures are not.
#[derive(Clone)]
pub struct ChangeListener(Arc<ChangeFn>);

impl ChangeListener {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>, &SubscriptionKey) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, change: Option<&Value>, key: &SubscriptionKey) {
        (self.0)(change, key)
    }
}

impl PartialEq for ChangeListener {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Eq for ChangeListener {}

impl fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeListener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Callback notified when the connection status flips.
#[derive(Clone)]
pub struct StatusObserver(Arc<dyn Fn(bool) + Send + Sync>);

impl StatusObserver {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, connected: bool) {
        (self.0)(connected)
    }
}

impl PartialEq for StatusObserver {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Eq for StatusObserver {}

impl fmt::Debug for StatusObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusObserver({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// How a response body is decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Decoder {
    /// Parse as JSON
    #[default]
    Json,
    /// Keep the raw bytes
    Raw,
}

impl Decoder {
    /// Decode a complete body.
    pub fn decode(self, body: Bytes) -> Result<Decoded> {
        match self {
            Decoder::Json if body.iter().all(u8::is_ascii_whitespace) => {
                Ok(Decoded::Json(Value::Null))
            }
            Decoder::Json => Ok(Decoded::Json(serde_json::from_slice(&body)?)),
            Decoder::Raw => Ok(Decoded::Raw(body)),
        }
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// JSON body
    Json(Value),
    /// Raw body
    Raw(Bytes),
}

impl Decoded {
    /// The JSON value, failing for raw bodies.
    pub fn into_json(self) -> Result<Value> {
        match self {
            Decoded::Json(value) => Ok(value),
            Decoded::Raw(_) => Err(CouchError::Decode("expected a JSON body".into())),
        }
    }

    /// The raw bytes, failing for JSON bodies.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Decoded::Raw(bytes) => Ok(bytes),
            Decoded::Json(_) => Err(CouchError::Decode("expected a raw body".into())),
        }
    }
}

/// Rows returned by a view query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewRows {
    /// Emitted rows in server order
    pub rows: Vec<Value>,
    /// `total_rows` of the view; only set when the count was requested
    pub total_rows: Option<u64>,
}
