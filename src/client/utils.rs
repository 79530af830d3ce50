//! Utility functions for the CouchDB client.
//!
//! - Basic authorization header encoding
//! - Document shape predicates used before any request is issued
//! - Query parameter value encoding

use crate::protocol::constants::fields;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

/// Encode credentials as a `Basic` authorization header value.
///
/// ```
/// use couch_stream_http::client::basic_auth_header;
///
/// assert_eq!(basic_auth_header("a", "b"), "Basic YTpi");
/// ```
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Whether the value looks like a document (`_id`) or a bulk envelope (`docs`).
pub fn is_document(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|doc| doc.contains_key(fields::ID) || doc.contains_key(fields::DOCS))
}

/// Whether the value carries a revision.
pub fn has_revision(value: &Value) -> bool {
    value.get(fields::REV).is_some()
}

/// Whether the document has an attachment entry named `filename`.
pub fn has_attachment(value: &Value, filename: &str) -> bool {
    is_document(value)
        && has_revision(value)
        && value
            .get(fields::ATTACHMENTS)
            .and_then(Value::as_object)
            .is_some_and(|attachments| attachments.contains_key(filename))
}

/// Encode a query parameter value.
///
/// Strings are passed as-is, booleans as `true`/`false`, numbers in their
/// decimal form; everything else is serialized as JSON text.
pub fn encode_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
