//! CouchDB wire protocol constants and response classification.
//!
//! The server reports failures inside a JSON body (`{"error": .., "reason": ..}`)
//! rather than through the transport, so most decisions of the client are
//! made by inspecting decoded bodies with the helpers below.
//!
//! ```
//! use couch_stream_http::protocol::{error_kind, is_last_seq_record};
//! use serde_json::json;
//!
//! assert_eq!(error_kind(&json!({"error": "conflict"})), Some("conflict"));
//! assert!(is_last_seq_record(&json!({"last_seq": 12})));
//! assert!(!is_last_seq_record(&json!({"seq": 12, "id": "doc"})));
//! ```

pub mod constants;

use constants::{errors, fields};
use serde_json::Value;

/// The `error` field of a response, if present.
pub fn error_kind(response: &Value) -> Option<&str> {
    response.get(fields::ERROR).map(|e| e.as_str().unwrap_or(""))
}

/// Whether the response carries an error marker.
pub fn is_error(response: &Value) -> bool {
    response.get(fields::ERROR).is_some()
}

/// Whether the response reports a revision conflict.
pub fn is_conflict(response: &Value) -> bool {
    error_kind(response) == Some(errors::CONFLICT)
}

/// Whether the response reports missing credentials or permissions.
pub fn is_unauthorized(response: &Value) -> bool {
    error_kind(response) == Some(errors::UNAUTHORIZED)
}

/// Whether the response reports that the database itself does not exist.
pub fn is_missing_database(response: &Value) -> bool {
    let reason = response.get(fields::REASON).and_then(Value::as_str);
    reason == Some(errors::NO_DB_FILE)
        || (error_kind(response) == Some(errors::NOT_FOUND)
            && reason.is_some_and(|r| r.contains("does not exist")))
}

/// Whether a changes-feed record is the final-sequence control record.
pub fn is_last_seq_record(record: &Value) -> bool {
    record.get(fields::LAST_SEQ).is_some()
}

/// String field accessor.
pub fn str_field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value.get(name).and_then(Value::as_str)
}
