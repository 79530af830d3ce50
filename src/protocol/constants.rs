//! Wire constants of the CouchDB HTTP API.

#![allow(missing_docs)]

/// Reserved path segments below a database.
pub mod paths {
    /// Bulk document update endpoint
    pub const BULK_DOCS: &str = "_bulk_docs";
    /// Changes feed endpoint
    pub const CHANGES: &str = "_changes";
}

/// Query parameter names and values.
pub mod query {
    pub const FEED: &str = "feed";
    pub const CONTINUOUS: &str = "continuous";
    pub const SINCE: &str = "since";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const FILTER: &str = "filter";
    pub const VIEW: &str = "view";
    pub const REV: &str = "rev";
    pub const CONFLICTS: &str = "conflicts";
}

/// Document and response fields.
pub mod fields {
    pub const ID: &str = "_id";
    pub const REV: &str = "_rev";
    pub const ATTACHMENTS: &str = "_attachments";
    /// Documents of a bulk envelope
    pub const DOCS: &str = "docs";
    /// Ownership tag stamped onto saved documents
    pub const OWNER: &str = "couch_user";

    pub const ERROR: &str = "error";
    pub const REASON: &str = "reason";
    /// Id in write responses
    pub const RESPONSE_ID: &str = "id";
    /// Revision in write responses
    pub const RESPONSE_REV: &str = "rev";
    pub const ROWS: &str = "rows";
    pub const TOTAL_ROWS: &str = "total_rows";
    pub const UPDATE_SEQ: &str = "update_seq";
    /// Final-sequence marker of a changes feed
    pub const LAST_SEQ: &str = "last_seq";
}

/// Values of the `error` / `reason` fields the client reacts to.
pub mod errors {
    pub const CONFLICT: &str = "conflict";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    /// Reason reported by older servers for a missing database
    pub const NO_DB_FILE: &str = "no_db_file";
}

/// Content types.
pub mod content_types {
    pub const JSON: &str = "application/json";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}
