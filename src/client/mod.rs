//! CouchDB client implementation.
//!
//! This module provides the per-database client:
//!
//! - **Request pipeline** with authorization, deferred execution and replay
//!   of requests that failed while the server was unreachable
//! - **Changes feeds** multiplexed per `(filter, view)` key, reconnected on
//!   failure and fanned out to every listener
//! - **Document operations**: CRUD, bulk save, attachments and views
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── database     - Database instance, credentials, connection status
//! ├── request      - Request pipeline and failed-request queue
//! ├── changes      - Changes subscription manager
//! ├── subscription - Stream adapter over a subscription
//! ├── documents    - Document, attachment and view operations
//! ├── parser       - Newline-delimited JSON feed decoder
//! └── utils        - Utility functions
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Database`] | A database on a server; all operations hang off it |
//! | [`Request`] | A request against a database |
//! | [`RequestOptions`] | Retry behaviour and query parameters |
//! | [`Pending`] | Result of a request running in the background |
//! | [`ViewQuery`] | Parameters of a view query |
//! | [`LineDecoder`] | Continuous feed record decoder |
//! | [`ChangeSubscription`] | Changes of a key as a `Stream` |
//!
//! # Examples
//!
//! ```ignore
//! use couch_stream_http::{ChangeListener, ClientConfig, DatabaseRegistry};
//! use serde_json::json;
//!
//! let registry = DatabaseRegistry::new(ClientConfig::default())?;
//! let db = registry.get_or_create("notes");
//!
//! let mut doc = json!({"_id": "first", "text": "Hello"});
//! db.save(&mut doc).await?;
//!
//! db.subscribe(
//!     ChangeListener::new(|change, key| println!("{}: {:?}", key, change)),
//!     None,
//!     None,
//!     None,
//! )
//! .await?;
//! ```

mod changes;
mod database;
mod documents;
mod parser;
mod request;
mod subscription;
mod utils;

pub use database::Database;
pub use documents::ViewQuery;
pub use parser::LineDecoder;
pub use request::{Pending, Request, RequestOptions};
pub use subscription::ChangeSubscription;
pub use utils::*;
