#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # couch-stream-http: an async CouchDB client
//!
//! This crate talks to a CouchDB server over HTTP and keeps working when the
//! server goes away for a while.
//!
//! ## Overview
//!
//! The client is composed of three parts:
//!
//! 1. **Request pipeline** - Every request is authorized, executed in the
//!    background and, on transport failure, retried, surfaced or parked until
//!    the connection comes back
//! 2. **Changes subscriptions** - One continuous `_changes` connection per
//!    `(filter, view)` pair, shared by all of its listeners, reconnected on
//!    failure and resumed from the last seen sequence
//! 3. **Document operations** - CRUD, bulk saves, attachments and views, with
//!    conflicts and other server errors classified into [`CouchError`]
//!
//! ## Key Features
//!
//! - **Deferred execution**: nothing touches the network on the caller's stack
//! - **Failed-request queue**: parked requests are replayed in order once a
//!   changes feed connects again
//! - **Multiplexed feeds**: `last_seq` records move the cursor and are never
//!   delivered; a broken feed detaches its listeners with a `None` change
//! - **Connection status**: observers are told about every flip
//! - **Pluggable transport**: [`ReqwestTransport`] by default, anything
//!   implementing [`Transport`] otherwise
//!
//! ## Usage
//!
//! ```ignore
//! use couch_stream_http::{ChangeListener, ClientConfig, DatabaseRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = DatabaseRegistry::new(ClientConfig::default())?;
//!     registry.test_connection("notes").await?;
//!
//!     let db = registry.get_or_create("notes");
//!     db.set_credentials("admin", "secret")?;
//!
//!     // Listen for changes
//!     let listener = ChangeListener::new(|change, key| match change {
//!         Some(change) => println!("{}: {} changed", key, change["id"]),
//!         None => println!("{}: feed ended", key),
//!     });
//!     db.subscribe(listener, None, None, None).await?;
//!
//!     // Write a document
//!     let mut doc = json!({"_id": "first", "text": "Hello"});
//!     db.save(&mut doc).await?;
//!     println!("saved at {}", doc["_rev"]);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[client]** - Database instances, request pipeline, changes feeds, documents
//! - **[registry]** - Named database instances and connection probing
//! - **[types]** - Subscription keys, callbacks, decoders and view results
//! - **[transport]** - HTTP transport seam and its `reqwest` implementation
//! - **[protocol]** - Wire constants and response classification
//! - **[config]** - Client configuration
//! - **[error]** - Error types and result handling
//! - **[logging]** - `tracing` subscriber setup

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::{ChangeSubscription, Database, Pending, Request, RequestOptions, ViewQuery};
pub use config::ClientConfig;
pub use error::{CouchError, Result};
pub use registry::DatabaseRegistry;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use types::{ChangeListener, Decoded, Decoder, StatusObserver, SubscriptionKey, ViewRows};

#[cfg(test)]
mod testing;
