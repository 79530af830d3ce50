//! Client configuration.
//!
//! [`ClientConfig`] is shared by every [`Database`](crate::client::Database)
//! created from the same [`DatabaseRegistry`](crate::DatabaseRegistry). It can
//! be built in code or deserialized from JSON; missing fields take their
//! defaults.
//!
//! ```
//! use couch_stream_http::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{"retry_delay_ms": 250}"#).unwrap();
//! assert_eq!(config.retry_delay_ms, 250);
//! assert_eq!(config.heartbeat_ms, 5000);
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default CouchDB endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5984";

/// Configuration for the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the server, without the database name
    pub base_url: String,
    /// Fixed delay between retries and reconnect attempts
    pub retry_delay_ms: u64,
    /// Heartbeat interval requested on the continuous changes feed
    pub heartbeat_ms: u64,
    /// User-Agent sent on the changes feed
    pub user_agent: String,
    /// Optional proxy for all requests; empty disables it
    pub proxy_url: String,
    /// Idle connections kept per host by the HTTP pool
    pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            retry_delay_ms: 1000,
            heartbeat_ms: 5000,
            user_agent: concat!("couch-stream-http/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy_url: String::new(),
            max_idle_per_host: 32,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// How long a changes feed may stay silent before it is considered
    /// lost: two heartbeat intervals. `None` when heartbeats are disabled.
    pub fn feed_idle_timeout(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms.saturating_mul(2)))
    }
}
