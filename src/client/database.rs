//! Database instance: location, credentials and connection status.
//!
//! A [`Database`] is always handled through an `Arc`, since requests and
//! changes feeds run as spawned tasks that keep it alive. The request
//! pipeline, the changes manager and the document operations are implemented
//! on it in their own modules.

use super::changes::SubscriptionState;
use super::request::FailedRequest;
use super::utils::basic_auth_header;
use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use crate::transport::Transport;
use crate::types::{StatusObserver, SubscriptionKey};
use http::HeaderValue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

#[derive(Default)]
struct Credentials {
    username: Option<String>,
    password: Option<String>,
    header: Option<HeaderValue>,
}

/// A named database on a CouchDB server.
pub struct Database {
    name: String,
    url: RwLock<String>,
    credentials: RwLock<Credentials>,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    connected: Mutex<bool>,
    observers: Mutex<Vec<StatusObserver>>,
    /// Requests waiting for the connection to come back, in failure order
    pub(crate) failed_requests: Mutex<Vec<FailedRequest>>,
    /// Per-key changes feed state
    pub(crate) subscriptions: Mutex<HashMap<SubscriptionKey, SubscriptionState>>,
    epochs: AtomicU64,
}

impl Database {
    /// Create an instance using `config.base_url` as its location.
    pub fn new(
        name: impl Into<String>,
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            url: RwLock::new(config.base_url.clone()),
            credentials: RwLock::new(Credentials::default()),
            config,
            transport,
            connected: Mutex::new(false),
            observers: Mutex::new(Vec::new()),
            failed_requests: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        })
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server base URL
    pub fn url(&self) -> String {
        self.url.read().clone()
    }

    /// Point the instance at another server.
    ///
    /// Applies to requests issued afterwards; open feeds keep their
    /// connection until they reconnect.
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }

    /// Scheme of the base URL, e.g. `http`.
    pub fn scheme(&self) -> Option<String> {
        Url::parse(&self.url()).ok().map(|u| u.scheme().to_string())
    }

    /// Host of the base URL.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// Port of the base URL, explicit or implied by the scheme.
    pub fn port(&self) -> Option<u16> {
        Url::parse(&self.url())
            .ok()
            .and_then(|u| u.port_or_known_default())
    }

    /// Set the login used for every subsequent request.
    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) -> Result<()> {
        let username = username.into();
        let password = password.into();
        let header = HeaderValue::from_str(&basic_auth_header(&username, &password))
            .map_err(|e| CouchError::Shape(format!("credentials not usable in a header: {}", e)))?;

        *self.credentials.write() = Credentials {
            username: Some(username),
            password: Some(password),
            header: Some(header),
        };
        Ok(())
    }

    /// Forget the login; requests go out unauthenticated.
    pub fn clear_credentials(&self) {
        *self.credentials.write() = Credentials::default();
    }

    /// Configured `(username, password)`.
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        let creds = self.credentials.read();
        (creds.username.clone(), creds.password.clone())
    }

    pub(crate) fn username(&self) -> Option<String> {
        self.credentials.read().username.clone()
    }

    pub(crate) fn auth_header(&self) -> Option<HeaderValue> {
        self.credentials.read().header.clone()
    }

    /// Register an observer of connection status changes.
    ///
    /// Registering the same observer twice has no effect.
    pub fn add_connection_status_observer(&self, observer: StatusObserver) {
        let mut observers = self.observers.lock();
        if !observers.contains(&observer) {
            observers.push(observer);
        }
    }

    /// Last known connection status.
    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Record a connection status; observers are only told about flips.
    pub fn connection_status_changed(&self, connected: bool) {
        {
            let mut current = self.connected.lock();
            if *current == connected {
                return;
            }
            *current = connected;
        }

        if connected {
            tracing::info!(db = %self.name, "Connection established");
        } else {
            tracing::warn!(db = %self.name, "Connection lost");
        }

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.call(connected);
        }
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("url", &*self.url.read())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
