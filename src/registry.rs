//! Named database instances.
//!
//! [`DatabaseRegistry`] is the context object a host creates once and passes
//! around. It keeps at most one [`Database`] per name, created on first
//! lookup and kept until [`DatabaseRegistry::close`]. The first database
//! created becomes the default, returned when no name is given.
//!
//! ```
//! use couch_stream_http::{ClientConfig, DatabaseRegistry};
//!
//! let registry = DatabaseRegistry::new(ClientConfig::default()).unwrap();
//! let notes = registry.get_or_create("notes");
//! let again = registry.database(None).unwrap();
//! assert_eq!(again.name(), notes.name());
//! ```

use crate::client::{Database, RequestOptions};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{is_error, is_missing_database};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::StatusObserver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct Instances {
    databases: HashMap<String, Arc<Database>>,
    default_name: Option<String>,
}

/// Keyed collection of [`Database`] instances sharing a configuration and
/// a transport.
pub struct DatabaseRegistry {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    instances: Mutex<Instances>,
}

impl DatabaseRegistry {
    /// Registry over a pooled `reqwest` transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Registry over a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            instances: Mutex::new(Instances::default()),
        }
    }

    /// Shared configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The instance for `name`, created on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<Database> {
        let mut instances = self.instances.lock();
        if let Some(db) = instances.databases.get(name) {
            return db.clone();
        }

        tracing::debug!(db = name, "Creating database instance");
        let db = Database::new(name, self.config.clone(), self.transport.clone());
        instances.databases.insert(name.to_string(), db.clone());
        if instances.databases.len() == 1 {
            instances.default_name = Some(name.to_string());
        }
        db
    }

    /// The instance for `name`, or the default instance for `None`.
    ///
    /// Returns `None` only when no name is given and there is no default.
    pub fn database(&self, name: Option<&str>) -> Option<Arc<Database>> {
        match name {
            Some(name) => Some(self.get_or_create(name)),
            None => {
                let instances = self.instances.lock();
                let name = instances.default_name.as_ref()?;
                instances.databases.get(name).cloned()
            }
        }
    }

    /// Name of the default instance
    pub fn default_name(&self) -> Option<String> {
        self.instances.lock().default_name.clone()
    }

    /// Names of all live instances
    pub fn names(&self) -> Vec<String> {
        self.instances.lock().databases.keys().cloned().collect()
    }

    /// Remove an instance and tear down its changes feeds.
    ///
    /// Returns `false` if there was no instance of that name.
    pub fn close(&self, name: &str) -> bool {
        let removed = {
            let mut instances = self.instances.lock();
            let removed = instances.databases.remove(name);
            if removed.is_some() && instances.default_name.as_deref() == Some(name) {
                instances.default_name = None;
            }
            removed
        };

        match removed {
            Some(db) => {
                db.close_feeds();
                true
            }
            None => false,
        }
    }

    /// Point the named instance at another server.
    pub fn set_url_for(&self, name: &str, url: impl Into<String>) {
        self.get_or_create(name).set_url(url);
    }

    /// Base URL of the named instance.
    pub fn url_for(&self, name: &str) -> String {
        self.get_or_create(name).url()
    }

    /// Set the login of the named instance.
    pub fn set_login_for(&self, name: &str, username: &str, password: &str) -> Result<()> {
        self.get_or_create(name).set_credentials(username, password)
    }

    /// Remove the login of the named instance.
    pub fn remove_login_for(&self, name: &str) {
        self.get_or_create(name).clear_credentials();
    }

    /// Observe connection status changes of the named instance.
    pub fn add_connection_status_observer(&self, name: &str, observer: StatusObserver) {
        self.get_or_create(name).add_connection_status_observer(observer);
    }

    /// Probe the named database, creating it if the server reports it
    /// missing.
    ///
    /// Resolves with whether the database is reachable. Transport failures
    /// count as unreachable.
    pub async fn test_connection(&self, name: &str) -> Result<bool> {
        let db = self.get_or_create(name);
        let probe = || RequestOptions::new().return_on_error();

        let info = match db.info(probe()).await {
            Ok(info) => info,
            Err(e) if e.is_retryable() => {
                tracing::warn!(db = name, "Database unreachable: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !is_error(&info) {
            return Ok(true);
        }

        if is_missing_database(&info) {
            db.create().await?;
            match db.info(probe()).await {
                Ok(info) => return Ok(!is_error(&info)),
                Err(e) if e.is_retryable() => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(db = name, "Database probe failed: {}", info);
        Ok(false)
    }
}

impl fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instances = self.instances.lock();
        f.debug_struct("DatabaseRegistry")
            .field("databases", &instances.databases.keys().collect::<Vec<_>>())
            .field("default_name", &instances.default_name)
            .finish_non_exhaustive()
    }
}
