//! Changes subscription manager.
//!
//! A database keeps at most one continuous `_changes` connection per
//! [`SubscriptionKey`], however many listeners are attached to it. Each decoded
//! record is fanned out to every listener of its key.
//!
//! # Lifecycle of a key
//!
//! ```text
//! ABSENT --subscribe--> IDLE --open--> CONNECTING --ok--> STREAMING
//!                        ^                 |                  |
//!                        +--retry delay----+   end of body ---+ (reconnect)
//!
//! STREAMING --silent for two heartbeats--> IDLE (reconnect after the delay)
//! STREAMING --body abandoned--> ABSENT   (listeners get a `None` change)
//! *         --last unsubscribe--> ABSENT
//! ```
//!
//! The whole state of a key is one [`SubscriptionState`] record in a single
//! map, mutated under one lock. Every key instance carries an epoch, so tasks
//! belonging to a torn down key never touch a newer key with the same name.
//!
//! # Records
//!
//! A record carrying `last_seq` is feed control: it moves the cursor and is
//! not delivered. Every other record is delivered to all listeners, and its
//! `seq` becomes the cursor used when reconnecting.

use super::database::Database;
use super::parser::LineDecoder;
use super::request::{Pending, RequestOptions};
use crate::error::Result;
use crate::protocol::constants::{fields, paths, query};
use crate::protocol::{is_error, is_last_seq_record, is_unauthorized};
use crate::transport::{BodyStream, HttpRequest};
use crate::types::{ChangeListener, SubscriptionKey};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use http::header::{AUTHORIZATION, USER_AGENT};
use http::{HeaderValue, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

/// State of one subscription key.
pub(crate) struct SubscriptionState {
    epoch: u64,
    listeners: Vec<ChangeListener>,
    /// A connection attempt or stream is in flight
    running: bool,
    /// Sequence to resume from; `None` until seeded from the database info
    cursor: Option<Value>,
    feed: Option<FeedHandle>,
}

impl SubscriptionState {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            listeners: Vec::new(),
            running: false,
            cursor: None,
            feed: None,
        }
    }
}

/// Owning handle of a running feed reader.
struct FeedHandle {
    close: oneshot::Sender<()>,
}

impl FeedHandle {
    /// Stop the reader; the end is treated as a local close.
    fn close(self) {
        let _ = self.close.send(());
    }
}

/// How a feed body ended.
#[derive(Debug)]
enum FeedEnd {
    /// Closed locally
    Closed,
    /// The body completed normally
    Finished,
    /// Nothing arrived, not even a heartbeat, for too long
    Silent,
    /// The response was abandoned mid-body
    Abandoned(crate::CouchError),
}

impl Database {
    /// Attach `listener` to the changes feed of `(filter, view)`.
    ///
    /// The listener is registered immediately; connecting happens in the
    /// background and the returned handle resolves once the first attempt is
    /// done (connected, already running, or a retry scheduled). Subscribing
    /// an already registered listener does nothing.
    ///
    /// `since` overrides the stored cursor of the key. Without it, the first
    /// subscription starts at the database's current `update_seq`.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: ChangeListener,
        since: Option<Value>,
        filter: Option<&str>,
        view: Option<&str>,
    ) -> Pending<()> {
        let key = SubscriptionKey::new(filter, view);
        let (reply, receiver) = oneshot::channel();

        let epoch = {
            let mut subscriptions = self.subscriptions.lock();
            let state = subscriptions
                .entry(key.clone())
                .or_insert_with(|| SubscriptionState::new(self.next_epoch()));

            if state.listeners.contains(&listener) {
                let _ = reply.send(Ok(()));
                return Pending::new(receiver);
            }

            state.listeners.push(listener);
            if since.is_some() {
                state.cursor = since;
            }
            state.epoch
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.open_feed(key, epoch).await;
            let _ = reply.send(Ok(()));
        });

        Pending::new(receiver)
    }

    /// Detach `listener` from the feed of `(filter, view)`.
    ///
    /// Returns `false` if it was not subscribed. Removing the last listener
    /// closes the feed and forgets the key.
    pub fn unsubscribe(
        &self,
        listener: &ChangeListener,
        filter: Option<&str>,
        view: Option<&str>,
    ) -> bool {
        let key = SubscriptionKey::new(filter, view);

        let now_empty = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(state) = subscriptions.get_mut(&key) else {
                return false;
            };
            let Some(pos) = state.listeners.iter().position(|l| l == listener) else {
                return false;
            };
            state.listeners.remove(pos);
            state.listeners.is_empty()
        };

        if now_empty {
            self.remove_subscription(&key, None);
        }
        true
    }

    /// Tear down every feed, sending `None` to all listeners.
    pub fn close_feeds(&self) {
        let keys: Vec<SubscriptionKey> = self.subscriptions.lock().keys().cloned().collect();
        for key in keys {
            self.remove_subscription(&key, None);
        }
    }

    /// Keys that currently have state.
    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Number of listeners attached to `key`.
    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.subscriptions
            .lock()
            .get(key)
            .map_or(0, |state| state.listeners.len())
    }

    /// Resume cursor of `key`, if known.
    pub fn cursor(&self, key: &SubscriptionKey) -> Option<Value> {
        self.subscriptions
            .lock()
            .get(key)
            .and_then(|state| state.cursor.clone())
    }

    /// Whether a connection for `key` is being opened or streaming.
    pub fn is_streaming(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions
            .lock()
            .get(key)
            .is_some_and(|state| state.running)
    }

    /// Remove the key's state, close its reader and tell its listeners.
    ///
    /// With `Some(epoch)`, only a key instance of that epoch is removed.
    fn remove_subscription(&self, key: &SubscriptionKey, epoch: Option<u64>) {
        let state = {
            let mut subscriptions = self.subscriptions.lock();
            let owned = subscriptions
                .get(key)
                .is_some_and(|state| epoch.map_or(true, |e| e == state.epoch));
            if owned {
                subscriptions.remove(key)
            } else {
                None
            }
        };

        let Some(mut state) = state else {
            return;
        };

        tracing::debug!(db = %self.name(), %key, "Removing changes subscription");

        for listener in &state.listeners {
            listener.call(None, key);
        }
        if let Some(feed) = state.feed.take() {
            feed.close();
        }
    }

    /// Run `f` on the state of `key` if it still belongs to `epoch`.
    fn with_subscription<R>(
        &self,
        key: &SubscriptionKey,
        epoch: u64,
        f: impl FnOnce(&mut SubscriptionState) -> R,
    ) -> Option<R> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions
            .get_mut(key)
            .filter(|state| state.epoch == epoch)
            .map(f)
    }

    /// Seed the cursor if needed, then open the feed unless one is running.
    fn open_feed(self: Arc<Self>, key: SubscriptionKey, epoch: u64) -> BoxFuture<'static, ()> {
        async move {
            let Some(needs_cursor) = self.with_subscription(&key, epoch, |s| s.cursor.is_none()) else {
                return;
            };

            if needs_cursor {
                let info = self.info(RequestOptions::new().return_on_error()).await;
                match info {
                    Ok(info) if is_unauthorized(&info) => {
                        tracing::warn!(db = %self.name(), %key, "Not authorized to read the changes feed, retrying");
                        self.retry_later(key, epoch);
                        return;
                    }
                    Ok(info) if is_error(&info) => {
                        tracing::warn!(db = %self.name(), %key, "Database info failed: {}, retrying", info);
                        self.retry_later(key, epoch);
                        return;
                    }
                    Ok(info) => {
                        let seq = info
                            .get(fields::UPDATE_SEQ)
                            .cloned()
                            .unwrap_or_else(|| Value::from("now"));
                        let seeded = self.with_subscription(&key, epoch, |s| {
                            s.cursor.get_or_insert(seq);
                        });
                        if seeded.is_none() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(db = %self.name(), %key, "Database info failed: {}, retrying", e);
                        self.connection_status_changed(false);
                        self.retry_later(key, epoch);
                        return;
                    }
                }
            }

            // At most one connection attempt per key.
            let since = self.with_subscription(&key, epoch, |s| {
                if s.running {
                    None
                } else {
                    s.running = true;
                    s.cursor.clone()
                }
            });
            let Some(Some(since)) = since else {
                return;
            };

            let request = match self.feed_request(&key, &since) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(db = %self.name(), %key, "Cannot build changes request: {}", e);
                    self.with_subscription(&key, epoch, |s| s.running = false);
                    return;
                }
            };

            match self.transport.send(request).await {
                Ok(response) if !response.status.is_success() => {
                    let status = response.status;
                    let body = response.collect().await.unwrap_or_default();
                    tracing::warn!(
                        db = %self.name(), %key, %status,
                        "Changes feed refused: {}, retrying",
                        String::from_utf8_lossy(&body)
                    );
                    self.with_subscription(&key, epoch, |s| s.running = false);
                    self.retry_later(key, epoch);
                }
                Ok(response) => {
                    let (close, close_rx) = oneshot::channel();
                    let installed = self.with_subscription(&key, epoch, |s| {
                        s.feed = Some(FeedHandle { close });
                    });
                    if installed.is_none() {
                        // Torn down while connecting.
                        return;
                    }

                    tracing::debug!(db = %self.name(), %key, since = %since, "Changes feed connected");
                    self.connection_established();
                    tokio::spawn(self.clone().read_feed(key, epoch, response.body, close_rx));
                }
                Err(e) => {
                    tracing::warn!(db = %self.name(), %key, "Changes feed connection failed: {}", e);
                    self.connection_status_changed(false);
                    self.with_subscription(&key, epoch, |s| s.running = false);
                    self.retry_later(key, epoch);
                }
            }
        }
        .boxed()
    }

    /// Re-run [`Self::open_feed`] for the same key after the retry delay,
    /// unless the key was removed meanwhile.
    fn retry_later(self: &Arc<Self>, key: SubscriptionKey, epoch: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            sleep(this.config.retry_delay()).await;
            this.open_feed(key, epoch).await;
        });
    }

    fn feed_request(&self, key: &SubscriptionKey, since: &Value) -> Result<HttpRequest> {
        let mut options = RequestOptions::new()
            .with_param(query::FEED, query::CONTINUOUS)
            .with_param(query::SINCE, since.clone())
            .with_param(query::HEARTBEAT, self.config.heartbeat_ms);
        if let Some(filter) = &key.filter {
            options = options.with_param(query::FILTER, filter.as_str());
        }
        if let Some(view) = &key.view {
            options = options.with_param(query::VIEW, view.as_str());
        }

        let url = self.build_url(Some(paths::CHANGES), &options.query)?;
        let mut request = HttpRequest::new(Method::GET, url);
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            request.headers.insert(USER_AGENT, agent);
        }
        if let Some(auth) = self.auth_header() {
            request.headers.insert(AUTHORIZATION, auth);
        }
        Ok(request)
    }

    async fn read_feed(
        self: Arc<Self>,
        key: SubscriptionKey,
        epoch: u64,
        mut body: BodyStream,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let mut decoder = LineDecoder::new();
        let idle = self.config.feed_idle_timeout();

        let end = loop {
            tokio::select! {
                _ = &mut close_rx => break FeedEnd::Closed,
                chunk = next_chunk(&mut body, idle) => match chunk {
                    Some(Some(Ok(bytes))) => {
                        for record in decoder.feed(&bytes) {
                            self.route_change(&key, epoch, record);
                        }
                    }
                    Some(Some(Err(e))) => break FeedEnd::Abandoned(e),
                    Some(None) => break FeedEnd::Finished,
                    None => break FeedEnd::Silent,
                },
            }
        };

        if let Some(record) = decoder.finish() {
            self.route_change(&key, epoch, record);
        }

        let still_owned = self
            .with_subscription(&key, epoch, |s| {
                s.running = false;
                s.feed = None;
            })
            .is_some();

        match end {
            FeedEnd::Closed => {}
            _ if !still_owned => {}
            FeedEnd::Abandoned(e) => {
                tracing::warn!(db = %self.name(), %key, "Changes feed abandoned: {}", e);
                self.remove_subscription(&key, Some(epoch));
            }
            FeedEnd::Finished => {
                tracing::debug!(db = %self.name(), %key, "Changes feed ended, reconnecting");
                self.retry_later(key, epoch);
            }
            FeedEnd::Silent => {
                tracing::warn!(db = %self.name(), %key, "Changes feed went silent, reconnecting");
                self.connection_status_changed(false);
                self.retry_later(key, epoch);
            }
        }
    }

    /// Deliver one decoded record to the listeners of `key`.
    fn route_change(&self, key: &SubscriptionKey, epoch: u64, record: Value) {
        let listeners = self.with_subscription(key, epoch, |s| {
            if is_last_seq_record(&record) {
                s.cursor = record.get(fields::LAST_SEQ).cloned();
                return None;
            }
            if let Some(seq) = record.get("seq") {
                s.cursor = Some(seq.clone());
            }
            Some(s.listeners.clone())
        });

        let Some(Some(listeners)) = listeners else {
            return;
        };

        tracing::trace!(db = %self.name(), %key, "Change {}", record);
        for listener in listeners {
            listener.call(Some(&record), key);
        }
    }
}

/// Next body chunk, or `None` if nothing arrived within `idle`.
async fn next_chunk(body: &mut BodyStream, idle: Option<Duration>) -> Option<Option<Result<Bytes>>> {
    match idle {
        Some(idle) => timeout(idle, body.next()).await.ok(),
        None => Some(body.next().await),
    }
}
