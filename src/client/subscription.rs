//! Stream adapter over the changes subscription manager.
//!
//! [`Database::subscribe`] is callback based. [`ChangeSubscription`] wraps a
//! listener that forwards into a channel so changes can be consumed as a
//! `Stream` with `StreamExt` combinators.
//!
//! # Examples
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let mut changes = db.changes_stream(None, None, None);
//! while let Some(change) = changes.next().await {
//!     println!("{} changed", change["id"]);
//! }
//! // The stream ended: the feed was torn down, subscribe again.
//! ```
//!
//! The stream ends when the subscription receives the stream-ended signal.
//! Dropping it unsubscribes its listener.

use super::database::Database;
use super::request::Pending;
use crate::types::{ChangeListener, SubscriptionKey};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Changes of one subscription key as a `Stream`.
pub struct ChangeSubscription {
    db: Arc<Database>,
    key: SubscriptionKey,
    listener: ChangeListener,
    receiver: UnboundedReceiverStream<Value>,
    connected: Option<Pending<()>>,
}

impl ChangeSubscription {
    /// Key this stream is attached to
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Wait until the first connection attempt is done.
    pub async fn ready(&mut self) -> crate::Result<()> {
        match self.connected.take() {
            Some(pending) => pending.await,
            None => Ok(()),
        }
    }
}

impl Stream for ChangeSubscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.db.unsubscribe(
            &self.listener,
            self.key.filter.as_deref(),
            self.key.view.as_deref(),
        );
    }
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("db", &self.db.name())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Subscribe with a fresh listener and consume its changes as a stream.
    pub fn changes_stream(
        self: &Arc<Self>,
        since: Option<Value>,
        filter: Option<&str>,
        view: Option<&str>,
    ) -> ChangeSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sender = Mutex::new(Some(sender));

        let listener = ChangeListener::new(move |change, _key| {
            let mut sender = sender.lock();
            match change {
                Some(change) => {
                    if let Some(tx) = sender.as_ref() {
                        let _ = tx.send(change.clone());
                    }
                }
                None => {
                    sender.take();
                }
            }
        });

        let connected = self.subscribe(listener.clone(), since, filter, view);

        ChangeSubscription {
            db: self.clone(),
            key: SubscriptionKey::new(filter, view),
            listener,
            receiver: UnboundedReceiverStream::new(receiver),
            connected: Some(connected),
        }
    }
}
