//! Request pipeline.
//!
//! Every single-shot operation of the client goes through
//! [`Database::request`]: the request is authorized, then executed in a
//! spawned task, so nothing touches the network on the caller's stack. The
//! returned [`Pending`] resolves with the decoded body.
//!
//! # Failure handling
//!
//! When the transport fails, [`RequestOptions`] decides what happens:
//!
//! | `keep_on_trying` | `return_on_error` | Behaviour |
//! |---|---|---|
//! | `true` | any | retry after the configured delay, forever |
//! | `false` | `true` | resolve with the transport error |
//! | `false` | `false` | park the request until [`Database::connection_established`] replays it |
//!
//! Server-reported errors are not failures at this level: the body is decoded
//! and returned, and callers classify it.

use super::database::Database;
use super::utils::encode_query_value;
use crate::error::{CouchError, Result};
use crate::protocol::constants::content_types;
use crate::transport::HttpRequest;
use crate::types::{Decoded, Decoder};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::sleep;
use url::Url;

/// Per-request options.
///
/// Both flags default to `false`, which parks failed requests for replay.
/// Query parameters are appended to the URL in insertion order.
///
/// ```
/// use couch_stream_http::client::RequestOptions;
///
/// let options = RequestOptions::new()
///     .return_on_error()
///     .with_param("descending", true)
///     .with_param("startkey", serde_json::json!(["a", 1]));
/// assert!(options.return_on_error);
/// assert_eq!(options.query.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Retry transport failures forever
    pub keep_on_trying: bool,
    /// Surface transport failures instead of parking the request
    pub return_on_error: bool,
    /// Query parameters; non-scalar values are sent as JSON text
    pub query: Vec<(String, Value)>,
}

impl RequestOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry transport failures forever.
    pub fn keep_on_trying(mut self) -> Self {
        self.keep_on_trying = true;
        self
    }

    /// Fail fast on transport failures.
    pub fn return_on_error(mut self) -> Self {
        self.return_on_error = true;
        self
    }

    /// Append a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// A request against a database.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Path below the database, `/`-separated; `None` targets the database itself
    pub path: Option<String>,
    /// Request body
    pub body: Option<Bytes>,
    /// Extra headers; `Authorization` here wins over the stored credentials
    pub headers: HeaderMap,
    /// How the response body is decoded
    pub decoder: Decoder,
    /// Failure handling and query parameters
    pub options: RequestOptions,
}

impl Request {
    /// Request with a JSON decoder and default options.
    pub fn new(method: Method, path: Option<&str>) -> Self {
        Self {
            method,
            path: path.map(str::to_string),
            body: None,
            headers: HeaderMap::new(),
            decoder: Decoder::Json,
            options: RequestOptions::default(),
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body and its content type.
    pub fn with_json(mut self, value: &Value) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_types::JSON));
        Ok(self)
    }

    /// Add a header, replacing a previous value.
    pub fn with_header(mut self, name: http::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Select the response decoder.
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// A request parked after a transport failure, with the handle its caller
/// is waiting on.
pub(crate) struct FailedRequest {
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<Result<Decoded>>,
}

/// Result of a request that is running in the background.
///
/// Resolves with [`CouchError::Cancelled`] if the request was dropped
/// without an answer, e.g. when its database went away while it was parked.
#[derive(Debug)]
#[must_use = "the request runs regardless; await the handle to get its result"]
pub struct Pending<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { receiver }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CouchError::Cancelled)))
    }
}

impl Database {
    /// Issue a request in the background.
    ///
    /// The authorization header is added now unless the caller supplied one.
    pub fn request(self: &Arc<Self>, mut request: Request) -> Pending<Decoded> {
        if let Some(auth) = self.auth_header() {
            request.headers.entry(AUTHORIZATION).or_insert(auth);
        }

        let (reply, receiver) = oneshot::channel();
        tokio::spawn(self.clone().execute(request, reply));
        Pending::new(receiver)
    }

    /// Issue a request and decode its body as JSON.
    pub fn request_json(
        self: &Arc<Self>,
        request: Request,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let pending = self.request(request.with_decoder(Decoder::Json));
        async move { pending.await?.into_json() }
    }

    /// Signal that the server is reachable again.
    ///
    /// Notifies status observers, then re-issues every parked request once,
    /// one after the other in the order they failed. The queue is emptied
    /// before replaying, so a request failing again is parked for the next
    /// round.
    pub fn connection_established(self: &Arc<Self>) {
        self.connection_status_changed(true);

        let failed = std::mem::take(&mut *self.failed_requests.lock());
        if failed.is_empty() {
            return;
        }
        tracing::debug!(db = %self.name(), count = failed.len(), "Replaying failed requests");

        let this = self.clone();
        tokio::spawn(async move {
            for FailedRequest { request, reply } in failed {
                this.clone().execute(request, reply).await;
            }
        });
    }

    /// Number of requests parked for replay.
    pub fn failed_request_count(&self) -> usize {
        self.failed_requests.lock().len()
    }

    /// Build `{base}/{db}/{path}?{query}`.
    ///
    /// Every path segment is percent-encoded; `/` separates segments.
    pub fn build_url(&self, path: Option<&str>, query: &[(String, Value)]) -> Result<Url> {
        let base = self.url();
        let mut url = Url::parse(&base)?;

        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CouchError::InvalidUrl(format!("{} cannot be a base URL", base)))?;
            segments.pop_if_empty().push(self.name());
            if let Some(path) = path.filter(|p| !p.is_empty()) {
                segments.extend(path.split('/'));
            }
        }

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, &encode_query_value(value));
            }
        }

        Ok(url)
    }

    async fn execute(self: Arc<Self>, request: Request, reply: oneshot::Sender<Result<Decoded>>) {
        loop {
            match self.perform(&request).await {
                Ok(decoded) => {
                    let _ = reply.send(Ok(decoded));
                    return;
                }
                Err(e) if e.is_retryable() && request.options.keep_on_trying => {
                    tracing::warn!(
                        "{} {:?} failed, retrying after {:?}: {}",
                        request.method,
                        request.path,
                        self.config.retry_delay(),
                        e
                    );
                    sleep(self.config.retry_delay()).await;
                }
                Err(e) if e.is_retryable() && !request.options.return_on_error => {
                    tracing::warn!(
                        "{} {:?} failed, parked until the connection is back: {}",
                        request.method,
                        request.path,
                        e
                    );
                    self.failed_requests
                        .lock()
                        .push(FailedRequest { request, reply });
                    return;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            }
        }
    }

    async fn perform(&self, request: &Request) -> Result<Decoded> {
        let url = self.build_url(request.path.as_deref(), &request.options.query)?;
        tracing::debug!("{} {}", request.method, url);

        let response = self
            .transport
            .send(HttpRequest {
                method: request.method.clone(),
                url,
                headers: request.headers.clone(),
                body: request.body.clone(),
            })
            .await?;

        let body = response.collect().await?;
        request.decoder.decode(body)
    }
}
