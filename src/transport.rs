//! HTTP transport seam.
//!
//! The client never talks to the network directly: every request, including
//! the long-lived changes feed, goes through a [`Transport`]. The production
//! implementation is [`ReqwestTransport`]; tests substitute scripted ones.
//!
//! A transport succeeds as soon as it has a response, whatever the status
//! code: CouchDB reports errors inside the JSON body and the client inspects
//! that body. The body is streamed so that continuous feeds can be consumed
//! incrementally; an `Err` item on the stream means the response was
//! abandoned before it completed.

use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Full URL including the query
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Body-less request.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// A response whose body has not been read yet.
pub struct HttpResponse {
    /// Status code; informational only
    pub status: StatusCode,
    /// Body chunks as they arrive
    pub body: BodyStream,
}

impl HttpResponse {
    /// Response from a fully buffered body.
    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Read the whole body.
    pub async fn collect(self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP requests for a database.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send the request and return once response headers are available.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
///
/// No request timeout is configured: continuous feeds stay open indefinitely
/// and rely on server heartbeats.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport from the client configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_idle_per_host);

        if !config.proxy_url.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(&config.proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CouchError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes_stream()
            .map_err(|e| CouchError::Transport(e.to_string()))
            .boxed();

        Ok(HttpResponse { status, body })
    }
}
