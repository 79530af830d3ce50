//! Document, attachment and view operations.
//!
//! All operations check the shape of their input first and fail with
//! [`CouchError::Shape`] without touching the network when it is wrong.
//! Documents are plain JSON objects; the client only relies on `_id`,
//! `_rev` and `_attachments`, and writes the new `_rev` back into the
//! caller's value after a successful write.

use super::database::Database;
use super::request::{Request, RequestOptions};
use super::utils::{has_attachment, has_revision, is_document};
use crate::error::{CouchError, Result};
use crate::protocol::constants::{content_types, fields, paths, query};
use crate::protocol::{is_conflict, is_error, str_field};
use crate::types::{Decoder, ViewRows};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Parameters of a view query.
///
/// ```
/// use couch_stream_http::client::ViewQuery;
/// use serde_json::json;
///
/// let query = ViewQuery::new()
///     .with_keys(json!(["a", "b"]))
///     .with_count()
///     .with_param("descending", true);
/// assert!(query.include_count);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
    /// Sent as a JSON body with `POST` instead of a `GET`
    pub query_doc: Option<Value>,
    /// Also return `total_rows`
    pub include_count: bool,
    /// Failure handling and query parameters
    pub options: RequestOptions,
}

impl ViewQuery {
    /// Plain `GET` query
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a query document, e.g. `{"keys": [...]}` for long key lists.
    pub fn with_query_doc(mut self, query_doc: Value) -> Self {
        self.query_doc = Some(query_doc);
        self
    }

    /// Shorthand for a `{"keys": keys}` query document.
    pub fn with_keys(self, keys: Value) -> Self {
        self.with_query_doc(serde_json::json!({ "keys": keys }))
    }

    /// Request `total_rows` along with the rows.
    pub fn with_count(mut self) -> Self {
        self.include_count = true;
        self
    }

    /// Append a query parameter such as `descending` or `limit`.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options = self.options.with_param(key, value);
        self
    }

    /// Replace the request options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

fn document_id(doc: &Value) -> Result<&str> {
    str_field(doc, fields::ID).ok_or_else(|| CouchError::Shape("document has no string _id".into()))
}

fn document_rev(doc: &Value) -> Result<&str> {
    str_field(doc, fields::REV).ok_or_else(|| CouchError::Shape("document has no string _rev".into()))
}

impl Database {
    /// Database information (`GET /{db}`), used for probing and cursors.
    pub async fn info(self: &Arc<Self>, options: RequestOptions) -> Result<Value> {
        self.request_json(Request::new(Method::GET, None).with_options(options))
            .await
    }

    /// Create the database on the server.
    pub async fn create(self: &Arc<Self>) -> Result<Value> {
        tracing::info!(db = %self.name(), "Creating database");
        self.request_json(Request::new(Method::PUT, None).with_body(Bytes::new()))
            .await
    }

    /// Delete the database on the server.
    pub async fn destroy(self: &Arc<Self>) -> Result<Value> {
        tracing::info!(db = %self.name(), "Destroying database");
        self.request_json(Request::new(Method::DELETE, None)).await
    }

    /// Fetch a document.
    ///
    /// Without `rev`, the latest revision is fetched along with its
    /// conflicting revisions. Resolves with `None` when the server answers
    /// with an error or with something that is not a document, e.g. when it
    /// does not exist.
    pub async fn get(self: &Arc<Self>, id: &str, rev: Option<&str>) -> Result<Option<Value>> {
        if id.is_empty() {
            return Err(CouchError::Shape("empty document id".into()));
        }

        let options = match rev {
            Some(rev) => RequestOptions::new().with_param(query::REV, rev),
            None => RequestOptions::new().with_param(query::CONFLICTS, true),
        };
        let response = self
            .request_json(Request::new(Method::GET, Some(id)).with_options(options))
            .await?;

        if response.get(fields::ID).is_none() || is_error(&response) {
            return Ok(None);
        }
        Ok(Some(response))
    }

    /// Save a document or a bulk envelope with default options.
    pub async fn save(self: &Arc<Self>, doc: &mut Value) -> Result<Value> {
        self.save_with_options(doc, RequestOptions::new()).await
    }

    /// Save a document (`PUT /{db}/{id}`) or a bulk envelope
    /// (`POST /{db}/_bulk_docs` with `{"docs": [...]}`).
    ///
    /// Every saved document is stamped with the current user under
    /// `couch_user`. On success the new revision is written into `doc` (or
    /// into each envelope document whose entry succeeded) and the raw
    /// response is returned.
    pub async fn save_with_options(
        self: &Arc<Self>,
        doc: &mut Value,
        options: RequestOptions,
    ) -> Result<Value> {
        if !is_document(doc) {
            return Err(CouchError::Shape("value is neither a document nor a bulk envelope".into()));
        }

        let owner = self.username().map_or(Value::Null, Value::from);
        let request = if doc.get(fields::ID).is_some() {
            let id = document_id(doc)?.to_string();
            doc[fields::OWNER] = owner;
            Request::new(Method::PUT, Some(&id)).with_json(doc)?
        } else {
            let docs = doc
                .get_mut(fields::DOCS)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| CouchError::Shape("docs must be an array".into()))?;
            for entry in docs.iter_mut() {
                if !entry.is_object() {
                    return Err(CouchError::Shape("bulk entries must be objects".into()));
                }
                entry[fields::OWNER] = owner.clone();
            }
            Request::new(Method::POST, Some(paths::BULK_DOCS)).with_json(doc)?
        };

        let response = self.request_json(request.with_options(options)).await?;

        if let Some(rev) = response.get(fields::RESPONSE_REV) {
            doc[fields::REV] = rev.clone();
            return Ok(response);
        }

        if is_error(&response) {
            if is_conflict(&response) {
                let id = str_field(doc, fields::ID).map(str::to_string);
                let rev = str_field(doc, fields::REV).map(str::to_string);
                let mut response = response;
                if let Some(body) = response.as_object_mut() {
                    if let Some(id) = &id {
                        body.insert(fields::ID.into(), Value::from(id.as_str()));
                    }
                    if let Some(rev) = &rev {
                        body.insert(fields::REV.into(), Value::from(rev.as_str()));
                    }
                }
                return Err(CouchError::Conflict { id, rev, response });
            }
            return Err(CouchError::Unknown(response));
        }

        let Some(docs) = doc.get_mut(fields::DOCS).and_then(Value::as_array_mut) else {
            return Err(CouchError::Unknown(response));
        };
        let Some(results) = response.as_array() else {
            return Err(CouchError::Unknown(response));
        };

        let index: HashMap<String, usize> = docs
            .iter()
            .enumerate()
            .filter_map(|(i, d)| str_field(d, fields::ID).map(|id| (id.to_string(), i)))
            .collect();

        for result in results.iter().filter(|r| !is_error(r)) {
            let position = str_field(result, fields::RESPONSE_ID).and_then(|id| index.get(id));
            if let (Some(&i), Some(rev)) = (position, result.get(fields::RESPONSE_REV)) {
                docs[i][fields::REV] = rev.clone();
            }
        }
        Ok(response)
    }

    /// Delete a document at its current revision.
    pub async fn delete(self: &Arc<Self>, doc: &Value) -> Result<Value> {
        if !is_document(doc) {
            return Err(CouchError::Shape("value is not a document".into()));
        }
        let id = document_id(doc)?;
        let rev = document_rev(doc)?;

        let response = self
            .request_json(
                Request::new(Method::DELETE, Some(id))
                    .with_options(RequestOptions::new().with_param(query::REV, rev)),
            )
            .await?;

        if is_error(&response) {
            return Err(CouchError::Unknown(response));
        }
        Ok(response)
    }

    /// Upload an attachment and move `doc` to the resulting revision.
    pub async fn put_attachment(
        self: &Arc<Self>,
        doc: &mut Value,
        filename: &str,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
    ) -> Result<Value> {
        if !is_document(doc) || !has_revision(doc) || filename.is_empty() {
            return Err(CouchError::Shape("attachments need a document with _id, _rev and a filename".into()));
        }
        let content_type = HeaderValue::from_str(content_type.unwrap_or(content_types::OCTET_STREAM))
            .map_err(|e| CouchError::Shape(format!("invalid content type: {}", e)))?;
        let path = format!("{}/{}", document_id(doc)?, filename);

        let response = self
            .request_json(
                Request::new(Method::PUT, Some(&path))
                    .with_body(data)
                    .with_header(CONTENT_TYPE, content_type)
                    .with_options(RequestOptions::new().with_param(query::REV, document_rev(doc)?)),
            )
            .await?;

        match response.get(fields::RESPONSE_REV) {
            Some(rev) => {
                doc[fields::REV] = rev.clone();
                Ok(response)
            }
            None => Err(CouchError::Unknown(response)),
        }
    }

    /// Download an attachment listed in `doc`.
    pub async fn get_attachment(self: &Arc<Self>, doc: &Value, filename: &str) -> Result<Bytes> {
        if !has_attachment(doc, filename) {
            return Err(CouchError::Shape(format!("document has no attachment {:?}", filename)));
        }
        let path = format!("{}/{}", document_id(doc)?, filename);

        self.request(Request::new(Method::GET, Some(&path)).with_decoder(Decoder::Raw))
            .await?
            .into_bytes()
    }

    /// Delete an attachment listed in `doc`.
    ///
    /// On success `doc` moves to the new revision and loses the entry.
    pub async fn delete_attachment(
        self: &Arc<Self>,
        doc: &mut Value,
        filename: &str,
    ) -> Result<Value> {
        if !has_attachment(doc, filename) {
            return Err(CouchError::Shape(format!("document has no attachment {:?}", filename)));
        }
        let path = format!("{}/{}", document_id(doc)?, filename);

        let response = self
            .request_json(
                Request::new(Method::DELETE, Some(&path))
                    .with_options(RequestOptions::new().with_param(query::REV, document_rev(doc)?)),
            )
            .await?;

        match response.get(fields::RESPONSE_REV) {
            Some(rev) if !is_error(&response) => {
                doc[fields::REV] = rev.clone();
                if let Some(attachments) = doc
                    .get_mut(fields::ATTACHMENTS)
                    .and_then(Value::as_object_mut)
                {
                    attachments.remove(filename);
                }
                Ok(response)
            }
            _ => Err(CouchError::Unknown(response)),
        }
    }

    /// Query a view, e.g. `_design/app/_view/by_date`.
    ///
    /// Fails with [`CouchError::View`] when the response has no `rows`.
    pub async fn view(self: &Arc<Self>, name: &str, query: ViewQuery) -> Result<ViewRows> {
        if name.is_empty() {
            return Err(CouchError::Shape("empty view name".into()));
        }

        let request = match &query.query_doc {
            Some(query_doc) => Request::new(Method::POST, Some(name)).with_json(query_doc)?,
            None => Request::new(Method::GET, Some(name)),
        };
        let response = self.request_json(request.with_options(query.options)).await?;

        let rows = match response.get(fields::ROWS) {
            Some(Value::Array(rows)) => rows.clone(),
            _ => {
                return Err(CouchError::View {
                    name: name.to_string(),
                    response,
                })
            }
        };

        let total_rows = if query.include_count {
            response.get(fields::TOTAL_ROWS).and_then(Value::as_u64)
        } else {
            None
        };

        Ok(ViewRows { rows, total_rows })
    }
}
