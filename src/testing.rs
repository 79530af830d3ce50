//! Test support: an in-memory CouchDB behind the [`Transport`] seam.
//!
//! [`FakeCouch`] serves a single database. It understands enough of the
//! HTTP API for the client: database info/create/delete, documents with
//! revision checks, `_bulk_docs`, attachments, simple views and continuous
//! `_changes` feeds (including the `_view` filter). Tests drive failure
//! modes through it: going offline, failing feed connections, ending or
//! abandoning open feeds and requiring credentials.
//!
//! Views understand map functions of the form `emit(doc.<field>, ...)`.

use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::ChangeListener;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// Default configuration with a short retry delay.
pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        retry_delay_ms: 20,
        ..ClientConfig::default()
    }
}

/// A listener forwarding every change it sees into a channel.
pub(crate) fn collector() -> (ChangeListener, mpsc::UnboundedReceiver<Option<Value>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = ChangeListener::new(move |change, _key| {
        let _ = tx.send(change.cloned());
    });
    (listener, rx)
}

/// Next change seen by a [`collector`]; panics after two seconds.
pub(crate) async fn next_change(rx: &mut mpsc::UnboundedReceiver<Option<Value>>) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a change")
        .expect("listener was dropped")
}

struct StoredDoc {
    body: Value,
    deleted: bool,
    seq: u64,
}

impl StoredDoc {
    fn rev(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    fn generation(&self) -> u64 {
        self.rev()
            .and_then(|rev| rev.split_once('-'))
            .and_then(|(gen, _)| gen.parse().ok())
            .unwrap_or(0)
    }
}

struct LiveFeed {
    sender: mpsc::UnboundedSender<Result<Bytes>>,
    filter: Option<String>,
    view: Option<String>,
}

#[derive(Default)]
struct State {
    exists: bool,
    seq: u64,
    counter: u64,
    docs: BTreeMap<String, StoredDoc>,
    attachments: HashMap<(String, String), Bytes>,
    feeds: Vec<LiveFeed>,

    offline: bool,
    failing_changes: usize,
    required_auth: Option<String>,

    requests: Vec<HttpRequest>,
    changes_requests: Vec<Url>,
}

/// In-memory CouchDB server.
#[derive(Default)]
pub(crate) struct FakeCouch {
    state: Mutex<State>,
}

impl FakeCouch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn create_database(&self) {
        self.state.lock().exists = true;
    }

    pub(crate) fn database_exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Store a document directly, bypassing revision checks.
    pub(crate) fn put_doc(&self, doc: Value) -> String {
        let mut state = self.state.lock();
        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => state.next_id(),
        };
        state.commit(&id, doc, false)
    }

    /// Send a raw line to every open feed.
    pub(crate) fn push_feed_line(&self, line: &str) {
        let state = self.state.lock();
        for feed in &state.feeds {
            let _ = feed.sender.send(Ok(Bytes::from(format!("{}\n", line))));
        }
    }

    /// Complete every open feed body normally.
    pub(crate) fn end_feeds(&self) {
        self.state.lock().feeds.clear();
    }

    /// Break every open feed body mid-stream.
    pub(crate) fn abandon_feeds(&self) {
        let feeds = std::mem::take(&mut self.state.lock().feeds);
        for feed in feeds {
            let _ = feed
                .sender
                .send(Err(CouchError::Transport("connection reset by peer".into())));
        }
    }

    /// Wait until exactly `count` feeds are being read; panics after two
    /// seconds.
    pub(crate) async fn wait_for_feeds(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.open_feeds() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "expected {} open feeds, found {}", count, self.open_feeds());
    }

    fn open_feeds(&self) -> usize {
        let mut state = self.state.lock();
        state.feeds.retain(|feed| !feed.sender.is_closed());
        state.feeds.len()
    }

    /// Fail the next `count` `_changes` connections at the transport level.
    pub(crate) fn fail_next_changes(&self, count: usize) {
        self.state.lock().failing_changes = count;
    }

    /// Answer `unauthorized` unless requests carry exactly this header.
    pub(crate) fn require_auth(&self, header: &str) {
        self.state.lock().required_auth = Some(header.to_string());
    }

    /// Refuse every connection while offline.
    pub(crate) fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Every request received, including refused ones.
    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// URLs of every `_changes` connection attempt.
    pub(crate) fn changes_requests(&self) -> Vec<Url> {
        self.state.lock().changes_requests.clone()
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        let segments: Vec<String> = request
            .url
            .path_segments()
            .map(|s| s.map(str::to_string).collect())
            .unwrap_or_default();
        let is_changes = segments.get(1).map(String::as_str) == Some("_changes");
        if is_changes {
            state.changes_requests.push(request.url.clone());
        }

        if state.offline {
            return Err(CouchError::Transport("connection refused".into()));
        }
        if is_changes && state.failing_changes > 0 {
            state.failing_changes -= 1;
            return Err(CouchError::Transport("connection refused".into()));
        }

        if let Some(expected) = &state.required_auth {
            let given = request.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
            if given != Some(expected.as_str()) {
                return Ok(error(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "You are not authorized to access this db.",
                ));
            }
        }

        let Some((db_name, rest)) = segments.split_first() else {
            return Ok(error(StatusCode::NOT_FOUND, "not_found", "missing"));
        };
        if rest.is_empty() {
            return Ok(state.database(&request.method, db_name));
        }
        if !state.exists {
            return Ok(error(StatusCode::NOT_FOUND, "not_found", "Database does not exist."));
        }

        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let response = match rest[0].as_str() {
            "_changes" => state.changes(&query),
            "_bulk_docs" if request.method == Method::POST => match json_body(&request) {
                Ok(body) => state.bulk_docs(body),
                Err(response) => response,
            },
            "_design" | "_local" if rest.len() >= 2 => {
                let id = format!("{}/{}", rest[0], rest[1]);
                if rest[0] == "_design" && rest.len() == 4 && rest[2] == "_view" {
                    state.view(&id, &rest[3], &query, &request)
                } else {
                    state.document(&request, &id, &rest[2..], &query)
                }
            }
            id if id.starts_with('_') => error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Only reserved document ids may start with underscore.",
            ),
            id => state.document(&request, id, &rest[1..], &query),
        };
        Ok(response)
    }
}

#[async_trait]
impl Transport for FakeCouch {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.handle(request)
    }
}

impl State {
    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{:032x}", self.counter)
    }

    /// Store a new revision of `id` and notify open feeds.
    fn commit(&mut self, id: &str, mut body: Value, deleted: bool) -> String {
        let generation = self.docs.get(id).map_or(0, StoredDoc::generation) + 1;
        self.counter += 1;
        let rev = format!("{}-{:08x}", generation, self.counter);

        if let Some(fields) = body.as_object_mut() {
            fields.insert("_id".into(), Value::from(id));
            fields.insert("_rev".into(), Value::from(rev.as_str()));
        }

        self.seq += 1;
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                body,
                deleted,
                seq: self.seq,
            },
        );
        self.broadcast(id);
        rev
    }

    fn broadcast(&mut self, id: &str) {
        self.feeds.retain(|feed| !feed.sender.is_closed());
        let Some(doc) = self.docs.get(id) else {
            return;
        };
        let line = Bytes::from(format!("{}\n", change_record(id, doc)));
        for feed in &self.feeds {
            if self.passes(feed.filter.as_deref(), feed.view.as_deref(), id, doc) {
                let _ = feed.sender.send(Ok(line.clone()));
            }
        }
    }

    /// Whether a live revision with this id may be written on top of `rev`.
    fn accepts(&self, id: &str, rev: Option<&str>) -> bool {
        match self.docs.get(id) {
            Some(doc) if !doc.deleted => rev == doc.rev(),
            _ => rev.is_none(),
        }
    }

    fn live(&self, id: &str) -> Option<&StoredDoc> {
        self.docs.get(id).filter(|doc| !doc.deleted)
    }

    fn database(&mut self, method: &Method, name: &str) -> HttpResponse {
        match (method.clone(), self.exists) {
            (Method::GET, true) => {
                let doc_count = self.docs.values().filter(|d| !d.deleted).count();
                respond(
                    StatusCode::OK,
                    json!({"db_name": name, "update_seq": self.seq, "doc_count": doc_count}),
                )
            }
            (Method::PUT, false) => {
                self.exists = true;
                respond(StatusCode::CREATED, json!({"ok": true}))
            }
            (Method::PUT, true) => error(
                StatusCode::PRECONDITION_FAILED,
                "file_exists",
                "The database could not be created, the file already exists.",
            ),
            (Method::DELETE, true) => {
                *self = State {
                    requests: std::mem::take(&mut self.requests),
                    changes_requests: std::mem::take(&mut self.changes_requests),
                    ..State::default()
                };
                respond(StatusCode::OK, json!({"ok": true}))
            }
            (_, false) => error(StatusCode::NOT_FOUND, "not_found", "Database does not exist."),
            _ => error(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "Only GET,PUT,DELETE allowed"),
        }
    }

    fn document(
        &mut self,
        request: &HttpRequest,
        id: &str,
        rest: &[String],
        query: &HashMap<String, String>,
    ) -> HttpResponse {
        let rev = query.get("rev").map(String::as_str);
        match (request.method.clone(), rest) {
            (Method::GET, []) => match self.docs.get(id) {
                Some(doc) if doc.deleted => error(StatusCode::NOT_FOUND, "not_found", "deleted"),
                Some(doc) if rev.is_none() || rev == doc.rev() => respond(StatusCode::OK, doc.body.clone()),
                _ => error(StatusCode::NOT_FOUND, "not_found", "missing"),
            },
            (Method::PUT, []) => {
                let body = match json_body(request) {
                    Ok(body) if body.is_object() => body,
                    Ok(_) => return error(StatusCode::BAD_REQUEST, "bad_request", "Document must be a JSON object"),
                    Err(response) => return response,
                };
                let current = body.get("_rev").and_then(Value::as_str).map(str::to_string);
                if !self.accepts(id, current.as_deref()) {
                    return conflict();
                }
                let rev = self.commit(id, body, false);
                respond(StatusCode::CREATED, json!({"ok": true, "id": id, "rev": rev}))
            }
            (Method::DELETE, []) => {
                if self.live(id).is_none() {
                    return error(StatusCode::NOT_FOUND, "not_found", "missing");
                }
                if !self.accepts(id, rev) {
                    return conflict();
                }
                let rev = self.commit(id, json!({"_deleted": true}), true);
                respond(StatusCode::OK, json!({"ok": true, "id": id, "rev": rev}))
            }
            (method, [name]) => self.attachment(&method, id, name, rev, request),
            _ => error(StatusCode::NOT_FOUND, "not_found", "missing"),
        }
    }

    fn attachment(
        &mut self,
        method: &Method,
        id: &str,
        name: &str,
        rev: Option<&str>,
        request: &HttpRequest,
    ) -> HttpResponse {
        let key = (id.to_string(), name.to_string());

        if *method == Method::GET {
            return match (self.live(id), self.attachments.get(&key)) {
                (Some(_), Some(data)) => HttpResponse::from_bytes(StatusCode::OK, data.clone()),
                _ => error(StatusCode::NOT_FOUND, "not_found", "Document is missing attachment"),
            };
        }

        let Some(doc) = self.live(id) else {
            return conflict();
        };
        if !self.accepts(id, rev) {
            return conflict();
        }
        let mut body = doc.body.clone();

        match method.clone() {
            Method::PUT => {
                let data = request.body.clone().unwrap_or_default();
                let content_type = request
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let stub = json!({
                    "content_type": content_type,
                    "length": data.len(),
                    "stub": true,
                });
                if let Some(fields) = body.as_object_mut() {
                    let attachments = fields.entry("_attachments").or_insert_with(|| json!({}));
                    attachments[name] = stub;
                }
                self.attachments.insert(key, data);
            }
            Method::DELETE => {
                if self.attachments.remove(&key).is_none() {
                    return error(StatusCode::NOT_FOUND, "not_found", "Document is missing attachment");
                }
                if let Some(fields) = body.as_object_mut() {
                    let now_empty = match fields.get_mut("_attachments").and_then(Value::as_object_mut) {
                        Some(attachments) => {
                            attachments.remove(name);
                            attachments.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        fields.remove("_attachments");
                    }
                }
            }
            _ => return error(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "Only GET,PUT,DELETE allowed"),
        }

        let rev = self.commit(id, body, false);
        respond(StatusCode::CREATED, json!({"ok": true, "id": id, "rev": rev}))
    }

    fn bulk_docs(&mut self, body: Value) -> HttpResponse {
        let Some(docs) = body.get("docs").and_then(Value::as_array) else {
            return error(StatusCode::BAD_REQUEST, "bad_request", "POST body must include `docs` parameter.");
        };

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs.clone() {
            let id = match doc.get("_id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => self.next_id(),
            };
            let rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);

            if !self.accepts(&id, rev.as_deref()) {
                results.push(json!({"id": id, "error": "conflict", "reason": "Document update conflict."}));
                continue;
            }
            let deleted = doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
            let rev = self.commit(&id, doc, deleted);
            results.push(json!({"ok": true, "id": id, "rev": rev}));
        }
        respond(StatusCode::CREATED, Value::Array(results))
    }

    fn changes(&mut self, query: &HashMap<String, String>) -> HttpResponse {
        let since = match query.get("since").map(String::as_str) {
            Some("now") => self.seq,
            Some(since) => since.parse().unwrap_or(0),
            None => 0,
        };
        let filter = query.get("filter").cloned();
        let view = query.get("view").cloned();

        let (sender, receiver) = mpsc::unbounded_channel();

        let mut backlog: Vec<(&String, &StoredDoc)> =
            self.docs.iter().filter(|(_, doc)| doc.seq > since).collect();
        backlog.sort_by_key(|(_, doc)| doc.seq);
        for (id, doc) in backlog {
            if self.passes(filter.as_deref(), view.as_deref(), id, doc) {
                let _ = sender.send(Ok(Bytes::from(format!("{}\n", change_record(id, doc)))));
            }
        }

        self.feeds.push(LiveFeed { sender, filter, view });
        HttpResponse {
            status: StatusCode::OK,
            body: UnboundedReceiverStream::new(receiver).boxed(),
        }
    }

    /// Feed filter evaluation; only `_view` is understood, other filters
    /// let everything through.
    fn passes(&self, filter: Option<&str>, view: Option<&str>, id: &str, doc: &StoredDoc) -> bool {
        match (filter, view) {
            (Some("_view"), Some(view)) => {
                let Some((design, name)) = view.split_once('/') else {
                    return false;
                };
                !doc.deleted && self.emit(&format!("_design/{}", design), name, id, &doc.body).is_some()
            }
            _ => true,
        }
    }

    /// Field emitted as key by a view's map function.
    fn map_field(&self, design_id: &str, view: &str) -> Option<String> {
        let map = self
            .live(design_id)?
            .body
            .get("views")?
            .get(view)?
            .get("map")?
            .as_str()?;
        let (_, after) = map.split_once("emit(doc.")?;
        let field: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        (!field.is_empty()).then_some(field)
    }

    fn emit(&self, design_id: &str, view: &str, id: &str, body: &Value) -> Option<Value> {
        if id.starts_with("_design/") {
            return None;
        }
        let field = self.map_field(design_id, view)?;
        body.get(&field).filter(|key| !key.is_null()).cloned()
    }

    fn view(
        &self,
        design_id: &str,
        view: &str,
        query: &HashMap<String, String>,
        request: &HttpRequest,
    ) -> HttpResponse {
        if self.map_field(design_id, view).is_none() {
            return error(StatusCode::NOT_FOUND, "not_found", "missing_named_view");
        }

        let mut rows: Vec<Value> = self
            .docs
            .iter()
            .filter(|(_, doc)| !doc.deleted)
            .filter_map(|(id, doc)| {
                self.emit(design_id, view, id, &doc.body)
                    .map(|key| json!({"id": id, "key": key, "value": null}))
            })
            .collect();
        rows.sort_by(|a, b| collate(&a["key"], &b["key"]));
        let total_rows = rows.len();

        if query.get("descending").map(String::as_str) == Some("true") {
            rows.reverse();
        }

        if request.method == Method::POST {
            let body = match json_body(request) {
                Ok(body) => body,
                Err(response) => return response,
            };
            if let Some(keys) = body.get("keys").and_then(Value::as_array) {
                rows = keys
                    .iter()
                    .flat_map(|k| rows.iter().filter(move |row| &row["key"] == k).cloned())
                    .collect();
            }
        }

        if let Some(limit) = query.get("limit").and_then(|l| l.parse().ok()) {
            rows.truncate(limit);
        }

        respond(
            StatusCode::OK,
            json!({"total_rows": total_rows, "offset": 0, "rows": rows}),
        )
    }
}

fn change_record(id: &str, doc: &StoredDoc) -> Value {
    let mut record = json!({
        "seq": doc.seq,
        "id": id,
        "changes": [{"rev": doc.rev()}],
    });
    if doc.deleted {
        record["deleted"] = Value::Bool(true);
    }
    record
}

/// View key ordering: numbers numerically, strings lexically, anything else
/// by its JSON text.
fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn json_body(request: &HttpRequest) -> std::result::Result<Value, HttpResponse> {
    let body = request.body.clone().unwrap_or_default();
    serde_json::from_slice(&body)
        .map_err(|_| error(StatusCode::BAD_REQUEST, "bad_request", "invalid UTF-8 JSON"))
}

fn respond(status: StatusCode, body: Value) -> HttpResponse {
    HttpResponse::from_bytes(status, body.to_string())
}

fn error(status: StatusCode, error: &str, reason: &str) -> HttpResponse {
    respond(status, json!({"error": error, "reason": reason}))
}

fn conflict() -> HttpResponse {
    error(StatusCode::CONFLICT, "conflict", "Document update conflict.")
}
