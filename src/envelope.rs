// src/envelope.rs
//! Canonical envelopes for the three event sources.
//!
//! Every trigger (an HTTP request, a job firing, an inbound channel message) is
//! normalized into an [`Envelope`] before it reaches the dispatcher. Building an
//! envelope never fails: anything that cannot be decoded degrades to an empty
//! JSON object.
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use channel_api::ChannelMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::signature::{SignatureHeaders, Signer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Request,
    Scheduled,
    Message,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Request => "REQUEST",
            EventKind::Scheduled => "SCHEDULED",
            EventKind::Message => "MESSAGE",
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported method `{other}`")),
        }
    }
}

/// A network request as handed over by the HTTP adapter.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute (`http://host/path?q`) or origin-form (`/path?q`).
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: vec![], body: vec![] }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestEvent {
    pub method: HttpMethod,
    pub scheme: String,
    pub url: String,
    pub path: String,
    pub query_string: String,
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobEvent {
    pub id: String,
    pub name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    /// Human-readable trigger, e.g. `interval[0:00:30]`.
    pub trigger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessageEvent {
    #[serde(rename = "type")]
    pub message_type: String,
    pub channel: String,
    pub message_id: String,
    pub user: Option<String>,
    pub thread_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Request(RequestEvent),
    Scheduled(JobEvent),
    Message(MessageEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Request(_) => EventKind::Request,
            EventPayload::Scheduled(_) => EventKind::Scheduled,
            EventPayload::Message(_) => EventKind::Message,
        }
    }

    /// The `event.type` tag on the wire.
    pub fn type_tag(&self) -> &str {
        match self {
            EventPayload::Request(_) => "http",
            EventPayload::Scheduled(_) => "scheduled_job",
            EventPayload::Message(m) => &m.message_type,
        }
    }

    pub fn as_request(&self) -> Option<&RequestEvent> {
        match self {
            EventPayload::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobEvent> {
        match self {
            EventPayload::Scheduled(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            EventPayload::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The `event` object of the wire shape.
    pub fn wire_event(&self) -> Value {
        let fields = match self {
            EventPayload::Request(r) => ("request", serde_json::to_value(r)),
            EventPayload::Scheduled(j) => ("job", serde_json::to_value(j)),
            EventPayload::Message(m) => ("message", serde_json::to_value(m)),
        };
        let (key, value) = fields;
        json!({
            "type": self.type_tag(),
            key: value.unwrap_or_else(|_| json!({})),
        })
    }
}

/// Named context fields a handler may declare it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Acknowledge,
    Respond,
    PathParams,
    MatchedRoute,
    Job,
    Values,
}

impl ContextField {
    pub fn supported_by(self, kind: EventKind) -> bool {
        match self {
            ContextField::Acknowledge => kind == EventKind::Message,
            ContextField::Respond => matches!(kind, EventKind::Request | EventKind::Message),
            ContextField::PathParams | ContextField::MatchedRoute => kind == EventKind::Request,
            ContextField::Job => kind == EventKind::Scheduled,
            ContextField::Values => true,
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextField::Acknowledge => "acknowledge",
            ContextField::Respond => "respond",
            ContextField::PathParams => "path_params",
            ContextField::MatchedRoute => "matched_route",
            ContextField::Job => "job",
            ContextField::Values => "values",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedRoute {
    pub route_id: u64,
    pub method: HttpMethod,
    pub template: String,
    pub namespace: String,
}

/// Where message acknowledgements go.
#[async_trait]
pub trait AckSink: Send + Sync {
    async fn acknowledge(&self, message_id: &str) -> anyhow::Result<()>;
}

/// Acknowledges one message at most once.
#[derive(Clone)]
pub struct Acknowledger {
    message_id: String,
    sink: Option<Arc<dyn AckSink>>,
    done: Arc<AtomicBool>,
}

impl Acknowledger {
    pub fn new(message_id: impl Into<String>, sink: Arc<dyn AckSink>) -> Self {
        Self { message_id: message_id.into(), sink: Some(sink), done: Arc::new(AtomicBool::new(false)) }
    }

    /// An acknowledger with nowhere to send to.
    pub fn detached(message_id: impl Into<String>) -> Self {
        Self { message_id: message_id.into(), sink: None, done: Arc::new(AtomicBool::new(false)) }
    }

    pub async fn acknowledge(&self) -> anyhow::Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.sink {
            Some(sink) => sink.acknowledge(&self.message_id).await,
            None => Ok(()),
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("message_id", &self.message_id)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// A reply recorded through `respond`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: Option<u16>,
    pub body: Value,
}

#[derive(Default)]
struct ContextState {
    values: DashMap<String, Value>,
    matched_route: RwLock<Option<MatchedRoute>>,
    path_params: RwLock<BTreeMap<String, String>>,
    job: Option<JobEvent>,
    acknowledger: Option<Acknowledger>,
    replies: Mutex<Vec<Reply>>,
}

/// Mutable context shared by every predicate and handler of one dispatch.
///
/// Cloning is cheap and all clones observe the same state.
#[derive(Clone, Default)]
pub struct EventContext {
    inner: Arc<ContextState>,
}

impl EventContext {
    fn with_job(job: JobEvent) -> Self {
        Self { inner: Arc::new(ContextState { job: Some(job), ..Default::default() }) }
    }

    fn with_acknowledger(ack: Acknowledger) -> Self {
        Self { inner: Arc::new(ContextState { acknowledger: Some(ack), ..Default::default() }) }
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.get(key).map(|v| v.value().clone())
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.inner
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn set_matched_route(&self, route: MatchedRoute, params: BTreeMap<String, String>) {
        *self.inner.matched_route.write().unwrap_or_else(PoisonError::into_inner) = Some(route);
        *self.inner.path_params.write().unwrap_or_else(PoisonError::into_inner) = params;
    }

    pub fn matched_route(&self) -> Option<MatchedRoute> {
        self.inner.matched_route.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn path_params(&self) -> BTreeMap<String, String> {
        self.inner.path_params.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn path_param(&self, name: &str) -> Option<String> {
        self.inner
            .path_params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn job(&self) -> Option<&JobEvent> {
        self.inner.job.as_ref()
    }

    pub fn acknowledger(&self) -> Option<&Acknowledger> {
        self.inner.acknowledger.as_ref()
    }

    /// Acknowledge the inbound message. A no-op for other event kinds.
    pub async fn acknowledge(&self) -> anyhow::Result<()> {
        match self.acknowledger() {
            Some(ack) => ack.acknowledge().await,
            None => Ok(()),
        }
    }

    pub fn respond(&self, body: Value) {
        self.push_reply(Reply { status: None, body });
    }

    pub fn respond_with_status(&self, status: u16, body: Value) {
        self.push_reply(Reply { status: Some(status), body });
    }

    fn push_reply(&self, reply: Reply) {
        self.inner.replies.lock().unwrap_or_else(PoisonError::into_inner).push(reply);
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.inner.replies.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take_replies(&self) -> Vec<Reply> {
        std::mem::take(&mut *self.inner.replies.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// The last explicit status set through `respond_with_status`.
    pub fn reply_status(&self) -> Option<u16> {
        self.replies().iter().rev().find_map(|r| r.status)
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("values", &self.values())
            .field("matched_route", &self.matched_route())
            .field("job", &self.inner.job)
            .field("acknowledger", &self.inner.acknowledger)
            .finish()
    }
}

/// Opaque handle back to the trigger object.
#[derive(Clone)]
pub struct RawTrigger(Arc<dyn Any + Send + Sync>);

impl RawTrigger {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

#[derive(Clone)]
pub struct Envelope {
    pub kind: EventKind,
    pub payload: EventPayload,
    pub context: EventContext,
    pub raw: Option<RawTrigger>,
    /// The serialized wire form the signature was computed over.
    pub body: String,
    pub signature: SignatureHeaders,
}

impl Envelope {
    pub fn from_request(request: HttpRequest, signer: &Signer) -> Self {
        let payload = EventPayload::Request(request_event(&request));
        Self::seal(payload, EventContext::default(), Some(RawTrigger::new(request)), signer)
    }

    pub fn from_job(job: JobEvent, signer: &Signer) -> Self {
        let context = EventContext::with_job(job.clone());
        Self::seal(EventPayload::Scheduled(job), context, None, signer)
    }

    pub fn from_message(message: ChannelMessage, ack: Acknowledger, signer: &Signer) -> Self {
        let payload = EventPayload::Message(MessageEvent {
            message_type: message.message_type.clone(),
            channel: message.channel.clone(),
            message_id: message.id.clone(),
            user: message.from.as_ref().map(|p| p.id.clone()),
            thread_id: message.thread_id.clone(),
            payload: message.payload.clone(),
        });
        let context = EventContext::with_acknowledger(ack);
        Self::seal(payload, context, Some(RawTrigger::new(message)), signer)
    }

    fn seal(payload: EventPayload, context: EventContext, raw: Option<RawTrigger>, signer: &Signer) -> Self {
        let wire = json!({ "type": "event", "event": payload.wire_event() });
        let body = serde_json::to_string(&wire).unwrap_or_else(|_| "{}".to_string());
        let signature = signer.sign(&body);
        Self { kind: payload.kind(), payload, context, raw, body, signature }
    }

    pub fn verify(&self, signer: &Signer) -> bool {
        signer.verify(&self.signature, &self.body)
    }

    /// Wire form as a JSON value.
    pub fn wire(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| json!({}))
    }

    /// Flattened view handed to script handlers.
    pub fn script_view(&self) -> Value {
        let mut view = json!({
            "kind": self.kind,
            "event": self.payload.wire_event(),
            "values": self.context.values(),
        });
        if let EventPayload::Request(_) = self.payload {
            view["path_params"] = json!(self.context.path_params());
        }
        if let Some(job) = self.context.job() {
            view["job"] = json!(job);
        }
        view
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("context", &self.context)
            .finish()
    }
}

fn request_event(request: &HttpRequest) -> RequestEvent {
    let parsed = Url::parse(&request.url)
        .or_else(|_| Url::parse("http://localhost").and_then(|base| base.join(&request.url)));

    let (scheme, url, path, query_string, query_params) = match parsed {
        Ok(u) => (
            u.scheme().to_string(),
            u.to_string(),
            u.path().to_string(),
            u.query().unwrap_or_default().to_string(),
            u.query_pairs().into_owned().collect(),
        ),
        Err(_) => {
            let (path, query) = request.url.split_once('?').unwrap_or((request.url.as_str(), ""));
            ("http".to_string(), request.url.clone(), path.to_string(), query.to_string(), BTreeMap::new())
        }
    };

    let headers = request
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();

    RequestEvent {
        method: request.method,
        scheme,
        url,
        path,
        query_string,
        query_params,
        headers,
        body: decode_body(&request.body),
    }
}

fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return json!({});
    }
    serde_json::from_slice(body).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::new("test-secret")
    }

    #[test]
    fn request_captures_query_and_body() {
        let req = HttpRequest::new(HttpMethod::Post, "/things/7?sort=asc&limit=5")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"name":"x"}"#);
        let env = Envelope::from_request(req, &signer());

        assert_eq!(env.kind, EventKind::Request);
        let r = env.payload.as_request().unwrap();
        assert_eq!(r.method, HttpMethod::Post);
        assert_eq!(r.scheme, "http");
        assert_eq!(r.path, "/things/7");
        assert_eq!(r.query_string, "sort=asc&limit=5");
        assert_eq!(r.query_params.get("limit").map(String::as_str), Some("5"));
        assert_eq!(r.headers.get("content-type").map(String::as_str), Some("application/json"));
        assert_eq!(r.body, json!({"name": "x"}));
        assert!(env.raw.as_ref().unwrap().downcast_ref::<HttpRequest>().is_some());
    }

    #[test]
    fn undecodable_body_becomes_empty_object() {
        let req = HttpRequest::new(HttpMethod::Post, "https://example.org/hook").with_body("not json {");
        let env = Envelope::from_request(req, &signer());
        let r = env.payload.as_request().unwrap();
        assert_eq!(r.body, json!({}));
        assert_eq!(r.scheme, "https");
    }

    #[test]
    fn wire_shape_is_signed() {
        let s = signer();
        let env = Envelope::from_request(HttpRequest::new(HttpMethod::Get, "/status"), &s);
        let wire = env.wire();
        assert_eq!(wire["type"], "event");
        assert_eq!(wire["event"]["type"], "http");
        assert_eq!(wire["event"]["request"]["path"], "/status");
        assert!(env.verify(&s));
        assert!(!env.verify(&Signer::new("nope")));
    }

    #[test]
    fn job_envelope_exposes_job_in_context() {
        let job = JobEvent {
            id: "metrics.poll".into(),
            name: "poll".into(),
            next_run_time: None,
            trigger: "interval[0:00:30]".into(),
        };
        let env = Envelope::from_job(job.clone(), &signer());
        assert_eq!(env.kind, EventKind::Scheduled);
        assert_eq!(env.context.job(), Some(&job));
        assert_eq!(env.wire()["event"]["type"], "scheduled_job");
        assert_eq!(env.wire()["event"]["job"]["id"], "metrics.poll");
    }

    #[tokio::test]
    async fn message_envelope_acknowledges_once() {
        struct Counting(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl AckSink for Counting {
            async fn acknowledge(&self, _id: &str) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let sink = Arc::new(Counting(Default::default()));
        let msg = ChannelMessage::new("general", "ping", json!({"n": 1}));
        let env = Envelope::from_message(msg, Acknowledger::new("m", sink.clone()), &signer());

        assert_eq!(env.wire()["event"]["type"], "ping");
        env.context.acknowledge().await.unwrap();
        env.context.clone().acknowledge().await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert!(env.context.acknowledger().unwrap().is_acknowledged());
    }

    #[test]
    fn context_is_shared_between_clones() {
        let env = Envelope::from_request(HttpRequest::new(HttpMethod::Get, "/"), &signer());
        let copy = env.clone();
        copy.context.insert("user", json!("sam"));
        copy.context.respond_with_status(201, json!({"created": true}));
        assert_eq!(env.context.get("user"), Some(json!("sam")));
        assert_eq!(env.context.reply_status(), Some(201));
    }

    #[test]
    fn context_fields_are_kind_specific() {
        assert!(ContextField::Acknowledge.supported_by(EventKind::Message));
        assert!(!ContextField::Acknowledge.supported_by(EventKind::Request));
        assert!(ContextField::PathParams.supported_by(EventKind::Request));
        assert!(!ContextField::Job.supported_by(EventKind::Message));
        assert!(ContextField::Values.supported_by(EventKind::Scheduled));
    }
}
