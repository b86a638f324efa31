//! Per-request context.
//!
//! # Responsibilities
//! - Hold the parsed request (method, path, headers, query, body)
//! - Carry the response, the abort record, the strategy and the live stack
//! - Offer the helper surface handlers use (`json`, `abort`, `next`, ...)
//!
//! # Design Decisions
//! - Response and abort state are named sub-objects behind accessors
//! - Header keys are lower-cased on parse; lookups lower-case the query key
//! - A request ID (UUID v4) is assigned when a request is loaded, for tracing
//! - `Reset` clears every request-specific field so a pooled context never
//!   exposes the previous request's data

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::BodyError;
use crate::http::abort::{Abort, AbortMessage, MIME_JSON, MIME_TEXT};
use crate::http::response::ResponseContext;
use crate::net::connection::Signal;
use crate::pool::Reset;
use crate::resilience::strategy::{Gate, Strategy};
use crate::routing::{Handler, HandlerStack};

/// Everything known about one request while it is being served.
pub struct RequestContext {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) version: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) query: HashMap<String, Vec<String>>,
    pub(crate) body: Vec<u8>,
    received_at: Instant,
    request_id: Uuid,
    client_addr: Option<SocketAddr>,
    store: HashMap<String, Box<dyn Any + Send>>,
    abort: Option<Abort>,
    response: ResponseContext,
    strategy: Option<Strategy>,
    /// Gates that let this request through; outlives strategy replacement.
    admitted: Vec<Arc<dyn Gate>>,
    stack: HandlerStack,
    signal: Signal,
}

/// The parts of a request needed to answer it from another context.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub version: String,
    pub request_id: Uuid,
    pub received_at: Instant,
    pub client_addr: Option<SocketAddr>,
    pub signal: Signal,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: Vec::new(),
            received_at: Instant::now(),
            request_id: Uuid::nil(),
            client_addr: None,
            store: HashMap::new(),
            abort: None,
            response: ResponseContext::default(),
            strategy: None,
            admitted: Vec::new(),
            stack: HandlerStack::new(),
            signal: Signal::None,
        }
    }

    /// Stamp arrival time, a fresh request ID and the peer address.
    pub(crate) fn begin(&mut self, client_addr: Option<SocketAddr>) {
        self.received_at = Instant::now();
        self.request_id = Uuid::new_v4();
        self.client_addr = client_addr;
    }

    // ---- request accessors -------------------------------------------------

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// First value of a query parameter, or `default` when absent.
    pub fn get_query<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or(default)
    }

    /// Every value of a query parameter in arrival order.
    pub fn query_all(&self, key: &str) -> &[String] {
        self.query.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON.
    ///
    /// A declared content type other than JSON is rejected; an undeclared one
    /// is attempted as JSON.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, BodyError> {
        if let Some(content_type) = self.header("content-type") {
            if !content_type.to_ascii_lowercase().contains("json") {
                return Err(BodyError::UnsupportedContentType(content_type.to_string()));
            }
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    // ---- scratch store -----------------------------------------------------

    pub fn set<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.store.insert(key.into(), Box::new(value));
    }

    /// Typed lookup; `None` when the key is missing or holds another type.
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    // ---- flow control ------------------------------------------------------

    /// Push a handler; it runs before anything already on the stack.
    pub fn next(&mut self, handler: Handler) {
        self.stack.push(handler);
    }

    /// Stop dispatch and answer with `status` and `message`.
    pub fn abort(&mut self, status: u16, message: impl Into<AbortMessage>) {
        let abort = Abort::new(status, message);
        self.response.set_status(status);
        self.response
            .set_header("Content-Type", abort.message.content_type());
        self.abort = Some(abort);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    pub fn abort_record(&self) -> Option<&Abort> {
        self.abort.as_ref()
    }

    pub(crate) fn clear_abort(&mut self) -> Option<Abort> {
        self.abort.take()
    }

    /// Attach an execution strategy; it governs every later hop of this request.
    pub fn register_strategy(&mut self, strategy: Strategy) {
        self.strategy = Some(strategy);
    }

    pub fn strategy(&self) -> Option<&Strategy> {
        self.strategy.as_ref()
    }

    pub(crate) fn strategy_mut(&mut self) -> Option<&mut Strategy> {
        self.strategy.as_mut()
    }

    pub(crate) fn take_strategy(&mut self) -> Option<Strategy> {
        self.strategy.take()
    }

    pub(crate) fn has_admitted(&self, gate: &Arc<dyn Gate>) -> bool {
        self.admitted.iter().any(|g| same_gate(g, gate))
    }

    pub(crate) fn admit_gate(&mut self, gate: Arc<dyn Gate>) {
        if !self.has_admitted(&gate) {
            self.admitted.push(gate);
        }
    }

    /// Report the final status once to every gate that admitted the request.
    pub(crate) fn record_gate_outcomes(&self, status: u16) {
        for gate in &self.admitted {
            gate.record(status);
        }
    }

    pub(crate) fn stack(&self) -> &HandlerStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut HandlerStack {
        &mut self.stack
    }

    // ---- response helpers --------------------------------------------------

    /// Serialise `value` as the JSON body with `status`.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: u16, value: &T) {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.response.set_status(status);
                self.response.set_header("Content-Type", MIME_JSON);
                self.response.set_body(body);
            }
            Err(err) => {
                tracing::error!(request_id = %self.request_id, error = %err, "Failed to encode JSON response");
                self.abort(500, "Internal server error");
            }
        }
    }

    pub fn text(&mut self, status: u16, body: impl Into<String>) {
        self.response.set_status(status);
        self.response.set_header("Content-Type", MIME_TEXT);
        self.response.set_body(body.into());
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response.set_header(name, value);
    }

    pub fn response(&self) -> &ResponseContext {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseContext {
        &mut self.response
    }

    /// Copy the abort record, if any, into the response.
    pub(crate) fn apply_abort(&mut self) {
        if let Some(abort) = &self.abort {
            self.response.set_status(abort.status);
            self.response
                .set_header("Content-Type", abort.message.content_type());
            self.response.set_body(abort.message.to_bytes());
        }
    }

    // ---- connection control ------------------------------------------------

    /// Close the connection once this response is written.
    pub fn close_connection(&mut self) {
        self.signal = Signal::Close;
    }

    /// Hand the socket to the detach callback once this response is written.
    pub fn detach_connection(&mut self) {
        self.signal = Signal::Detach;
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub(crate) fn set_signal(&mut self, signal: Signal) {
        self.signal = signal;
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            path: self.path.clone(),
            version: self.version.clone(),
            request_id: self.request_id,
            received_at: self.received_at,
            client_addr: self.client_addr,
            signal: self.signal,
        }
    }

    /// Load a summary into a blank context so it can answer for the original.
    pub(crate) fn restore(&mut self, summary: RequestSummary) {
        self.method = summary.method;
        self.path = summary.path;
        self.version = summary.version;
        self.request_id = summary.request_id;
        self.received_at = summary.received_at;
        self.client_addr = summary.client_addr;
        self.signal = summary.signal;
    }
}

/// Identity by allocation; vtable pointers are not stable across codegen units.
fn same_gate(a: &Arc<dyn Gate>, b: &Arc<dyn Gate>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Reset for RequestContext {
    fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.query.clear();
        self.body.clear();
        self.request_id = Uuid::nil();
        self.client_addr = None;
        self.store.clear();
        self.abort = None;
        self.response.reset();
        self.strategy = None;
        self.admitted.clear();
        self.stack.clear();
        self.signal = Signal::None;
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("request_id", &self.request_id)
            .field("abort", &self.abort)
            .field("stack_len", &self.stack.len())
            .finish_non_exhaustive()
    }
}
