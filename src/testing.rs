//! Test doubles for consumers, transports and timing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};

use crate::consumer::FeatureConsumer;
use crate::transport::{
    HttpRequest, HttpResponse, HttpTransport, StreamEvent, StreamTransport, TransportError,
};

/// Lets spawned tasks run to completion on the current-thread test runtime
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Consumer that records every applied payload
pub(crate) struct TestConsumer {
    host: String,
    client_key: String,
    remote_eval: bool,
    attributes: Map<String, Value>,
    cache_key_attributes: Option<Vec<String>>,
    forced_features: Vec<(String, Value)>,
    payload: Mutex<Option<Value>>,
    applied: Mutex<Vec<Value>>,
    logs: Mutex<Vec<String>>,
}

impl TestConsumer {
    pub(crate) fn new(host: &str, client_key: &str) -> Self {
        Self {
            host: host.to_string(),
            client_key: client_key.to_string(),
            remote_eval: false,
            attributes: Map::new(),
            cache_key_attributes: None,
            forced_features: Vec::new(),
            payload: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn remote_eval(mut self) -> Self {
        self.remote_eval = true;
        self
    }

    pub(crate) fn with_attributes(mut self, attributes: Value) -> Self {
        if let Value::Object(map) = attributes {
            self.attributes = map;
        }
        self
    }

    pub(crate) fn with_cache_key_attributes(mut self, names: &[&str]) -> Self {
        self.cache_key_attributes = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub(crate) fn with_forced_features(mut self, features: Vec<(String, Value)>) -> Self {
        self.forced_features = features;
        self
    }

    pub(crate) fn with_payload(self, payload: Value) -> Self {
        *self.payload.lock().unwrap() = Some(payload);
        self
    }

    pub(crate) fn applied(&self) -> Vec<Value> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeatureConsumer for TestConsumer {
    fn api_host(&self) -> String {
        self.host.clone()
    }

    fn client_key(&self) -> String {
        self.client_key.clone()
    }

    fn is_remote_eval(&self) -> bool {
        self.remote_eval
    }

    fn attributes(&self) -> Map<String, Value> {
        self.attributes.clone()
    }

    fn cache_key_attributes(&self) -> Option<Vec<String>> {
        self.cache_key_attributes.clone()
    }

    fn forced_features(&self) -> Vec<(String, Value)> {
        self.forced_features.clone()
    }

    fn payload(&self) -> Option<Value> {
        self.payload.lock().unwrap().clone()
    }

    async fn set_payload(&self, payload: Value) {
        *self.payload.lock().unwrap() = Some(payload.clone());
        self.applied.lock().unwrap().push(payload);
    }

    fn log(&self, message: &str, _context: &Value) {
        self.logs.lock().unwrap().push(message.to_string());
    }
}

/// HTTP transport returning a configurable canned response
pub(crate) struct MockHttp {
    calls: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
    response: Mutex<Result<HttpResponse, TransportError>>,
    gate: Option<Semaphore>,
}

impl MockHttp {
    pub(crate) fn json(body: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Ok(HttpResponse::new(200, HashMap::new(), body.to_string()))),
            gate: None,
        }
    }

    /// Requests block until [`MockHttp::release`] is called
    pub(crate) fn gated(body: Value) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::json(body)
        }
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1 << 20);
        }
    }

    pub(crate) fn respond(&self, response: Result<HttpResponse, TransportError>) {
        *self.response.lock().unwrap() = response;
    }

    pub(crate) fn respond_json(&self, body: Value) {
        self.respond(Ok(HttpResponse::new(200, HashMap::new(), body.to_string())));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.response.lock().unwrap().clone()
    }
}

/// Stream transport whose connections are driven by the test
#[derive(Default)]
pub(crate) struct MockStream {
    connections: Mutex<Vec<(String, mpsc::Sender<StreamEvent>)>>,
}

impl MockStream {
    pub(crate) fn open_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn url(&self, index: usize) -> String {
        self.connections.lock().unwrap()[index].0.clone()
    }

    /// Sender feeding the most recently opened connection
    pub(crate) fn latest(&self) -> mpsc::Sender<StreamEvent> {
        let connections = self.connections.lock().unwrap();
        connections.last().expect("no connection opened").1.clone()
    }

    pub(crate) fn is_closed(&self, index: usize) -> bool {
        self.connections.lock().unwrap()[index].1.is_closed()
    }
}

impl StreamTransport for MockStream {
    fn open(&self, url: String, _headers: HashMap<String, String>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.connections.lock().unwrap().push((url, tx));
        rx
    }
}
