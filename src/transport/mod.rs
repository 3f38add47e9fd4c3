//! Network transports
//!
//! The repository talks to the network through two seams: `HttpTransport`
//! for one-shot requests and `StreamTransport` for server-sent event
//! streams. Both have reqwest-backed defaults and can be replaced, e.g. by
//! in-memory fakes in tests.

mod http;
mod sse;

pub use http::ReqwestTransport;
pub use sse::{SseError, SseParser, SseTransport, MAX_LINE_BYTES};

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised before an HTTP response is available
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request could not be sent or the body could not be read
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.to_string())
    }
}

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// An outgoing HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// A fully read HTTP response
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Builds a response with a lowercase-normalized header map
    pub fn new(status: u16, headers: HashMap<String, String>, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            body: body.into(),
        }
    }

    /// Whether the status is 2xx
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parses the body as JSON
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

/// Performs one-shot HTTP requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Something that happened on a streaming connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The connection is established
    Open,
    /// A named event with its data
    Message { event: String, data: String },
    /// The connection failed; `closed` means it will not recover on its own
    Error { closed: bool },
}

/// Opens server-sent event connections
///
/// The connection lives as long as the returned receiver: dropping it tells
/// the transport to close the connection.
pub trait StreamTransport: Send + Sync {
    fn open(&self, url: String, headers: HashMap<String, String>) -> mpsc::Receiver<StreamEvent>;
}
