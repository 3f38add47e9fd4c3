//! Server-sent events over reqwest
//!
//! `SseTransport` keeps a GET request open and turns the `text/event-stream`
//! body into [`StreamEvent`]s. Framing is handled by `SseParser`, which
//! tolerates events split across arbitrary chunk boundaries.

use std::collections::HashMap;

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::{StreamEvent, StreamTransport};

/// Buffered events per connection before the reader applies backpressure
const EVENT_BUFFER: usize = 32;
/// Longest line accepted from an event stream
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Opens event streams with a shared reqwest client
#[derive(Debug, Clone, Default)]
pub struct SseTransport {
    client: Client,
}

impl SseTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl StreamTransport for SseTransport {
    fn open(&self, url: String, headers: HashMap<String, String>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut request = client.get(&url).header("Accept", "text/event-stream");
            for (name, value) in &headers {
                request = request.header(name, value);
            }

            // Stop as soon as the receiver is dropped; the response goes with
            // this task and the connection is closed.
            let sent = tokio::select! {
                sent = request.send() => sent,
                _ = tx.closed() => return,
            };
            let response = match sent {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    debug!(%url, status = response.status().as_u16(), "event stream rejected");
                    let _ = tx.send(StreamEvent::Error { closed: true }).await;
                    return;
                }
                Err(e) => {
                    debug!(%url, error = %e, "event stream connect failed");
                    let _ = tx.send(StreamEvent::Error { closed: true }).await;
                    return;
                }
            };

            if tx.send(StreamEvent::Open).await.is_err() {
                return;
            }

            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    _ = tx.closed() => return,
                };
                match chunk {
                    Some(Ok(bytes)) => match parser.push(&bytes) {
                        Ok(events) => {
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(%url, error = %e, "event stream framing failed");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        debug!(%url, error = %e, "event stream read failed");
                        break;
                    }
                    None => break,
                }
            }

            let _ = tx.send(StreamEvent::Error { closed: true }).await;
        });

        rx
    }
}

/// Framing failure of an event stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    /// A line grew past [`MAX_LINE_BYTES`] without a terminator
    #[error("event stream line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no line terminator
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event completed by it
    ///
    /// # Errors
    /// Returns `SseError::LineTooLong` once an unterminated line exceeds
    /// [`MAX_LINE_BYTES`]; the partial line is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, SseError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let line_end = search_from + offset;
            let mut line = &self.buffer[line_start..line_end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            self.process_line(&line, &mut events);
            line_start = line_end + 1;
            search_from = line_start;
        }

        self.buffer.drain(..line_start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > MAX_LINE_BYTES {
            self.buffer.clear();
            self.scanned = 0;
            return Err(SseError::LineTooLong(MAX_LINE_BYTES));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(StreamEvent::Message {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(event: &str, data: &str) -> StreamEvent {
        StreamEvent::Message {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parses_named_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: features\ndata: {\"a\":1}\n\n").unwrap();
        assert_eq!(events, vec![message("features", "{\"a\":1}")]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: features-upd").unwrap().is_empty());
        assert!(parser.push(b"ated\ndata: x").unwrap().is_empty());
        let events = parser.push(b"\n\n").unwrap();
        assert_eq!(events, vec![message("features-updated", "x")]);
    }

    #[test]
    fn test_crlf_comments_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\r\ndata: one\r\ndata: two\r\n\r\n").unwrap();
        assert_eq!(events, vec![message("message", "one\ntwo")]);
    }

    #[test]
    fn test_blank_lines_without_data_dispatch_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: features\n\n\n").unwrap().is_empty());
        // Event name does not leak into the next event
        let events = parser.push(b"data: y\n\n").unwrap();
        assert_eq!(events, vec![message("message", "y")]);
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: a\ndata: 1\n\nid: 7\nevent: b\ndata:2\n\n").unwrap();
        assert_eq!(events, vec![message("a", "1"), message("b", "2")]);
    }

    #[test]
    fn test_lines_split_over_many_chunks() {
        let mut parser = SseParser::new();
        let input = b"event: features\r\ndata: {\"features\":{}}\r\n\r\n";
        let mut events = Vec::new();
        for byte in input.iter() {
            events.extend(parser.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(events, vec![message("features", "{\"features\":{}}")]);
    }

    #[test]
    fn test_unterminated_line_over_limit_is_rejected() {
        let mut parser = SseParser::new();
        let chunk = vec![b'a'; 64 * 1024];
        let mut result = Ok(Vec::new());
        for _ in 0..(MAX_LINE_BYTES / chunk.len() + 1) {
            result = parser.push(&chunk);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(SseError::LineTooLong(MAX_LINE_BYTES)));

        // The parser starts over after discarding the oversized line
        let events = parser.push(b"\ndata: ok\n\n").unwrap();
        assert_eq!(events, vec![message("message", "ok")]);
    }

    #[tokio::test]
    async fn test_dropping_receiver_closes_quiet_connection() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = Vec::new();
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending a request");
                request.extend_from_slice(&buf[..n]);
            }
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n: keepalive\n\n",
            )
            .await
            .unwrap();

            // Nothing more is sent; only the client can end the connection
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await
            .is_ok()
        });

        let client = Client::builder().no_proxy().build().unwrap();
        let transport = SseTransport::with_client(client);
        let mut rx = transport.open(format!("http://{}/sub/sdk-1", addr), HashMap::new());
        assert_eq!(rx.recv().await, Some(StreamEvent::Open));
        drop(rx);

        assert!(server.await.unwrap(), "connection still open after the receiver was dropped");
    }
}
