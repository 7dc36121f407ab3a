//! Server-sent events over HTTP.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;

use super::{BoxFuture, Endpoint, EventKind, EventSource, StreamConnector, StreamError, StreamEvent};

pub struct HttpSseConnector {
    client: reqwest::Client,
    path: String,
}

impl HttpSseConnector {
    pub fn new(path: &str, connect_timeout: Duration) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(Self { client, path })
    }

    pub fn url(&self, endpoint: &Endpoint) -> String {
        format!("http://{}:{}{}", endpoint.host, endpoint.port, self.path)
    }
}

impl StreamConnector for HttpSseConnector {
    fn open<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Box<dyn EventSource>, StreamError>> {
        Box::pin(async move {
            let url = self.url(endpoint);
            tracing::debug!(%url, "opening event stream");
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::Status {
                    status: status.as_u16(),
                });
            }
            Ok(Box::new(SseSource {
                response,
                parser: SseParser::default(),
                pending: VecDeque::new(),
            }) as Box<dyn EventSource>)
        })
    }
}

struct SseSource {
    response: reqwest::Response,
    parser: SseParser,
    pending: VecDeque<StreamEvent>,
}

impl EventSource for SseSource {
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<StreamEvent>, StreamError>> {
        Box::pin(async move {
            loop {
                if let Some(event) = self.pending.pop_front() {
                    return Ok(Some(event));
                }
                match self.response.chunk().await? {
                    Some(bytes) => self.pending.extend(self.parser.push(&bytes)?),
                    None => return Ok(None),
                }
            }
        })
    }
}

/// Longest line or frame a worker may send before the stream is dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` decoder. Chunks may split lines and frames
/// anywhere; only complete frames produce events.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    limit: usize,
    event: Option<String>,
    data: Vec<String>,
    data_bytes: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseParser {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
            event: None,
            data: Vec::new(),
            data_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;

        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;
            from = start;
            if let Err(e) = self.line(line.trim_end_matches('\r'), &mut events) {
                self.clear();
                return Err(e);
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.limit {
            self.clear();
            return Err(StreamError::Oversized { limit: self.limit });
        }
        Ok(events)
    }

    fn line(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> Result<(), StreamError> {
        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return Ok(());
        }
        if line.starts_with(':') {
            return Ok(());
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_bytes += value.len();
                if self.data_bytes > self.limit {
                    return Err(StreamError::Oversized { limit: self.limit });
                }
                self.data.push(value.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.event = None;
        self.data.clear();
        self.data_bytes = 0;
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let name = self.event.take();
        let data = std::mem::take(&mut self.data);
        self.data_bytes = 0;
        if name.is_none() && data.is_empty() {
            return None;
        }
        let name = name.unwrap_or_else(|| "message".to_string());
        let kind = match name.parse::<EventKind>() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::debug!(event = %name, "skipping unrecognised stream event");
                return None;
            }
        };
        let data = data.join("\n");
        let payload = if data.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&data).unwrap_or(serde_json::Value::String(data))
        };
        Some(StreamEvent {
            kind,
            payload,
            delivered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: phase-sta").unwrap().is_empty());
        assert!(parser.push(b"rted\ndata: {\"phase\":").unwrap().is_empty());
        let events = parser.push(b" \"plan\"}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PhaseStarted);
        assert_eq!(events[0].payload, json!({ "phase": "plan" }));
    }

    #[test]
    fn comments_crlf_and_unknown_events() {
        let mut parser = SseParser::default();
        let events = parser.push(
            b": keep-alive\r\n\r\nevent: heartbeat\r\ndata: {}\r\n\r\nevent: workflow-complete\r\ndata: done\r\n\r\n",
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::WorkflowComplete);
        assert_eq!(events[0].payload, json!("done"));
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut parser = SseParser::default();
        let events = parser
            .push(b"event: error\ndata: {\"message\":\ndata: \"boom\"}\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({ "message": "boom" }));
    }

    #[test]
    fn endless_line_is_refused() {
        let mut parser = SseParser::with_limit(64);
        assert!(parser.push(&[b'x'; 40]).unwrap().is_empty());
        assert!(matches!(
            parser.push(&[b'x'; 40]),
            Err(StreamError::Oversized { limit: 64 })
        ));
        // state is cleared, later frames decode normally
        let events = parser.push(b"event: phase-complete\ndata: 1\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!(1));
    }

    #[test]
    fn data_lines_without_a_blank_line_are_bounded() {
        let mut parser = SseParser::with_limit(64);
        parser.push(b"event: error\n").unwrap();
        let line = format!("data: {}\n", "y".repeat(30));
        assert!(parser.push(line.as_bytes()).unwrap().is_empty());
        assert!(parser.push(line.as_bytes()).unwrap().is_empty());
        assert!(matches!(
            parser.push(line.as_bytes()),
            Err(StreamError::Oversized { .. })
        ));
    }

    #[test]
    fn byte_at_a_time_feed_decodes() {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        for byte in b"event: action-applied\ndata: {\"id\":7}\n\n" {
            events.extend(parser.push(&[*byte]).unwrap());
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!({ "id": 7 }));
    }

    #[test]
    fn url_normalises_path() {
        let connector = HttpSseConnector::new("stream/progress", Duration::from_secs(5)).unwrap();
        assert_eq!(
            connector.url(&Endpoint::new("127.0.0.1", 4100)),
            "http://127.0.0.1:4100/stream/progress"
        );
    }
}
