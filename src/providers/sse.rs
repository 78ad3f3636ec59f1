//! Server-Sent Events decoding for upstream streams and encoding for clients.

use super::{ProviderError, ProviderResult};
use crate::core::logging::get_provider_context;
use async_stream::try_stream;
use futures::stream::{BoxStream, StreamExt};

/// SSE event parsed from stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseEvent {
    /// `data: [DONE]` sentinel used by OpenAI-style streams.
    pub fn is_done(&self) -> bool {
        self.data.as_deref().map(str::trim) == Some("[DONE]")
    }
}

/// Incremental SSE parser; bytes may split events and UTF-8 sequences anywhere.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return the events they complete.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the upstream closed without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => match event.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => event.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    (event.data.is_some() || event.event.is_some()).then_some(event)
}

/// Decode an upstream response body into SSE events.
///
/// The body is polled after the provider scope has ended, so the provider
/// name is captured when the stream is opened.
pub fn event_stream(response: reqwest::Response) -> BoxStream<'static, ProviderResult<SseEvent>> {
    let provider = get_provider_context();
    let mut bytes = response.bytes_stream();
    let stream = try_stream! {
        let mut parser = SseParser::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::debug!(provider = %provider, error = %e, "Upstream stream read failed");
                ProviderError::from(e)
            })?;
            for event in parser.parse(&chunk) {
                yield event;
            }
        }
        if let Some(event) = parser.finish() {
            yield event;
        }
    };
    stream.boxed()
}

/// Format a data-only SSE frame.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";
