//! Server-Sent Events (SSE) streaming support for chat completions.
//!
//! Normalised stream items from any adapter are re-emitted as OpenAI
//! `chat.completion.chunk` events terminated by `data: [DONE]`. Usage is
//! recorded once the upstream stream finishes.

use crate::api::models::{Delta, StreamChoice, StreamChunk, Usage};
use crate::core::{AppError, CancelGuard, Result};
use crate::providers::sse::format_sse_data;
use crate::providers::{estimate_tokens, LLMStream, TokenUsage};
use crate::services::{RequestOutcome, UsageRecorder};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Instant;

pub use crate::providers::sse::SSE_DONE as DONE_EVENT;

/// Accounting state carried through a streamed response.
pub struct StreamContext {
    /// Client-facing model name echoed in every chunk
    pub model: String,
    pub recorder: UsageRecorder,
    /// Pre-filled outcome for the serving key; tokens and latency are set at the end
    pub outcome: RequestOutcome,
    pub started: Instant,
    /// Used when the upstream never reports prompt tokens
    pub input_estimate: u64,
    /// Fires (recording a failure) if the client goes away before the end
    pub guard: CancelGuard,
}

/// Encode one chunk as an SSE `data:` event.
pub fn chunk_event(chunk: &StreamChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => Bytes::from(format_sse_data(&json)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode stream chunk");
            Bytes::new()
        }
    }
}

fn error_event(err: &AppError) -> Bytes {
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": "upstream_error",
            "code": err.status_code().as_u16()
        }
    });
    Bytes::from(format_sse_data(&body.to_string()))
}

struct ChunkBuilder {
    id: String,
    created: i64,
    model: String,
}

impl ChunkBuilder {
    fn chunk(&self, delta: Delta, finish_reason: Option<String>, usage: Option<Usage>) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

/// Build the `text/event-stream` response for an opened upstream stream.
pub fn create_sse_response(stream: LLMStream, ctx: StreamContext) -> Result<Response> {
    let StreamContext {
        model,
        recorder,
        mut outcome,
        started,
        input_estimate,
        mut guard,
    } = ctx;
    let builder = ChunkBuilder {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        created: chrono::Utc::now().timestamp(),
        model,
    };
    let mut items = stream.items;

    let events = async_stream::stream! {
        let role = Delta { role: Some("assistant".to_string()), content: None };
        yield Ok::<Bytes, Infallible>(chunk_event(&builder.chunk(role, None, None)));

        let mut output_len = 0usize;
        let mut usage: Option<TokenUsage> = None;
        let mut finish_reason: Option<String> = None;
        let mut failure: Option<AppError> = None;

        while let Some(item) = items.next().await {
            match item {
                Ok(item) => {
                    if let Some(reported) = item.usage {
                        usage.get_or_insert_with(TokenUsage::default).merge(reported);
                    }
                    if item.finish_reason.is_some() {
                        finish_reason = item.finish_reason.clone();
                    }
                    if !item.text.is_empty() {
                        output_len += item.text.len();
                        let delta = Delta { role: None, content: Some(item.text) };
                        yield Ok(chunk_event(&builder.chunk(delta, None, None)));
                    }
                    if item.done {
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(AppError::from(e));
                    break;
                }
            }
        }

        outcome.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match failure {
            None => {
                let mut usage = usage.unwrap_or_default();
                if usage.input_tokens == 0 {
                    usage.input_tokens = input_estimate;
                }
                if usage.output_tokens == 0 {
                    usage.output_tokens = estimate_tokens(output_len);
                }
                outcome.input_tokens = usage.input_tokens;
                outcome.output_tokens = usage.output_tokens;
                recorder.record_success(&outcome).await;
                guard.disarm();

                let usage = Usage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.input_tokens + usage.output_tokens,
                };
                let finish = finish_reason.unwrap_or_else(|| "stop".to_string());
                yield Ok(chunk_event(&builder.chunk(Delta::default(), Some(finish), Some(usage))));
            }
            Some(err) => {
                tracing::error!(
                    provider = %outcome.provider,
                    key = %outcome.key.id,
                    error = %err,
                    "Upstream stream failed"
                );
                outcome.status = err.status_code().as_u16();
                if err.counts_as_upstream_error() {
                    recorder.record_failure(&outcome).await;
                }
                guard.disarm();
                yield Ok(error_event(&err));
            }
        }
        yield Ok(Bytes::from_static(DONE_EVENT.as_bytes()));
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(events))
        .map_err(|e| AppError::Internal(e.to_string()))
}
