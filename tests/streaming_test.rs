//! Streaming chat completions through the full router.

mod common;

use axum::http::{header, StatusCode};
use common::*;
use llm_gateway::store::{UsageMetric, UsageStore};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UPSTREAM_SSE: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
    "data: [DONE]\n\n",
);

const ANTHROPIC_SSE: &str = concat!(
    "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bon\"}}\n\n",
    "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"jour\"}}\n\n",
    "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
    "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
);

/// `data:` payloads of an SSE body, excluding the terminator.
fn events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[tokio::test]
async fn test_stream_relays_chunks_and_records_usage() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(UPSTREAM_SSE),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let yaml = single_provider_yaml("openai", &upstream.uri(), &["k1"])
        + "model_aliases:\n  fast: openai:gpt-4o-mini\n";
    let gw = TestGateway::from_yaml(&yaml);

    let mut request = hello("fast");
    request["stream"] = json!(true);
    let response = gw.post_json("/v1/chat/completions", request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let body = body_text(response).await;
    assert!(body.ends_with("data: [DONE]\n\n"));

    let chunks = events(&body);
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    assert!(chunks.iter().all(|c| c["model"] == "fast"));
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");

    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello");

    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["usage"]["total_tokens"], 6);

    assert_eq!(gw.store.get_usage("openai", "k1", UsageMetric::Req).await.unwrap(), 1.0);
    assert_eq!(gw.store.get_usage("openai", "k1", UsageMetric::Tokens).await.unwrap(), 6.0);
    assert_eq!(gw.store.get_usage("openai", "k1", UsageMetric::Errors).await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_stream_open_failure_is_json_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "invalid api key"}
        })))
        .mount(&upstream)
        .await;

    let gw = TestGateway::from_yaml(&single_provider_yaml("openai", &upstream.uri(), &["k1"]));
    let mut request = hello("gpt-4o");
    request["stream"] = json!(true);
    let response = gw.post_json("/v1/chat/completions", request).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("invalid api key"));
    assert_eq!(gw.store.get_usage("openai", "k1", UsageMetric::Errors).await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_anthropic_stream_records_split_usage() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(ANTHROPIC_SSE),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = TestGateway::from_yaml(&single_provider_yaml("anthropic", &upstream.uri(), &["k1"]));
    let mut request = hello("claude-3-haiku");
    request["stream"] = json!(true);
    let response = gw.post_json("/v1/chat/completions", request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    let chunks = events(&body);
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Bonjour");

    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "end_turn");
    assert_eq!(last["usage"]["prompt_tokens"], 12);
    assert_eq!(last["usage"]["completion_tokens"], 3);
    assert_eq!(last["usage"]["total_tokens"], 15);

    for (metric, expected) in [
        (UsageMetric::InputTokens, 12.0),
        (UsageMetric::OutputTokens, 3.0),
        (UsageMetric::Tokens, 15.0),
        (UsageMetric::Req, 1.0),
    ] {
        let value = gw.store.get_usage("anthropic", "k1", metric).await.unwrap();
        assert_eq!(value, expected, "{:?}", metric);
    }
}
