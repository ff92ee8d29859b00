//! Both wire formats against a mock HTTP server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{recording_tool, registry_with, CallLog};
use steward::agent_loop::{AgentController, TaskRequest, TaskStatus};
use steward::config::StewardConfig;
use steward::models::{ModelConfig, ProviderKind};
use steward::provider::{complete_turn, create_provider, ProviderRequest};
use steward::types::{FinishReason, Message, StreamDelta};
use steward::util::retry::RetryPolicy;

fn test_retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    }
}

fn sse(events: &[(&str, serde_json::Value)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
        .collect()
}

fn chunks(chunks: &[serde_json::Value]) -> String {
    let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn stream_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn anthropic_text(text: &str) -> String {
    sse(&[
        ("message_start", json!({"type": "message_start", "message": {"usage": {"input_tokens": 12, "output_tokens": 1}}})),
        ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})),
        ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 6}})),
        ("message_stop", json!({"type": "message_stop"})),
    ])
}

fn anthropic_model(server: &MockServer) -> ModelConfig {
    ModelConfig::builder()
        .provider(ProviderKind::Anthropic)
        .model_id("claude-test")
        .base_url(server.uri())
        .build()
}

fn config_with_key(provider: &str) -> StewardConfig {
    let config = StewardConfig::new();
    config.set_api_key(provider, "test-key".to_string());
    config
}

#[tokio::test]
async fn anthropic_tool_round_trip_through_the_controller() {
    let server = MockServer::start().await;
    let tool_turn = sse(&[
        ("message_start", json!({"type": "message_start", "message": {"usage": {"input_tokens": 20, "output_tokens": 1}}})),
        ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {}}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": " \"rain\"}"}})),
        ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}})),
        ("message_stop", json!({"type": "message_stop"})),
    ]);
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .respond_with(stream_response(tool_turn))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(stream_response(anthropic_text("No rain today.")))
        .mount(&server)
        .await;

    let log = CallLog::new();
    let controller = AgentController::new(
        config_with_key("anthropic"),
        registry_with(vec![recording_tool("lookup", &log, json!({"forecast": "dry"}))]),
    )
    .unwrap();
    let result = controller
        .start(
            TaskRequest::builder()
                .prompt("Will it rain?")
                .model(anthropic_model(&server))
                .build(),
        )
        .unwrap()
        .wait()
        .await;

    assert_eq!(result.status, TaskStatus::Finished);
    assert_eq!(result.text.as_deref(), Some("No rain today."));
    assert_eq!(log.count("lookup"), 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let body = second.to_string();
    assert!(body.contains("tool_result"));
    assert!(body.contains("toolu_1"));
    assert!(second["system"].as_str().is_some());
}

#[tokio::test]
async fn openai_chunks_are_collected_into_one_turn() {
    let server = MockServer::start().await;
    let body = chunks(&[
        json!({"choices": [{"delta": {"role": "assistant", "content": "Hel"}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {"content": "lo"}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{\"path\""}}]}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": ": \"a.txt\"}"}}]}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(stream_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let model = ModelConfig::builder()
        .provider(ProviderKind::OpenAi)
        .model_id("gpt-test")
        .base_url(server.uri())
        .build();
    let provider = create_provider(&model, &config_with_key("openai")).unwrap();
    let request = ProviderRequest {
        system: None,
        messages: vec![Message::user("read a.txt")],
        tools: vec![],
        model,
    };
    let seen = std::sync::Mutex::new(Vec::new());
    let observer = |delta: &StreamDelta| seen.lock().unwrap().push(delta.clone());

    let turn = complete_turn(provider.as_ref(), &request, &test_retry_policy(1), &observer)
        .await
        .unwrap();

    assert_eq!(turn.message.text(), "Hello");
    let calls = turn.message.tool_invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].arguments, json!({"path": "a.txt"}));
    assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(turn.usage.input_tokens, 10);
    assert!(seen.lock().unwrap().iter().any(|d| matches!(d, StreamDelta::Text(_))));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream hiccup"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(stream_response(anthropic_text("recovered")))
        .mount(&server)
        .await;

    let model = anthropic_model(&server);
    let provider = create_provider(&model, &config_with_key("anthropic")).unwrap();
    let request = ProviderRequest {
        system: None,
        messages: vec![Message::user("hi")],
        tools: vec![],
        model,
    };
    let turn = complete_turn(provider.as_ref(), &request, &test_retry_policy(3), &|_: &StreamDelta| {})
        .await
        .unwrap();

    assert_eq!(turn.message.text(), "recovered");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_credentials_fail_the_task_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
        .expect(1)
        .mount(&server)
        .await;

    let controller =
        AgentController::new(config_with_key("anthropic"), Arc::new(Default::default())).unwrap();
    let result = controller
        .start(
            TaskRequest::builder()
                .prompt("hello")
                .model(anthropic_model(&server))
                .build(),
        )
        .unwrap()
        .wait()
        .await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.unwrap().contains("invalid x-api-key"));
    assert_eq!(
        result.remediation.as_deref(),
        Some("Check the API key configured for this provider.")
    );
}

#[test]
fn missing_api_key_is_a_configuration_failure() {
    let model: ModelConfig = "anthropic:claude-test".parse().unwrap();
    let err = match create_provider(&model, &StewardConfig::new()) {
        Ok(_) => panic!("expected missing key error"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
}
