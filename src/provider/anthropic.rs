//! Event-typed streaming provider (Anthropic Messages API).
//!
//! Text and thinking deltas pass straight through. Tool arguments arrive as
//! `input_json_delta` fragments and are only parsed at `content_block_stop`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::StewardError;
use crate::types::{ContentBlock, FinishReason, Message, Role, StreamDelta, ToolInvocation, Usage};

use super::http::{anthropic_headers, post_stream};
use super::json_repair::reconstruct_arguments;
use super::sse::{sse_frames, FrameStream, SseFrame};
use super::{value_as_text, DeltaStream, ModelProvider, ProviderRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model_id: String,
    api_key: String,
    base_url: String,
    inactivity_timeout: Duration,
    request_timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        model_id: String,
        api_key: String,
        base_url: Option<String>,
        inactivity_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            model_id,
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            inactivity_timeout,
            request_timeout,
        }
    }

    fn build_request_body(&self, request: &ProviderRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter_map(message_to_wire)
            .collect();

        let mut body = json!({
            "model": self.model_id,
            "max_tokens": request.model.max_tokens,
            "messages": messages,
            "stream": true,
        });

        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
        }
        match request.model.thinking_budget {
            // The API rejects temperature alongside extended thinking.
            Some(budget) => {
                body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            }
            None => {
                if let Some(temperature) = request.model.temperature {
                    body["temperature"] = json!(temperature);
                }
            }
        }
        body
    }
}

fn message_to_wire(msg: &Message) -> Option<Value> {
    let content: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if text.is_empty() => None,
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::Thinking {
                thinking,
                signature: Some(signature),
            } => Some(json!({
                "type": "thinking",
                "thinking": thinking,
                "signature": signature,
            })),
            // Unsigned thinking cannot be replayed.
            ContentBlock::Thinking { signature: None, .. } => None,
            ContentBlock::ToolUse(call) => Some(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.arguments,
            })),
            ContentBlock::ToolResult(result) => Some(json!({
                "type": "tool_result",
                "tool_use_id": result.tool_use_id,
                "content": value_as_text(&result.content),
                "is_error": result.is_error,
            })),
        })
        .collect();
    if content.is_empty() {
        return None;
    }
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    Some(json!({ "role": role, "content": content }))
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream_turn(&self, request: &ProviderRequest) -> Result<DeltaStream, StewardError> {
        let body = self.build_request_body(request);
        let url = format!("{}/messages", self.base_url);
        debug!(model = %self.model_id, messages = request.messages.len(), "anthropic stream_turn");

        let resp = post_stream(
            &url,
            anthropic_headers(&self.api_key, API_VERSION),
            &body,
            self.request_timeout,
        )
        .await?;

        let frames = sse_frames(resp.bytes_stream(), self.inactivity_timeout);
        Ok(parse_event_stream(frames))
    }
}

struct PendingToolUse {
    id: String,
    name: String,
    raw_arguments: String,
}

/// Turn typed SSE events into normalized deltas.
pub fn parse_event_stream(frames: FrameStream) -> DeltaStream {
    let stream = async_stream::stream! {
        let mut pending: HashMap<u64, PendingToolUse> = HashMap::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut saw_tool_use = false;
        futures::pin_mut!(frames);

        while let Some(frame) = frames.next().await {
            let data = match frame {
                Ok(SseFrame::Data(data)) => data,
                Ok(SseFrame::Done) => continue,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let event: Value = match serde_json::from_str(&data) {
                Ok(event) => event,
                Err(err) => {
                    debug!(error = %err, "skipping undecodable event");
                    continue;
                }
            };
            let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

            match event.get("type").and_then(Value::as_str).unwrap_or("") {
                "message_start" => {
                    if let Some(usage) = event.pointer("/message/usage").and_then(parse_usage) {
                        yield Ok(StreamDelta::Usage(usage));
                    }
                }
                "content_block_start" => {
                    let Some(block) = event.get("content_block") else { continue };
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        pending.insert(index, PendingToolUse {
                            id: str_field(block, "id"),
                            name: str_field(block, "name"),
                            raw_arguments: String::new(),
                        });
                    }
                }
                "content_block_delta" => {
                    let Some(delta) = event.get("delta") else { continue };
                    match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                yield Ok(StreamDelta::Text(text.to_string()));
                            }
                        }
                        "thinking_delta" => {
                            if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                                yield Ok(StreamDelta::Thinking(thinking.to_string()));
                            }
                        }
                        "signature_delta" => {
                            if let Some(sig) = delta.get("signature").and_then(Value::as_str) {
                                yield Ok(StreamDelta::ThinkingSignature(sig.to_string()));
                            }
                        }
                        "input_json_delta" => {
                            if let (Some(call), Some(fragment)) = (
                                pending.get_mut(&index),
                                delta.get("partial_json").and_then(Value::as_str),
                            ) {
                                call.raw_arguments.push_str(fragment);
                            }
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    if let Some(call) = pending.remove(&index) {
                        let (arguments, repaired) = reconstruct_arguments(&call.raw_arguments);
                        saw_tool_use = true;
                        yield Ok(StreamDelta::ToolCall(ToolInvocation {
                            id: call.id,
                            name: call.name,
                            arguments,
                            repaired,
                        }));
                    }
                }
                "message_delta" => {
                    if let Some(stop) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                        finish_reason = Some(map_stop_reason(stop));
                    }
                    if let Some(usage) = event.get("usage").and_then(parse_usage) {
                        yield Ok(StreamDelta::Usage(usage));
                    }
                }
                "message_stop" => {
                    if saw_tool_use {
                        finish_reason = Some(FinishReason::ToolCalls);
                    }
                    yield Ok(StreamDelta::Done { finish_reason });
                    return;
                }
                "error" => {
                    let kind = event.pointer("/error/type").and_then(Value::as_str).unwrap_or("");
                    let message = event
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown stream error")
                        .to_string();
                    yield Err(match kind {
                        "overloaded_error" => StewardError::api(529, message),
                        _ => StewardError::Stream(message),
                    });
                    return;
                }
                _ => {}
            }
        }

        yield Err(StewardError::Stream("stream ended before message_stop".into()));
    };
    Box::pin(stream)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_usage(value: &Value) -> Option<Usage> {
    let count = |key: &str| value.get(key).and_then(Value::as_u64).map(|v| v as u32);
    let usage = Usage {
        input_tokens: count("input_tokens").unwrap_or(0),
        output_tokens: count("output_tokens").unwrap_or(0),
        cache_read_tokens: count("cache_read_input_tokens"),
        cache_creation_tokens: count("cache_creation_input_tokens"),
    };
    (usage != Usage::default()).then_some(usage)
}

fn map_stop_reason(stop: &str) -> FinishReason {
    match stop {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}
