//! Indexed-delta streaming provider (OpenAI Chat Completions and compatible servers).
//!
//! Tool calls arrive as fragments keyed by `index`; arguments are concatenated
//! per index and parsed once the stream reaches `[DONE]`. A watchdog fails the
//! stream when no semantic progress arrives within the stall window, even if
//! the connection keeps sending keep-alives.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AgentSettings;
use crate::error::StewardError;
use crate::types::{ContentBlock, FinishReason, Message, Role, StreamDelta, ToolInvocation, Usage};

use super::http::{bearer_headers, post_stream};
use super::json_repair::reconstruct_arguments;
use super::sse::{sse_frames, FrameStream, SseFrame};
use super::{value_as_text, DeltaStream, ModelProvider, ProviderRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    name: String,
    model_id: String,
    api_key: String,
    base_url: String,
    inactivity_timeout: Duration,
    request_timeout: Duration,
    stall_window: Duration,
}

impl OpenAiProvider {
    pub fn new(model_id: String, api_key: String, base_url: Option<String>) -> Self {
        let defaults = AgentSettings::default();
        Self {
            name: "openai".into(),
            model_id,
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            inactivity_timeout: defaults.stream_inactivity_timeout(),
            request_timeout: defaults.request_timeout(),
            stall_window: defaults.semantic_stall(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeouts(mut self, inactivity: Duration, request: Duration, stall: Duration) -> Self {
        self.inactivity_timeout = inactivity;
        self.request_timeout = request;
        self.stall_window = stall;
        self
    }

    fn build_request_body(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            messages.extend(message_to_wire(msg));
        }

        let mut body = json!({
            "model": self.model_id,
            "messages": messages,
            "max_tokens": request.model.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = request.model.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

/// One conversation message can expand to several wire messages: each tool
/// result becomes its own `tool` role entry.
fn message_to_wire(msg: &Message) -> Vec<Value> {
    match msg.role {
        Role::User => {
            let mut out: Vec<Value> = msg
                .tool_result_blocks()
                .into_iter()
                .map(|result| {
                    json!({
                        "role": "tool",
                        "tool_call_id": result.tool_use_id,
                        "content": value_as_text(&result.content),
                    })
                })
                .collect();
            let text = msg.text();
            if !text.is_empty() {
                out.push(json!({ "role": "user", "content": text }));
            }
            out
        }
        Role::Assistant => {
            let text = msg.text();
            let tool_calls: Vec<Value> = msg
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse(call) => Some(json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })),
                    _ => None,
                })
                .collect();
            let mut wire = json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { json!(text) },
            });
            if !tool_calls.is_empty() {
                wire["tool_calls"] = json!(tool_calls);
            }
            vec![wire]
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream_turn(&self, request: &ProviderRequest) -> Result<DeltaStream, StewardError> {
        let body = self.build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %self.model_id, "indexed-delta stream_turn");

        let resp = post_stream(&url, bearer_headers(&self.api_key), &body, self.request_timeout).await?;
        let frames = sse_frames(resp.bytes_stream(), self.inactivity_timeout);
        Ok(parse_chunk_stream(frames, self.stall_window))
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u32>,
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    raw_arguments: String,
}

/// Turn index-keyed chunks into normalized deltas, enforcing the
/// semantic-stall window.
pub fn parse_chunk_stream(frames: FrameStream, stall_window: Duration) -> DeltaStream {
    let stream = async_stream::stream! {
        let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut last_progress = Instant::now();
        futures::pin_mut!(frames);

        loop {
            let next = tokio::time::timeout_at(last_progress + stall_window, frames.next()).await;
            let frame = match next {
                Err(_) => {
                    warn!(stall_ms = stall_window.as_millis() as u64, "stream stalled without progress");
                    yield Err(StewardError::StreamStalled(stall_window.as_millis() as u64));
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    yield Err(err);
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let data = match frame {
                SseFrame::Done => {
                    for call in flush_calls(&mut pending) {
                        yield Ok(StreamDelta::ToolCall(call));
                    }
                    yield Ok(StreamDelta::Done { finish_reason });
                    return;
                }
                SseFrame::Data(data) => data,
            };
            let chunk: ChatChunk = match serde_json::from_str(&data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(error = %err, "skipping undecodable chunk");
                    continue;
                }
            };

            if let Some(usage) = chunk.usage {
                last_progress = Instant::now();
                yield Ok(StreamDelta::Usage(Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    cache_read_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
                    cache_creation_tokens: None,
                }));
            }

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    last_progress = Instant::now();
                    yield Ok(StreamDelta::Text(text));
                }
                if let Some(reasoning) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
                    last_progress = Instant::now();
                    yield Ok(StreamDelta::Thinking(reasoning));
                }
                for fragment in choice.delta.tool_calls.unwrap_or_default() {
                    let call = pending.entry(fragment.index).or_default();
                    if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                        call.id = Some(id);
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name {
                            call.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                            last_progress = Instant::now();
                            call.raw_arguments.push_str(&arguments);
                        }
                    }
                }
                if let Some(reason) = choice.finish_reason.as_deref() {
                    finish_reason = Some(map_finish_reason(reason));
                }
            }
        }

        // Some compatible servers close the connection without the sentinel.
        if finish_reason.is_some() {
            for call in flush_calls(&mut pending) {
                yield Ok(StreamDelta::ToolCall(call));
            }
            yield Ok(StreamDelta::Done { finish_reason });
        } else {
            yield Err(StewardError::Stream("stream ended before [DONE]".into()));
        }
    };
    Box::pin(stream)
}

/// Stands in for a call whose name never arrived, so the gateway answers it
/// with an error the model can see.
pub(crate) const UNNAMED_TOOL: &str = "unnamed_tool_call";

fn flush_calls(pending: &mut BTreeMap<u32, PendingCall>) -> Vec<ToolInvocation> {
    std::mem::take(pending)
        .into_iter()
        .map(|(index, call)| {
            let name = if call.name.is_empty() {
                warn!(index, "tool call fragment without a name");
                UNNAMED_TOOL.to_string()
            } else {
                call.name
            };
            let (arguments, repaired) = reconstruct_arguments(&call.raw_arguments);
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{index}_{}", uuid::Uuid::new_v4().simple()));
            ToolInvocation {
                id,
                name,
                arguments,
                repaired,
            }
        })
        .collect()
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        "stop" => FinishReason::Stop,
        _ => FinishReason::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelConfig, ProviderKind};
    use crate::provider::sse::frames_from_iter;
    use crate::types::ToolResultBlock;
    use pretty_assertions::assert_eq;

    fn data(value: Value) -> SseFrame {
        SseFrame::Data(value.to_string())
    }

    fn tool_fragment(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> SseFrame {
        data(json!({
            "choices": [{
                "delta": {"tool_calls": [{
                    "index": index,
                    "id": id,
                    "function": {"name": name, "arguments": args}
                }]},
                "finish_reason": null
            }]
        }))
    }

    #[tokio::test]
    async fn concatenates_arguments_per_index() {
        let frames = vec![
            tool_fragment(0, Some("call_a"), Some("read_file"), "{\"pa"),
            tool_fragment(1, Some("call_b"), Some("list_directory"), "{}"),
            tool_fragment(0, None, None, "th\": \"x\"}"),
            data(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            data(json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}})),
            SseFrame::Done,
        ];
        let deltas: Vec<StreamDelta> = parse_chunk_stream(frames_from_iter(frames), Duration::from_secs(60))
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(
            deltas,
            vec![
                StreamDelta::Usage(Usage { input_tokens: 10, output_tokens: 5, ..Default::default() }),
                StreamDelta::ToolCall(ToolInvocation::new("call_a", "read_file", json!({"path": "x"}))),
                StreamDelta::ToolCall(ToolInvocation::new("call_b", "list_directory", json!({}))),
                StreamDelta::Done { finish_reason: Some(FinishReason::ToolCalls) },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalives_without_progress_trip_the_watchdog() {
        let frames = async_stream::stream! {
            yield Ok(data(json!({"choices": [{"delta": {"content": "Hel"}, "finish_reason": null}]})));
            loop {
                tokio::time::sleep(Duration::from_secs(7)).await;
                // Role-only chunk: the connection is alive but nothing advances.
                yield Ok(data(json!({"choices": [{"delta": {"role": "assistant"}, "finish_reason": null}]})));
            }
        };
        let deltas: Vec<_> = parse_chunk_stream(Box::pin(frames), Duration::from_secs(60))
            .collect()
            .await;

        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[0], Ok(StreamDelta::Text(_))));
        assert!(matches!(deltas[1], Err(StewardError::StreamStalled(60_000))));
    }

    #[tokio::test]
    async fn missing_id_gets_generated_and_close_without_done_needs_finish_reason() {
        let frames = vec![
            tool_fragment(0, None, Some("write_file"), "{\"path\": \"a\""),
            data(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
        ];
        let deltas: Vec<_> = parse_chunk_stream(frames_from_iter(frames), Duration::from_secs(60))
            .collect()
            .await;
        match &deltas[0] {
            Ok(StreamDelta::ToolCall(call)) => {
                assert!(call.id.starts_with("call_0_"));
                assert!(call.repaired);
                assert_eq!(call.arguments["path"], "a");
            }
            other => panic!("unexpected {other:?}"),
        }

        let truncated = vec![data(json!({"choices": [{"delta": {"content": "hi"}, "finish_reason": null}]}))];
        let deltas: Vec<_> = parse_chunk_stream(frames_from_iter(truncated), Duration::from_secs(60))
            .collect()
            .await;
        assert!(matches!(deltas.last(), Some(Err(StewardError::Stream(_)))));
    }

    #[tokio::test]
    async fn nameless_fragment_still_yields_a_call() {
        let frames = vec![
            tool_fragment(0, Some("call_x"), None, "{\"q\": 1}"),
            data(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            SseFrame::Done,
        ];
        let deltas: Vec<StreamDelta> = parse_chunk_stream(frames_from_iter(frames), Duration::from_secs(60))
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(
            deltas[0],
            StreamDelta::ToolCall(ToolInvocation::new("call_x", UNNAMED_TOOL, json!({"q": 1})))
        );
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let provider = OpenAiProvider::new("gpt-test".into(), "key".into(), None);
        let request = ProviderRequest {
            system: Some("sys".into()),
            messages: vec![
                Message::user("go"),
                Message::assistant_blocks(vec![ContentBlock::ToolUse(ToolInvocation::new(
                    "c1",
                    "read_file",
                    json!({"path": "a"}),
                ))]),
                Message::tool_results(vec![ToolResultBlock::ok("c1", json!("contents"))]),
            ],
            tools: vec![],
            model: ModelConfig::new(ProviderKind::OpenAi, "gpt-test"),
        };
        let body = provider.build_request_body(&request);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"path":"a"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(messages[3]["content"], "contents");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("tools").is_none());
    }
}
