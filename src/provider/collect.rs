//! Fold a delta stream into one assistant message.

use futures::StreamExt;
use tracing::{debug, info};

use crate::error::StewardError;
use crate::types::{AssistantTurn, ContentBlock, FinishReason, Message, StreamDelta, Usage};
use crate::util::retry::RetryPolicy;

use super::{DeltaStream, ModelProvider, ProviderRequest};

/// Callback invoked for every delta as it arrives.
pub type DeltaObserver<'a> = &'a (dyn Fn(&StreamDelta) + Send + Sync);

/// Consume `stream` into an [`AssistantTurn`].
///
/// Consecutive text (and thinking) deltas merge into one block; tool calls are
/// kept in arrival order. A stream that ends without `Done` still yields the
/// collected turn.
pub async fn collect_turn(
    mut stream: DeltaStream,
    observer: DeltaObserver<'_>,
) -> Result<AssistantTurn, StewardError> {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut usage = Usage::default();
    let mut finish_reason: Option<FinishReason> = None;

    while let Some(delta) = stream.next().await {
        let delta = delta?;
        observer(&delta);
        match delta {
            StreamDelta::Text(text) => match blocks.last_mut() {
                Some(ContentBlock::Text { text: current }) => current.push_str(&text),
                _ => blocks.push(ContentBlock::Text { text }),
            },
            StreamDelta::Thinking(thinking) => match blocks.last_mut() {
                Some(ContentBlock::Thinking {
                    thinking: current,
                    signature: None,
                }) => current.push_str(&thinking),
                _ => blocks.push(ContentBlock::Thinking {
                    thinking,
                    signature: None,
                }),
            },
            StreamDelta::ThinkingSignature(sig) => {
                let open = blocks.iter_mut().rev().find_map(|block| match block {
                    ContentBlock::Thinking { signature, .. } if signature.is_none() => {
                        Some(signature)
                    }
                    _ => None,
                });
                match open {
                    Some(slot) => *slot = Some(sig),
                    None => debug!("signature without an open thinking block"),
                }
            }
            StreamDelta::ToolCall(call) => blocks.push(ContentBlock::ToolUse(call)),
            StreamDelta::Usage(reported) => usage.absorb(&reported),
            StreamDelta::Restart { .. } => blocks.clear(),
            StreamDelta::Done { finish_reason: reason } => {
                finish_reason = reason;
                break;
            }
        }
    }

    if usage != Usage::default() {
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cache_read_tokens = usage.cache_read_tokens,
            "model usage"
        );
    }

    Ok(AssistantTurn {
        message: Message::assistant_blocks(blocks),
        usage,
        finish_reason,
    })
}

/// Open and collect one turn, retrying transport failures per `retry`.
///
/// A failure after partial output restarts the whole turn; the observer gets
/// [`StreamDelta::Restart`] before each new attempt.
pub async fn complete_turn(
    provider: &dyn ModelProvider,
    request: &ProviderRequest,
    retry: &RetryPolicy,
    observer: DeltaObserver<'_>,
) -> Result<AssistantTurn, StewardError> {
    retry
        .execute_notify(
            || async move {
                let stream = provider.stream_turn(request).await?;
                collect_turn(stream, observer).await
            },
            |attempt, _, _| observer(&StreamDelta::Restart { attempt: attempt + 1 }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelConfig, ProviderKind};
    use crate::types::ToolInvocation;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Drops the connection mid-answer on the first request only.
    #[derive(Default)]
    struct FlakyProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn provider_name(&self) -> &str {
            "flaky"
        }

        fn model_id(&self) -> &str {
            "flaky-model"
        }

        async fn stream_turn(&self, _request: &ProviderRequest) -> Result<DeltaStream, StewardError> {
            let deltas = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![
                    Ok(StreamDelta::Text("The answ".into())),
                    Err(StewardError::Stream("connection reset".into())),
                ]
            } else {
                vec![
                    Ok(StreamDelta::Text("The answer is 4.".into())),
                    Ok(StreamDelta::Done { finish_reason: Some(FinishReason::Stop) }),
                ]
            };
            Ok(stream_of(deltas))
        }
    }

    fn stream_of(deltas: Vec<Result<StreamDelta, StewardError>>) -> DeltaStream {
        Box::pin(futures::stream::iter(deltas))
    }

    #[tokio::test]
    async fn merges_text_and_signs_thinking() {
        let seen = Mutex::new(Vec::new());
        let observer = |d: &StreamDelta| seen.lock().unwrap().push(d.clone());
        let turn = collect_turn(
            stream_of(vec![
                Ok(StreamDelta::Thinking("let me ".into())),
                Ok(StreamDelta::Thinking("check".into())),
                Ok(StreamDelta::ThinkingSignature("sig".into())),
                Ok(StreamDelta::Text("Hel".into())),
                Ok(StreamDelta::Text("lo".into())),
                Ok(StreamDelta::ToolCall(ToolInvocation::new("t1", "read_file", json!({})))),
                Ok(StreamDelta::Usage(Usage { input_tokens: 9, output_tokens: 3, ..Default::default() })),
                Ok(StreamDelta::Done { finish_reason: Some(FinishReason::ToolCalls) }),
            ]),
            &observer,
        )
        .await
        .unwrap();

        assert_eq!(
            turn.message.content,
            vec![
                ContentBlock::Thinking { thinking: "let me check".into(), signature: Some("sig".into()) },
                ContentBlock::Text { text: "Hello".into() },
                ContentBlock::ToolUse(ToolInvocation::new("t1", "read_file", json!({}))),
            ]
        );
        assert_eq!(turn.usage.total_tokens(), 12);
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(seen.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn retried_turn_tells_the_observer_to_start_over() {
        let provider = FlakyProvider::default();
        let request = ProviderRequest {
            system: None,
            messages: vec![Message::user("2 + 2?")],
            tools: vec![],
            model: ModelConfig::new(ProviderKind::Anthropic, "flaky-model"),
        };
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            multiplier: 1.0,
        };
        let seen = Mutex::new(Vec::new());
        let observer = |d: &StreamDelta| seen.lock().unwrap().push(d.clone());

        let turn = complete_turn(&provider, &request, &retry, &observer).await.unwrap();

        assert_eq!(turn.message.text(), "The answer is 4.");
        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                StreamDelta::Text("The answ".into()),
                StreamDelta::Restart { attempt: 2 },
                StreamDelta::Text("The answer is 4.".into()),
                StreamDelta::Done { finish_reason: Some(FinishReason::Stop) },
            ]
        );
    }

    #[tokio::test]
    async fn mid_stream_error_propagates() {
        let result = collect_turn(
            stream_of(vec![
                Ok(StreamDelta::Text("partial".into())),
                Err(StewardError::Stream("connection reset".into())),
            ]),
            &|_: &StreamDelta| {},
        )
        .await;
        assert!(matches!(result, Err(StewardError::Stream(_))));
    }
}
