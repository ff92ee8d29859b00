//! Model provider trait and the two streaming wire formats.

pub mod collect;
pub mod http;
pub mod json_repair;
pub mod sse;

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "openai")]
pub mod openai;

pub use collect::{collect_turn, complete_turn};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::StewardConfig;
use crate::error::StewardError;
use crate::models::{ModelConfig, ProviderKind};
use crate::types::{Message, StreamDelta};

/// A request sent to a model provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: ModelConfig,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Tool results travel as plain text on both wire formats.
pub(crate) fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalized stream of provider deltas.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, StewardError>>;

/// Core trait implemented by both wire formats.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "anthropic", "openai").
    fn provider_name(&self) -> &str;
    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    /// Open a streaming request. Fails fast on non-2xx responses; mid-stream
    /// failures surface as stream items.
    async fn stream_turn(&self, request: &ProviderRequest) -> Result<DeltaStream, StewardError>;
}

/// Create a provider for the given model, using the provided config.
pub fn create_provider(
    model: &ModelConfig,
    config: &StewardConfig,
) -> Result<Arc<dyn ModelProvider>, StewardError> {
    let api_key = config.api_key_for(model.provider);
    let base_url = model
        .base_url
        .clone()
        .or_else(|| config.get_base_url(model.provider.config_key()));
    let settings = &config.agent;

    match model.provider {
        #[cfg(feature = "anthropic")]
        ProviderKind::Anthropic => {
            let api_key = api_key
                .ok_or_else(|| StewardError::Authentication("Missing ANTHROPIC_API_KEY".into()))?;
            Ok(Arc::new(anthropic::AnthropicProvider::new(
                model.model_id.clone(),
                api_key,
                base_url,
                settings.stream_inactivity_timeout(),
                settings.request_timeout(),
            )))
        }
        #[cfg(feature = "openai")]
        ProviderKind::OpenAi => {
            let api_key = api_key
                .ok_or_else(|| StewardError::Authentication("Missing OPENAI_API_KEY".into()))?;
            Ok(Arc::new(
                openai::OpenAiProvider::new(model.model_id.clone(), api_key, base_url)
                    .with_timeouts(
                        settings.stream_inactivity_timeout(),
                        settings.request_timeout(),
                        settings.semantic_stall(),
                    ),
            ))
        }
        #[cfg(feature = "openai")]
        ProviderKind::OpenAiCompatible => {
            let base_url = base_url.ok_or_else(|| {
                StewardError::Configuration(
                    "openai-compatible requires a base URL (OPENAI_COMPAT_BASE_URL)".into(),
                )
            })?;
            // Local servers often run without auth.
            Ok(Arc::new(
                openai::OpenAiProvider::new(
                    model.model_id.clone(),
                    api_key.unwrap_or_default(),
                    Some(base_url),
                )
                .with_name("openai-compatible")
                .with_timeouts(
                    settings.stream_inactivity_timeout(),
                    settings.request_timeout(),
                    settings.semantic_stall(),
                ),
            ))
        }
        #[allow(unreachable_patterns)]
        other => Err(StewardError::Configuration(format!(
            "Provider '{other}' is not enabled in this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_an_authentication_error() {
        let config = StewardConfig::new();
        let model = ModelConfig::new(ProviderKind::Anthropic, "claude-sonnet-4-5");
        assert!(matches!(
            create_provider(&model, &config),
            Err(StewardError::Authentication(_))
        ));
    }

    #[test]
    fn compatible_provider_needs_base_url_but_not_key() {
        let config = StewardConfig::new();
        let model = ModelConfig::new(ProviderKind::OpenAiCompatible, "qwen");
        assert!(matches!(
            create_provider(&model, &config),
            Err(StewardError::Configuration(_))
        ));

        config.set_base_url("openai-compatible", "http://localhost:1234/v1".into());
        let provider = create_provider(&model, &config).unwrap();
        assert_eq!(provider.provider_name(), "openai-compatible");
        assert_eq!(provider.model_id(), "qwen");
    }
}
