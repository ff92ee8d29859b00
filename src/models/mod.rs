//! Model selection: which provider, which model, which wire format.

use std::fmt;
use std::str::FromStr;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::StewardError;

/// Supported model services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    #[strum(to_string = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    #[strum(to_string = "openai-compatible")]
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

/// The two streaming wire variants the adapter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Typed block events (`content_block_start` / `_delta` / `_stop`).
    EventTyped,
    /// Index-keyed delta fragments terminated by `[DONE]`.
    IndexedDelta,
}

impl ProviderKind {
    pub fn wire_format(self) -> WireFormat {
        match self {
            Self::Anthropic => WireFormat::EventTyped,
            Self::OpenAi | Self::OpenAiCompatible => WireFormat::IndexedDelta,
        }
    }

    /// Key under which credentials and base URLs are stored in config.
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }
}

/// Provider/model configuration attached to a task.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    #[builder(into)]
    pub model_id: String,
    #[builder(default = 8192)]
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Extended-thinking budget (event-typed providers only).
    pub thinking_budget: Option<u32>,
    /// Per-model base URL; falls back to the config's provider base URL.
    #[builder(into)]
    pub base_url: Option<String>,
}

fn default_max_tokens() -> u32 {
    8192
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        Self::builder().provider(provider).model_id(model_id).build()
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}

impl FromStr for ModelConfig {
    type Err = StewardError;

    /// Parse `provider:model`, e.g. `anthropic:claude-sonnet-4-5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model_id) = s.split_once(':').ok_or_else(|| {
            StewardError::Configuration(format!(
                "invalid model '{s}': expected provider:model (e.g. anthropic:claude-sonnet-4-5)"
            ))
        })?;
        let provider = ProviderKind::from_str(provider.trim()).map_err(|_| {
            StewardError::Configuration(format!("unknown provider '{provider}'"))
        })?;
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(StewardError::Configuration(format!(
                "invalid model '{s}': empty model id"
            )));
        }
        Ok(Self::new(provider, model_id))
    }
}
