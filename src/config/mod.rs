//! Configuration system (layered: code > env > config file).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StewardError;
use crate::guard::autopilot::StrategySpec;
use crate::models::ProviderKind;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Tunables for the agent loop and its control subsystems.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Model calls allowed per run before the task fails.
    pub max_steps: usize,
    /// Conversation log limit, in messages.
    pub history_limit: usize,
    /// Optional estimated-token ceiling for the log.
    pub token_budget: Option<usize>,
    pub tool_timeout_ms: u64,
    /// Bound on each individual stream read.
    pub stream_inactivity_timeout_ms: u64,
    /// Bound on the whole model request.
    pub request_timeout_ms: u64,
    /// Indexed-delta streams fail after this long without semantic progress.
    pub semantic_stall_ms: u64,
    /// Re-read the plan files every N tool calls.
    pub plan_refresh_interval: usize,
    /// Consecutive failures of one tool before the learning collaborator is consulted.
    pub tool_failure_threshold: u32,
    pub transport_max_attempts: u32,
    pub retryable_tool_prefixes: Vec<String>,
    pub loop_detectable_prefixes: Vec<String>,
    /// Extra corrective strategies, tried before the built-in table.
    pub corrective_strategies: Vec<StrategySpec>,
    /// Token a follow-up message must contain to accept degraded outputs.
    pub downgrade_token: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            history_limit: 60,
            token_budget: None,
            tool_timeout_ms: 120_000,
            stream_inactivity_timeout_ms: 90_000,
            request_timeout_ms: 600_000,
            semantic_stall_ms: 60_000,
            plan_refresh_interval: 5,
            tool_failure_threshold: 3,
            transport_max_attempts: 3,
            retryable_tool_prefixes: vec!["browser_".into(), "web_".into(), "http_".into()],
            loop_detectable_prefixes: vec![
                "browser_".into(),
                "desktop_".into(),
                "computer_".into(),
            ],
            corrective_strategies: Vec::new(),
            downgrade_token: "accept-downgrade".into(),
        }
    }
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn stream_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_inactivity_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn semantic_stall(&self) -> Duration {
        Duration::from_millis(self.semantic_stall_ms)
    }

    fn apply_env_overrides(&mut self) {
        override_from_env("STEWARD_MAX_STEPS", &mut self.max_steps);
        override_from_env("STEWARD_HISTORY_LIMIT", &mut self.history_limit);
        override_from_env("STEWARD_TOOL_TIMEOUT_MS", &mut self.tool_timeout_ms);
        override_from_env(
            "STEWARD_STREAM_IDLE_TIMEOUT_MS",
            &mut self.stream_inactivity_timeout_ms,
        );
        override_from_env("STEWARD_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_from_env("STEWARD_SEMANTIC_STALL_MS", &mut self.semantic_stall_ms);
        override_from_env("STEWARD_TRANSPORT_ATTEMPTS", &mut self.transport_max_attempts);
        if let Ok(token) = std::env::var("STEWARD_DOWNGRADE_TOKEN") {
            if !token.trim().is_empty() {
                self.downgrade_token = token.trim().to_string();
            }
        }
    }
}

fn override_from_env<T: std::str::FromStr + PartialOrd + Default>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => *slot = value,
        _ => tracing::warn!(key, value = %raw, "ignoring invalid positive integer override"),
    }
}

/// On-disk shape of `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    api_keys: HashMap<String, String>,
    #[serde(default)]
    base_urls: HashMap<String, String>,
    default_model: Option<String>,
    #[serde(default)]
    agent: Option<AgentSettings>,
}

/// Layered configuration for Steward.
///
/// Resolution order: explicit setters, then environment variables (and `.env`),
/// then the TOML config file.
#[derive(Clone)]
pub struct StewardConfig {
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    base_urls: Arc<RwLock<HashMap<String, String>>>,
    default_model: Option<String>,
    pub agent: AgentSettings,
}

impl fmt::Debug for StewardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<String> = self
            .api_keys
            .read()
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("StewardConfig")
            .field("api_keys", &providers)
            .field("base_urls", &self.base_urls)
            .field("default_model", &self.default_model)
            .field("agent", &self.agent)
            .finish()
    }
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StewardConfig {
    /// Empty config with default agent settings.
    pub fn new() -> Self {
        Self {
            api_keys: Arc::new(RwLock::new(HashMap::new())),
            base_urls: Arc::new(RwLock::new(HashMap::new())),
            default_model: None,
            agent: AgentSettings::default(),
        }
    }

    pub fn with_agent_settings(mut self, agent: AgentSettings) -> Self {
        self.agent = agent;
        self
    }

    /// Default config file location (`<config dir>/steward/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "steward", "steward")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load a TOML config file only (no environment).
    pub fn from_file(path: &Path) -> Result<Self, StewardError> {
        let raw = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|e| {
            StewardError::Configuration(format!("{}: {e}", path.display()))
        })?;
        let config = Self::new();
        for (provider, key) in file.api_keys {
            config.set_api_key(&provider, key);
        }
        for (provider, url) in file.base_urls {
            config.set_base_url(&provider, url);
        }
        Ok(Self {
            default_model: file.default_model,
            agent: file.agent.unwrap_or_default(),
            ..config
        })
    }

    /// Load from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        config.apply_env();
        config
    }

    /// Full layered load: config file (explicit path, else the default
    /// location if present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, StewardError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::new(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();

        let key_mappings = [
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("OPENAI_API_KEY", "openai"),
            ("OPENAI_COMPAT_API_KEY", "openai-compatible"),
        ];
        for (env_var, provider) in key_mappings {
            if let Ok(key) = std::env::var(env_var) {
                self.set_api_key(provider, key);
            }
        }

        let url_mappings = [
            ("ANTHROPIC_BASE_URL", "anthropic"),
            ("OPENAI_BASE_URL", "openai"),
            ("OPENAI_COMPAT_BASE_URL", "openai-compatible"),
        ];
        for (env_var, provider) in url_mappings {
            if let Ok(url) = std::env::var(env_var) {
                self.set_base_url(provider, url);
            }
        }

        if let Ok(model) = std::env::var("STEWARD_MODEL") {
            self.default_model = Some(model);
        }
        self.agent.apply_env_overrides();
    }

    pub fn set_api_key(&self, provider: &str, key: String) {
        if let Ok(mut keys) = self.api_keys.write() {
            keys.insert(provider.to_string(), key);
        }
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.api_keys.read().ok()?.get(provider).cloned()
    }

    pub fn set_base_url(&self, provider: &str, url: String) {
        if let Ok(mut urls) = self.base_urls.write() {
            urls.insert(provider.to_string(), url);
        }
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.read().ok()?.get(provider).cloned()
    }

    /// Resolve the API key for a provider, falling back from
    /// `openai-compatible` to `openai`.
    pub fn api_key_for(&self, provider: ProviderKind) -> Option<String> {
        self.get_api_key(provider.config_key()).or_else(|| match provider {
            ProviderKind::OpenAiCompatible => self.get_api_key("openai"),
            _ => None,
        })
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }
}
