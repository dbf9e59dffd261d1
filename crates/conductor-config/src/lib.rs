use conductor_core::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    pub chat: ChatSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub endpoints: EndpointSources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Model identifier handed to the completion boundary.
    pub model: String,
    /// Base URL of an OpenAI-compatible chat-completions provider.
    #[serde(default = "default_provider_url")]
    pub provider_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Model rounds per turn before force-terminating.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Ceiling on the flattened tool count per turn.
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,
    /// Retries after the first attempt when the provider is overloaded.
    #[serde(default = "default_completion_retries")]
    pub completion_retries: u32,
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

/// Where endpoint declarations are loaded from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSources {
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    #[serde(default)]
    pub config_dirs: Vec<PathBuf>,
}

impl ConductorConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConductorError::Config(format!("failed to read config file: {e}")))?;
        Self::from_str(&content)
    }

    pub fn from_str(yaml: &str) -> Result<Self> {
        let mut config: ConductorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConductorError::Config(format!("failed to parse YAML: {e}")))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(model) = env::var("CONDUCTOR_MODEL") {
            self.chat.model = model;
        }
        if let Ok(url) = env::var("CONDUCTOR_PROVIDER_URL") {
            self.chat.provider_url = url;
        }
        if let Ok(key) = env::var("CONDUCTOR_API_KEY") {
            self.chat.api_key = Some(key);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chat.model.is_empty() {
            return Err(ConductorError::Config("model cannot be empty".into()));
        }
        if self.chat.provider_url.is_empty() {
            return Err(ConductorError::Config(
                "provider URL cannot be empty".into(),
            ));
        }
        if self.limits.max_rounds == 0 {
            return Err(ConductorError::Config(
                "max_rounds must be at least 1".into(),
            ));
        }
        if self.limits.max_tools == 0 {
            return Err(ConductorError::Config(
                "max_tools must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        let home = env::var("CONDUCTOR_HOME")
            .unwrap_or_else(|_| env::var("HOME").unwrap_or_else(|_| ".".to_string()));
        PathBuf::from(home).join(".conductor").join("conductor.yaml")
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            chat: ChatSettings {
                model: "gpt-4o".to_string(),
                provider_url: default_provider_url(),
                api_key: env::var("CONDUCTOR_API_KEY").ok(),
                max_tokens: default_max_tokens(),
                system_prompt: None,
            },
            limits: LimitSettings::default(),
            endpoints: EndpointSources::default(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_tools: default_max_tools(),
            completion_retries: default_completion_retries(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

fn default_provider_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_rounds() -> usize {
    5
}
fn default_max_tools() -> usize {
    50
}
fn default_completion_retries() -> u32 {
    2
}
fn default_retry_initial_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    8_000
}
