use serde::{Deserialize, Serialize};
use skillswap_core::{Result, SessionContext, SwapError};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    /// WebSocket path of the STOMP endpoint, relative to the backend URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_send_destination")]
    pub send_destination: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Capacity of each subscription's event queue
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ChatConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SwapError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| SwapError::Config(format!("Failed to parse YAML: {}", e)))?;

        // An empty document is a valid, all-defaults config
        let mut tree = match raw {
            serde_yaml::Value::Null => serde_json::Value::Object(Default::default()),
            other => serde_json::to_value(other)
                .map_err(|e| SwapError::Config(format!("Unsupported YAML value: {}", e)))?,
        };
        substitute_env_vars(&mut tree)?;

        let config: ChatConfig = serde_json::from_value(tree)
            .map_err(|e| SwapError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;

        debug!("Loaded configuration for backend {}", config.backend.base_url);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let base = &self.backend.base_url;
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(SwapError::Config(
                "Backend URL must start with http:// or https://".into(),
            ));
        }
        if self.backend.timeout_ms == 0 {
            return Err(SwapError::Config("Backend timeout must be positive".into()));
        }
        if !self.feed.endpoint.starts_with('/') {
            return Err(SwapError::Config("Feed endpoint must start with '/'".into()));
        }
        if self.feed.topic.is_empty() || self.feed.send_destination.is_empty() {
            return Err(SwapError::Config(
                "Feed topic and send destination cannot be empty".into(),
            ));
        }
        if self.feed.reconnect_delay_ms == 0 {
            return Err(SwapError::Config("Reconnect delay must be positive".into()));
        }
        if self.feed.buffer_size == 0 {
            return Err(SwapError::Config("Feed buffer size must be positive".into()));
        }
        Ok(())
    }

    /// WebSocket URL of the live feed, derived from the backend URL.
    pub fn ws_url(&self) -> String {
        let base = self.backend.base_url.trim_end_matches('/');
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{}{}", socket_base, self.feed.endpoint)
    }

    /// Session built from the configured email and token.
    pub fn session(&self) -> Result<SessionContext> {
        let email = self
            .session
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                SwapError::Session("No account email configured (use --email or SKILLSWAP_EMAIL)".into())
            })?;

        let mut session = SessionContext::new(email);
        if let Some(token) = &self.session.token {
            session = session.with_token(token.clone());
        }
        Ok(session)
    }

    pub fn default_config_path() -> PathBuf {
        env::var("SKILLSWAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("skillswap.yaml"))
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            topic: default_topic(),
            send_destination: default_send_destination(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_base_url() -> String { "http://localhost:8080".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_endpoint() -> String { "/chat/websocket".to_string() }
fn default_topic() -> String { "/topic/messages".to_string() }
fn default_send_destination() -> String { "/app/chat.send".to_string() }
fn default_reconnect_delay_ms() -> u64 { 5_000 }
fn default_buffer_size() -> usize { 256 }
