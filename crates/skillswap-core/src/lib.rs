use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod time;

/// A single chat message as exchanged with the backend and the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Stable identifier, only present when the backend assigns one
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    pub sender_email: String,
    pub receiver_email: String,
    pub content: String,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    pub fn new(
        sender_email: impl Into<String>,
        receiver_email: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            sender_email: sender_email.into(),
            receiver_email: receiver_email.into(),
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Decode a live feed payload.
    pub fn decode(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_from(&self, identity: &str) -> bool {
        self.sender_email == identity
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// The two participants of a conversation.
///
/// Membership is direction-agnostic: a message belongs to the conversation
/// when its sender/receiver pair equals `{local, remote}` in either order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    local: String,
    remote: String,
}

impl ConversationKey {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Result<Self> {
        let local = local.into();
        let remote = remote.into();
        if local.trim().is_empty() {
            return Err(SwapError::Session("Local identity cannot be empty".into()));
        }
        if remote.trim().is_empty() {
            return Err(SwapError::Session("Remote identity cannot be empty".into()));
        }
        Ok(Self { local, remote })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn contains(&self, message: &ChatMessage) -> bool {
        let sender = message.sender_email.as_str();
        let receiver = message.receiver_email.as_str();
        (sender == self.local && receiver == self.remote)
            || (sender == self.remote && receiver == self.local)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// Identity and credentials of the signed-in user, passed explicitly to
/// every component that talks to the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub identity: String,
    pub token: Option<String>,
}

impl SessionContext {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("identity", &self.identity)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Summary row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPreview {
    pub other_user_email: String,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

impl ConversationPreview {
    pub fn initials(&self) -> String {
        let initials: String = self
            .other_user_name
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .flat_map(char::to_uppercase)
            .collect();
        if initials.is_empty() {
            "?".to_string()
        } else {
            initials
        }
    }

    pub fn display_name(&self) -> &str {
        match self.other_user_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.other_user_email,
        }
    }
}

/// Public profile of another user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

impl UserProfile {
    /// Full name, or `fallback` when the profile carries none.
    pub fn display_name(&self, fallback: &str) -> String {
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let full = full.trim();
        if full.is_empty() {
            fallback.to_string()
        } else {
            full.to_string()
        }
    }
}

/// Live feed connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// An active topic subscription on a live feed.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    /// Raw message bodies in arrival order
    pub events: mpsc::Receiver<String>,
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Live feed error: {0}")]
    Feed(String),

    #[error("STOMP protocol error: {0}")]
    Protocol(String),

    #[error("Live feed is not connected")]
    NotConnected,

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conversation has been disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, SwapError>;

/// Durable message storage behind the backend's REST API.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Full history between the two participants of `key`, oldest first.
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>>;

    /// Store a message so later history fetches include it.
    async fn persist(&self, message: &ChatMessage) -> Result<()>;
}

/// Publish/subscribe transport carrying messages system-wide.
#[async_trait::async_trait]
pub trait LiveFeed: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    async fn publish(&self, destination: &str, body: String) -> Result<()>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<()>;
}
