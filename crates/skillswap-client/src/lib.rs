use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use skillswap_config::{BackendSettings, ChatConfig};
use skillswap_core::{
    ChatMessage, ConversationKey, ConversationPreview, MessageStore, Result, SessionContext,
    SwapError, UserProfile,
};
use std::time::Duration;
use tracing::{debug, info};

/// HTTP client for the backend's message and profile endpoints
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    session: SessionContext,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("session", &self.session)
            .finish()
    }
}

impl RestClient {
    pub fn new(settings: &BackendSettings, session: SessionContext) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| SwapError::Config(format!("Invalid backend URL '{}': {}", settings.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SwapError::Config(format!(
                "Backend URL '{}' cannot carry a path",
                settings.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| SwapError::Http(format!("Failed to build HTTP client: {}", e)))?;

        info!("REST client for {} as {}", base_url, session.identity);
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        Self::new(&config.backend, config.session()?)
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Backend URL with `segments` appended, each percent-encoded.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SwapError::Config("Backend URL cannot carry a path".into()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer() {
            Some(bearer) => request.header(reqwest::header::AUTHORIZATION, bearer),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SwapError::Http(format!("Failed to send HTTP request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let url = response.url().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(SwapError::Http(format!(
                "{} returned status {}: {}",
                url, status, body
            )));
        }

        Ok(response)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.execute(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| SwapError::Http(format!("Failed to read response body: {}", e)))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Stored messages exchanged between `user1` and `user2`, oldest first
    pub async fn conversation(&self, user1: &str, user2: &str) -> Result<Vec<ChatMessage>> {
        let url = self.endpoint(&["api", "messages", "conversation"])?;
        debug!("Fetching conversation {} <-> {}", user1, user2);

        let request = self.http.get(url).query(&[("user1", user1), ("user2", user2)]);
        self.fetch_json(request).await
    }

    pub async fn send_message(&self, message: &ChatMessage) -> Result<()> {
        let url = self.endpoint(&["api", "messages", "send"])?;
        debug!("Persisting message to {}", message.receiver_email);

        self.execute(self.http.post(url).json(message)).await?;
        Ok(())
    }

    /// Latest message of every conversation the session user takes part in
    pub async fn previews(&self) -> Result<Vec<ConversationPreview>> {
        let url = self.endpoint(&["api", "messages", "previews"])?;
        let request = self
            .http
            .get(url)
            .query(&[("email", self.session.identity.as_str())]);
        self.fetch_json(request).await
    }

    pub async fn user_profile(&self, email: &str) -> Result<UserProfile> {
        let url = self.endpoint(&["api", "users", email])?;
        self.fetch_json(self.http.get(url)).await
    }
}

#[async_trait]
impl MessageStore for RestClient {
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>> {
        self.conversation(key.local(), key.remote()).await
    }

    async fn persist(&self, message: &ChatMessage) -> Result<()> {
        self.send_message(message).await
    }
}
