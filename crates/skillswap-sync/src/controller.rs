use skillswap_config::FeedSettings;
use skillswap_core::{
    ChatMessage, ConnectionState, ConversationKey, LiveFeed, MessageStore, Result,
    SessionContext, Subscription, SwapError,
};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::log::{ConversationLog, LiveDisposition};

/// Feed destinations used by a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Topic every chat message is broadcast on
    pub topic: String,
    /// Destination outgoing messages are published to
    pub send_destination: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&FeedSettings::default())
    }
}

impl From<&FeedSettings> for SyncSettings {
    fn from(feed: &FeedSettings) -> Self {
        Self {
            topic: feed.topic.clone(),
            send_destination: feed.send_destination.clone(),
        }
    }
}

/// Result of the one-shot history load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryLoad {
    /// History installed; number of messages kept
    Loaded(usize),
    /// Fetch failed; the list starts empty
    Failed,
    /// Response arrived after dispose or a conversation switch
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// Not attempted, e.g. publishing while the feed is down
    Skipped,
    Failed(String),
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyContent,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message: ChatMessage,
    pub persisted: DeliveryStatus,
    pub published: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Rejected(RejectReason),
    Sent(SendReceipt),
}

struct Listener {
    subscription_id: String,
    task: JoinHandle<()>,
}

struct SyncState {
    session: SessionContext,
    log: ConversationLog,
    /// Bumped on every conversation switch and on dispose
    generation: u64,
    disposed: bool,
    listener: Option<Listener>,
}

struct Shared {
    state: Mutex<SyncState>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn touch(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Message list of one conversation, kept in sync with the backend.
///
/// History is fetched once per conversation; the live feed subscription
/// lives until [`ConversationSync::dispose`] or a switch of either
/// participant. Live events that arrive while the history is loading are
/// held back and appended after it.
pub struct ConversationSync {
    shared: Arc<Shared>,
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn LiveFeed>,
    settings: SyncSettings,
}

impl ConversationSync {
    pub fn new(
        session: SessionContext,
        remote: impl Into<String>,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn LiveFeed>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let key = ConversationKey::new(session.identity.clone(), remote)?;
        let (revision, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SyncState {
                    session,
                    log: ConversationLog::new(key),
                    generation: 0,
                    disposed: false,
                    listener: None,
                }),
                revision,
            }),
            store,
            feed,
            settings,
        })
    }

    /// Subscribe to the live feed, then load the history.
    pub async fn open(&self) -> Result<HistoryLoad> {
        self.attach_live_feed().await?;
        Ok(self.initialize().await)
    }

    /// Fetch the conversation history and install it as the list.
    pub async fn initialize(&self) -> HistoryLoad {
        let (key, generation) = {
            let mut state = self.shared.state.lock().await;
            if state.disposed {
                return HistoryLoad::Discarded;
            }
            if state.log.is_loading() {
                debug!("History load for {} already running", state.log.key());
            }
            state.log.begin_history();
            (state.log.key().clone(), state.generation)
        };

        debug!("Loading history for {}", key);
        let result = self.store.fetch_conversation(&key).await;

        let mut state = self.shared.state.lock().await;
        if state.disposed || state.generation != generation {
            debug!("Discarding stale history for {}", key);
            return HistoryLoad::Discarded;
        }

        let outcome = match result {
            Ok(history) => {
                let kept = state.log.complete_history(history);
                info!("Loaded {} messages for {}", kept, key);
                HistoryLoad::Loaded(kept)
            }
            Err(e) => {
                warn!("Failed to load history for {}: {}", key, e);
                state.log.fail_history();
                HistoryLoad::Failed
            }
        };
        drop(state);

        self.shared.touch();
        outcome
    }

    /// Subscribe to the message topic. Does nothing when already attached.
    pub async fn attach_live_feed(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.disposed {
            return Err(SwapError::Disposed);
        }
        if state.listener.is_some() {
            return Ok(());
        }

        let Subscription { id, events } = self.feed.subscribe(&self.settings.topic).await?;
        let task = tokio::spawn(listen(
            Arc::downgrade(&self.shared),
            state.generation,
            events,
        ));

        debug!("Attached live feed {} for {}", id, state.log.key());
        state.listener = Some(Listener {
            subscription_id: id,
            task,
        });
        Ok(())
    }

    /// Persist `content` and publish it on the live feed.
    ///
    /// The message is not added to the list here; it shows up once the
    /// feed delivers it back.
    pub async fn send(&self, content: impl Into<String>) -> SendOutcome {
        let content = content.into();
        if content.trim().is_empty() {
            return SendOutcome::Rejected(RejectReason::EmptyContent);
        }

        let message = {
            let state = self.shared.state.lock().await;
            if state.disposed {
                return SendOutcome::Rejected(RejectReason::Disposed);
            }
            let key = state.log.key();
            ChatMessage::new(key.local(), key.remote(), content)
        };

        let persisted = match self.store.persist(&message).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(e) => {
                warn!("Failed to persist message: {}", e);
                DeliveryStatus::Failed(e.to_string())
            }
        };

        let published = if self.connected() {
            match self.publish(&message).await {
                Ok(()) => DeliveryStatus::Delivered,
                Err(e) => {
                    warn!("Failed to publish message: {}", e);
                    DeliveryStatus::Failed(e.to_string())
                }
            }
        } else {
            debug!("Live feed down, message not published");
            DeliveryStatus::Skipped
        };

        SendOutcome::Sent(SendReceipt {
            message,
            persisted,
            published,
        })
    }

    async fn publish(&self, message: &ChatMessage) -> Result<()> {
        let body = message.encode()?;
        self.feed.publish(&self.settings.send_destination, body).await
    }

    /// Tear down the subscription and close the feed. Safe to call twice.
    pub async fn dispose(&self) {
        let listener = {
            let mut state = self.shared.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.generation += 1;
            state.listener.take()
        };

        self.detach(listener).await;
        if let Err(e) = self.feed.close().await {
            warn!("Failed to close live feed: {}", e);
        }
        info!("Conversation disposed");
    }

    /// Start over with a different peer.
    pub async fn switch_peer(&self, remote: impl Into<String>) -> Result<HistoryLoad> {
        let remote = remote.into();
        let key = {
            let state = self.shared.state.lock().await;
            ConversationKey::new(state.session.identity.clone(), remote)?
        };
        self.restart(key, None).await
    }

    /// Start over as a different local user, keeping the peer.
    pub async fn switch_session(&self, session: SessionContext) -> Result<HistoryLoad> {
        let key = {
            let state = self.shared.state.lock().await;
            ConversationKey::new(session.identity.clone(), state.log.key().remote())?
        };
        self.restart(key, Some(session)).await
    }

    async fn restart(
        &self,
        key: ConversationKey,
        session: Option<SessionContext>,
    ) -> Result<HistoryLoad> {
        let listener = {
            let mut state = self.shared.state.lock().await;
            if state.disposed {
                return Err(SwapError::Disposed);
            }
            if let Some(session) = session {
                state.session = session;
            }
            info!("Switching conversation {} -> {}", state.log.key(), key);
            state.generation += 1;
            state.log = ConversationLog::new(key);
            state.listener.take()
        };

        self.shared.touch();
        self.detach(listener).await;
        self.open().await
    }

    async fn detach(&self, listener: Option<Listener>) {
        let Some(listener) = listener else {
            return;
        };
        listener.task.abort();
        if let Err(e) = self.feed.unsubscribe(&listener.subscription_id).await {
            debug!("Unsubscribe {} failed: {}", listener.subscription_id, e);
        }
    }

    /// Snapshot of the current list
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.state.lock().await.log.messages().to_vec()
    }

    pub async fn key(&self) -> ConversationKey {
        self.shared.state.lock().await.log.key().clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.shared.state.lock().await.log.is_loaded()
    }

    pub async fn is_disposed(&self) -> bool {
        self.shared.state.lock().await.disposed
    }

    /// Revision counter, bumped whenever the list changes
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn connected(&self) -> bool {
        self.feed.connection_state().borrow().is_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.feed.connection_state()
    }
}

impl Drop for ConversationSync {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            if let Some(listener) = state.listener.take() {
                listener.task.abort();
            }
        }
    }
}

async fn listen(shared: Weak<Shared>, generation: u64, mut events: mpsc::Receiver<String>) {
    while let Some(body) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        let message = match ChatMessage::decode(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring undecodable live event: {}", e);
                continue;
            }
        };

        let mut state = shared.state.lock().await;
        if state.disposed || state.generation != generation {
            break;
        }
        let disposition = state.log.accept_live(message);
        match disposition {
            LiveDisposition::Appended => {
                drop(state);
                shared.touch();
            }
            LiveDisposition::Buffered => debug!("Buffered live event until history loads"),
            LiveDisposition::Duplicate => debug!("Dropped duplicate live event"),
            LiveDisposition::Foreign => {}
        }
    }
    debug!("Live listener finished");
}
