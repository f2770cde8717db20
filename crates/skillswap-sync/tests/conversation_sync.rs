use async_trait::async_trait;
use mockall::mock;
use skillswap_core::{
    ChatMessage, ConnectionState, ConversationKey, LiveFeed, MessageStore, Result,
    SessionContext, Subscription, SwapError,
};
use skillswap_sync::{
    ConversationSync, DeliveryStatus, HistoryLoad, RejectReason, SendOutcome, SyncSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(50);

mock! {
    pub Store {}

    #[async_trait]
    impl MessageStore for Store {
        async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>>;
        async fn persist(&self, message: &ChatMessage) -> Result<()>;
    }
}

/// In-memory live feed that records what the controller does with it.
struct FakeFeed {
    state: watch::Sender<ConnectionState>,
    routes: Mutex<HashMap<String, mpsc::Sender<String>>>,
    published: Mutex<Vec<(String, String)>>,
    unsubscribed: Mutex<Vec<String>>,
    subscribes: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeFeed {
    fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: watch::Sender::new(state),
            routes: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            subscribes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    fn connected() -> Arc<Self> {
        Self::new(ConnectionState::Connected)
    }

    fn senders(&self) -> Vec<mpsc::Sender<String>> {
        self.routes.lock().unwrap().values().cloned().collect()
    }

    async fn emit(&self, message: &ChatMessage) {
        self.emit_raw(&message.encode().unwrap()).await;
    }

    async fn emit_raw(&self, body: &str) {
        for sender in self.senders() {
            let _ = sender.send(body.to_string()).await;
        }
    }

    fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveFeed for FakeFeed {
    async fn subscribe(&self, _topic: &str) -> Result<Subscription> {
        let n = self.subscribes.fetch_add(1, Ordering::SeqCst);
        let id = format!("sub-{n}");
        let (tx, rx) = mpsc::channel(16);
        self.routes.lock().unwrap().insert(id.clone(), tx);
        Ok(Subscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.routes.lock().unwrap().remove(subscription_id);
        self.unsubscribed
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }

    async fn publish(&self, destination: &str, body: String) -> Result<()> {
        if !self.state.borrow().is_connected() {
            return Err(SwapError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((destination.to_string(), body));
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.routes.lock().unwrap().clear();
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}

/// Store whose history fetch blocks until released.
struct GatedStore {
    history: Vec<ChatMessage>,
    started: Notify,
    gate: Notify,
}

impl GatedStore {
    fn new(history: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            history,
            started: Notify::new(),
            gate: Notify::new(),
        })
    }
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn fetch_conversation(&self, _key: &ConversationKey) -> Result<Vec<ChatMessage>> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(self.history.clone())
    }

    async fn persist(&self, _message: &ChatMessage) -> Result<()> {
        Ok(())
    }
}

fn msg(from: &str, to: &str, content: &str) -> ChatMessage {
    ChatMessage::new(from, to, content)
}

fn contents(messages: &[ChatMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

fn session() -> SessionContext {
    SessionContext::new("a@x.com")
}

fn history_store(history: Vec<ChatMessage>) -> MockStore {
    let mut store = MockStore::new();
    store
        .expect_fetch_conversation()
        .returning(move |_| Ok(history.clone()));
    store
}

fn controller(store: Arc<dyn MessageStore>, feed: Arc<FakeFeed>) -> ConversationSync {
    ConversationSync::new(session(), "b@x.com", store, feed, SyncSettings::default()).unwrap()
}

async fn wait_for_messages(sync: &ConversationSync, len: usize) -> Vec<ChatMessage> {
    timeout(WAIT, async {
        loop {
            let messages = sync.messages().await;
            if messages.len() >= len {
                return messages;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("messages did not arrive in time")
}

#[tokio::test]
async fn merges_history_with_matching_live_events() {
    let store = history_store(vec![msg("a@x.com", "b@x.com", "hi")]);
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());

    assert_eq!(sync.open().await.unwrap(), HistoryLoad::Loaded(1));
    assert_eq!(contents(&sync.messages().await), vec!["hi"]);

    feed.emit(&msg("b@x.com", "a@x.com", "yo")).await;
    feed.emit(&msg("c@x.com", "a@x.com", "spam")).await;

    wait_for_messages(&sync, 2).await;
    sleep(SETTLE).await;

    let messages = sync.messages().await;
    assert_eq!(
        messages,
        vec![
            msg("a@x.com", "b@x.com", "hi"),
            msg("b@x.com", "a@x.com", "yo")
        ]
    );
}

#[tokio::test]
async fn updates_fire_when_list_changes() {
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(history_store(vec![])), feed.clone());
    let mut updates = sync.updates();

    sync.open().await.unwrap();
    timeout(WAIT, updates.changed()).await.unwrap().unwrap();

    feed.emit(&msg("b@x.com", "a@x.com", "ping")).await;
    timeout(WAIT, updates.changed()).await.unwrap().unwrap();
    assert_eq!(contents(&sync.messages().await), vec!["ping"]);
}

#[tokio::test]
async fn undecodable_events_are_skipped() {
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(history_store(vec![])), feed.clone());
    sync.open().await.unwrap();

    feed.emit_raw("not json").await;
    feed.emit(&msg("b@x.com", "a@x.com", "after")).await;

    let messages = wait_for_messages(&sync, 1).await;
    assert_eq!(contents(&messages), vec!["after"]);
}

#[tokio::test]
async fn empty_content_is_rejected_without_requests() {
    let mut store = history_store(vec![]);
    store.expect_persist().never();
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());
    sync.open().await.unwrap();

    assert_eq!(
        sync.send("").await,
        SendOutcome::Rejected(RejectReason::EmptyContent)
    );
    assert_eq!(
        sync.send(" \n\t ").await,
        SendOutcome::Rejected(RejectReason::EmptyContent)
    );
    assert!(feed.published().is_empty());
    assert!(sync.messages().await.is_empty());
}

#[tokio::test]
async fn send_persists_and_publishes_without_local_echo() {
    let mut store = history_store(vec![]);
    store
        .expect_persist()
        .withf(|m| m.sender_email == "a@x.com" && m.receiver_email == "b@x.com")
        .times(1)
        .returning(|_| Ok(()));
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());
    sync.open().await.unwrap();

    let SendOutcome::Sent(receipt) = sync.send("hello").await else {
        panic!("message was rejected");
    };
    assert_eq!(receipt.persisted, DeliveryStatus::Delivered);
    assert_eq!(receipt.published, DeliveryStatus::Delivered);
    assert_eq!(receipt.message, msg("a@x.com", "b@x.com", "hello"));

    let published = feed.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "/app/chat.send");
    assert_eq!(
        ChatMessage::decode(&published[0].1).unwrap(),
        receipt.message
    );

    sleep(SETTLE).await;
    assert!(sync.messages().await.is_empty());
}

#[tokio::test]
async fn send_skips_publish_while_disconnected() {
    let mut store = history_store(vec![]);
    store.expect_persist().times(1).returning(|_| Ok(()));
    let feed = FakeFeed::new(ConnectionState::Connecting);
    let sync = controller(Arc::new(store), feed.clone());
    sync.open().await.unwrap();

    assert!(!sync.connected());
    let SendOutcome::Sent(receipt) = sync.send("offline").await else {
        panic!("message was rejected");
    };
    assert_eq!(receipt.persisted, DeliveryStatus::Delivered);
    assert_eq!(receipt.published, DeliveryStatus::Skipped);
    assert!(feed.published().is_empty());
}

#[tokio::test]
async fn persist_failure_does_not_block_publish() {
    let mut store = history_store(vec![]);
    store
        .expect_persist()
        .returning(|_| Err(SwapError::Http("500 Internal Server Error".into())));
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());
    sync.open().await.unwrap();

    let SendOutcome::Sent(receipt) = sync.send("hi").await else {
        panic!("message was rejected");
    };
    assert!(matches!(receipt.persisted, DeliveryStatus::Failed(_)));
    assert!(receipt.published.is_delivered());
}

#[tokio::test]
async fn failed_history_leaves_list_empty_and_keeps_live_feed() {
    let mut store = MockStore::new();
    store
        .expect_fetch_conversation()
        .returning(|_| Err(SwapError::Http("connection refused".into())));
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());

    assert_eq!(sync.open().await.unwrap(), HistoryLoad::Failed);
    assert!(sync.messages().await.is_empty());
    assert!(sync.is_loaded().await);

    feed.emit(&msg("b@x.com", "a@x.com", "still here")).await;
    let messages = wait_for_messages(&sync, 1).await;
    assert_eq!(contents(&messages), vec!["still here"]);
}

#[tokio::test]
async fn dispose_stops_mutation_and_is_idempotent() {
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(history_store(vec![])), feed.clone());
    sync.open().await.unwrap();

    feed.emit(&msg("b@x.com", "a@x.com", "before")).await;
    wait_for_messages(&sync, 1).await;

    let stale = feed.senders();
    sync.dispose().await;
    sync.dispose().await;

    for sender in stale {
        let _ = sender.send(msg("b@x.com", "a@x.com", "after").encode().unwrap()).await;
    }
    sleep(SETTLE).await;

    assert_eq!(contents(&sync.messages().await), vec!["before"]);
    assert_eq!(feed.closes.load(Ordering::SeqCst), 1);
    assert_eq!(*feed.unsubscribed.lock().unwrap(), vec!["sub-0".to_string()]);
    assert!(sync.is_disposed().await);
    assert_eq!(
        sync.send("late").await,
        SendOutcome::Rejected(RejectReason::Disposed)
    );
    assert!(matches!(
        sync.attach_live_feed().await,
        Err(SwapError::Disposed)
    ));
}

#[tokio::test]
async fn attach_twice_keeps_one_subscription() {
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(history_store(vec![])), feed.clone());

    sync.attach_live_feed().await.unwrap();
    sync.attach_live_feed().await.unwrap();
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn switching_peer_starts_a_fresh_conversation() {
    let mut store = MockStore::new();
    store
        .expect_fetch_conversation()
        .withf(|key| key.remote() == "b@x.com")
        .returning(|_| Ok(vec![msg("a@x.com", "b@x.com", "to b")]));
    store
        .expect_fetch_conversation()
        .withf(|key| key.remote() == "c@x.com")
        .returning(|_| Ok(vec![msg("c@x.com", "a@x.com", "from c")]));
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());

    sync.open().await.unwrap();
    assert_eq!(contents(&sync.messages().await), vec!["to b"]);

    assert_eq!(
        sync.switch_peer("c@x.com").await.unwrap(),
        HistoryLoad::Loaded(1)
    );
    assert_eq!(sync.key().await.remote(), "c@x.com");
    assert_eq!(contents(&sync.messages().await), vec!["from c"]);
    assert_eq!(*feed.unsubscribed.lock().unwrap(), vec!["sub-0".to_string()]);
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 2);

    feed.emit(&msg("b@x.com", "a@x.com", "old peer")).await;
    feed.emit(&msg("a@x.com", "c@x.com", "new peer")).await;
    wait_for_messages(&sync, 2).await;
    sleep(SETTLE).await;
    assert_eq!(contents(&sync.messages().await), vec!["from c", "new peer"]);
}

#[tokio::test]
async fn switching_session_changes_sender() {
    let mut store = history_store(vec![]);
    store
        .expect_persist()
        .withf(|m| m.sender_email == "z@x.com" && m.receiver_email == "b@x.com")
        .times(1)
        .returning(|_| Ok(()));
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());
    sync.open().await.unwrap();

    sync.switch_session(SessionContext::new("z@x.com"))
        .await
        .unwrap();
    assert_eq!(sync.key().await.local(), "z@x.com");
    assert!(matches!(sync.send("hey").await, SendOutcome::Sent(_)));
}

#[tokio::test]
async fn empty_peer_is_rejected() {
    let feed = FakeFeed::connected();
    let result = ConversationSync::new(
        session(),
        "",
        Arc::new(MockStore::new()),
        feed,
        SyncSettings::default(),
    );
    assert!(matches!(result, Err(SwapError::Session(_))));
}

#[tokio::test]
async fn live_events_during_history_load_follow_the_history() {
    let store = GatedStore::new(vec![msg("b@x.com", "a@x.com", "old").with_id("1")]);
    let feed = FakeFeed::connected();
    let sync = Arc::new(controller(store.clone(), feed.clone()));

    sync.attach_live_feed().await.unwrap();
    let load = tokio::spawn({
        let sync = sync.clone();
        async move { sync.initialize().await }
    });
    timeout(WAIT, store.started.notified()).await.unwrap();

    feed.emit(&msg("b@x.com", "a@x.com", "old").with_id("1")).await;
    feed.emit(&msg("a@x.com", "b@x.com", "early").with_id("2")).await;
    sleep(SETTLE).await;
    assert!(sync.messages().await.is_empty());

    store.gate.notify_one();
    assert_eq!(timeout(WAIT, load).await.unwrap().unwrap(), HistoryLoad::Loaded(1));

    let messages = wait_for_messages(&sync, 2).await;
    assert_eq!(contents(&messages), vec!["old", "early"]);
}

#[tokio::test]
async fn history_arriving_after_dispose_is_ignored() {
    let store = GatedStore::new(vec![msg("a@x.com", "b@x.com", "late")]);
    let feed = FakeFeed::connected();
    let sync = Arc::new(controller(store.clone(), feed.clone()));

    let load = tokio::spawn({
        let sync = sync.clone();
        async move { sync.open().await }
    });
    timeout(WAIT, store.started.notified()).await.unwrap();

    sync.dispose().await;
    store.gate.notify_one();

    let outcome = timeout(WAIT, load).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, HistoryLoad::Discarded);
    assert!(sync.messages().await.is_empty());
}

#[tokio::test]
async fn live_events_appear_without_history_load() {
    let mut store = MockStore::new();
    store.expect_fetch_conversation().never();
    let feed = FakeFeed::connected();
    let sync = controller(Arc::new(store), feed.clone());

    sync.attach_live_feed().await.unwrap();
    feed.emit(&msg("b@x.com", "a@x.com", "live")).await;

    let messages = wait_for_messages(&sync, 1).await;
    assert_eq!(contents(&messages), vec!["live"]);
    assert!(!sync.is_loaded().await);
}

#[tokio::test]
async fn history_arriving_after_peer_switch_is_ignored() {
    let store = GatedStore::new(vec![msg("a@x.com", "b@x.com", "for b")]);
    let feed = FakeFeed::connected();
    let sync = Arc::new(controller(store.clone(), feed.clone()));

    let first = tokio::spawn({
        let sync = sync.clone();
        async move { sync.initialize().await }
    });
    timeout(WAIT, store.started.notified()).await.unwrap();

    let second = tokio::spawn({
        let sync = sync.clone();
        async move { sync.switch_peer("c@x.com").await }
    });
    timeout(WAIT, store.started.notified()).await.unwrap();

    store.gate.notify_one();
    store.gate.notify_one();

    assert_eq!(
        timeout(WAIT, first).await.unwrap().unwrap(),
        HistoryLoad::Discarded
    );
    assert_eq!(
        timeout(WAIT, second).await.unwrap().unwrap().unwrap(),
        HistoryLoad::Loaded(0)
    );
    assert_eq!(sync.key().await.remote(), "c@x.com");
    assert!(sync.messages().await.is_empty());
}
