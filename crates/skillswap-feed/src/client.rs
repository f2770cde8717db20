//! STOMP client over a WebSocket with fixed-delay reconnection

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use skillswap_config::ChatConfig;
use skillswap_core::{
    ConnectionState, LiveFeed, Result, SessionContext, Subscription, SwapError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{decode_all, Command, Frame};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection parameters for [`StompFeed`]
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// `ws://` or `wss://` URL of the STOMP endpoint
    pub url: String,

    /// Sent as the `Authorization` header of the CONNECT frame
    pub authorization: Option<String>,

    /// Pause between a lost connection and the next attempt
    pub reconnect_delay: Duration,

    /// Upper bound for opening the socket and for the STOMP handshake
    pub handshake_timeout: Duration,

    /// Capacity of each subscription's event queue
    pub buffer_size: usize,
}

impl FeedOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            authorization: None,
            reconnect_delay: Duration::from_millis(5_000),
            handshake_timeout: Duration::from_secs(10),
            buffer_size: 256,
        }
    }

    pub fn from_config(config: &ChatConfig, session: &SessionContext) -> Self {
        Self {
            url: config.ws_url(),
            authorization: session.bearer(),
            reconnect_delay: Duration::from_millis(config.feed.reconnect_delay_ms),
            handshake_timeout: Duration::from_millis(config.backend.timeout_ms),
            buffer_size: config.feed.buffer_size,
        }
    }
}

struct Route {
    destination: String,
    events: mpsc::Sender<String>,
}

enum Outbound {
    Subscribe(String),
    Unsubscribe(String),
    Send { destination: String, body: String },
    Disconnect,
}

enum SessionEnd {
    /// Shut down on request; do not reconnect
    Closed,
    /// Lost the connection; reconnect after the delay
    Dropped,
}

struct Shared {
    routes: RwLock<HashMap<String, Route>>,
    state: watch::Sender<ConnectionState>,
}

/// Live feed speaking STOMP over a WebSocket.
///
/// A background worker owns the socket. It reconnects after
/// `reconnect_delay` whenever the session ends and re-sends SUBSCRIBE for
/// every subscription that is still registered.
pub struct StompFeed {
    options: FeedOptions,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StompFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompFeed")
            .field("url", &self.options.url)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl StompFeed {
    /// Start connecting in the background. Must be called within a tokio runtime.
    pub fn activate(options: FeedOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            routes: RwLock::new(HashMap::new()),
            state,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        info!("Activating live feed: {}", options.url);
        let worker = tokio::spawn(run(options.clone(), shared.clone(), outbound_rx));

        Self {
            options,
            shared,
            outbound,
            worker: StdMutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, command: Outbound) -> Result<()> {
        self.outbound
            .send(command)
            .map_err(|_| SwapError::Feed("Live feed worker has stopped".into()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwapError::Feed("Live feed is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LiveFeed for StompFeed {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let id = format!("sub-{}", Uuid::new_v4());
        let (events, receiver) = mpsc::channel(self.options.buffer_size);
        self.shared.routes.write().await.insert(
            id.clone(),
            Route {
                destination: topic.to_string(),
                events,
            },
        );
        self.enqueue(Outbound::Subscribe(id.clone()))?;

        debug!("Subscribed {} to {}", id, topic);
        Ok(Subscription {
            id,
            events: receiver,
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if self.shared.routes.write().await.remove(subscription_id).is_none() {
            return Ok(());
        }
        debug!("Unsubscribing {}", subscription_id);
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.enqueue(Outbound::Unsubscribe(subscription_id.to_string()))
    }

    async fn publish(&self, destination: &str, body: String) -> Result<()> {
        self.ensure_open()?;
        if !self.shared.state.borrow().is_connected() {
            return Err(SwapError::NotConnected);
        }
        self.enqueue(Outbound::Send {
            destination: destination.to_string(),
            body,
        })
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing live feed: {}", self.options.url);

        let connected = self.shared.state.borrow().is_connected();
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut handle) = handle {
            if connected && self.enqueue(Outbound::Disconnect).is_ok() {
                if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                    warn!("Live feed did not shut down in time, aborting");
                    handle.abort();
                }
            } else {
                handle.abort();
            }
        }

        self.shared.routes.write().await.clear();
        self.shared.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}

impl Drop for StompFeed {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                debug!("Dropping live feed worker for {}", self.options.url);
                handle.abort();
            }
        }
    }
}

async fn run(
    options: FeedOptions,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        shared.state.send_replace(ConnectionState::Connecting);

        match run_session(&options, &shared, &mut outbound).await {
            Ok(SessionEnd::Closed) => {
                shared.state.send_replace(ConnectionState::Disconnected);
                info!("Live feed session closed");
                return;
            }
            Ok(SessionEnd::Dropped) => warn!("Live feed connection dropped"),
            Err(e) => warn!("Live feed session failed: {}", e),
        }

        shared.state.send_replace(ConnectionState::Disconnected);
        debug!(
            "Reconnecting to {} in {}ms",
            options.url,
            options.reconnect_delay.as_millis()
        );
        tokio::time::sleep(options.reconnect_delay).await;
    }
}

async fn run_session(
    options: &FeedOptions,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<SessionEnd> {
    let request = options.url.as_str().into_client_request().map_err(ws_error)?;
    let host = request.uri().host().unwrap_or("localhost").to_string();

    let (socket, _) = tokio::time::timeout(
        options.handshake_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| SwapError::Feed("Timed out opening WebSocket".into()))?
    .map_err(ws_error)?;
    let (mut sink, mut stream) = socket.split();

    let connect = Frame::connect(&host, options.authorization.as_deref());
    sink.send(Message::Text(connect.encode()))
        .await
        .map_err(ws_error)?;

    let connected = tokio::time::timeout(options.handshake_timeout, await_connected(&mut stream))
        .await
        .map_err(|_| SwapError::Feed("Timed out waiting for CONNECTED".into()))??;
    info!(
        "Live feed connected to {} (STOMP {})",
        options.url,
        connected.get("version").unwrap_or("1.0")
    );
    shared.state.send_replace(ConnectionState::Connected);

    // Subscriptions registered before or during an outage
    let mut active = HashSet::new();
    let routes: Vec<(String, String)> = shared
        .routes
        .read()
        .await
        .iter()
        .map(|(id, route)| (id.clone(), route.destination.clone()))
        .collect();
    for (id, destination) in routes {
        sink.send(Message::Text(Frame::subscribe(&id, &destination).encode()))
            .await
            .map_err(ws_error)?;
        active.insert(id);
    }

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => dispatch(shared, &text).await?,
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8(bytes)
                            .map_err(|e| SwapError::Protocol(format!("Frame is not UTF-8: {}", e)))?;
                        dispatch(shared, &text).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ws_error(e)),
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Subscribe(id)) => {
                        let destination = if active.contains(&id) {
                            None
                        } else {
                            shared.routes.read().await.get(&id).map(|r| r.destination.clone())
                        };
                        if let Some(destination) = destination {
                            sink.send(Message::Text(Frame::subscribe(&id, &destination).encode()))
                                .await
                                .map_err(ws_error)?;
                            active.insert(id);
                        }
                    }
                    Some(Outbound::Unsubscribe(id)) => {
                        if active.remove(&id) {
                            sink.send(Message::Text(Frame::unsubscribe(&id).encode()))
                                .await
                                .map_err(ws_error)?;
                        }
                    }
                    Some(Outbound::Send { destination, body }) => {
                        sink.send(Message::Text(Frame::send(&destination, body).encode()))
                            .await
                            .map_err(ws_error)?;
                    }
                    Some(Outbound::Disconnect) | None => {
                        let disconnect = Frame::new(Command::Disconnect).encode();
                        if let Err(e) = sink.send(Message::Text(disconnect)).await {
                            debug!("Failed to send DISCONNECT: {}", e);
                        }
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Closed);
                    }
                }
            }
        }
    }
}

async fn await_connected<S>(stream: &mut S) -> Result<Frame>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message.map_err(ws_error)? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|e| SwapError::Protocol(format!("Frame is not UTF-8: {}", e)))?,
            Message::Close(_) => break,
            _ => continue,
        };

        for frame in decode_all(&text)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => {
                    return Err(SwapError::Feed(format!(
                        "Broker rejected connection: {}",
                        describe_error(&frame)
                    )));
                }
                other => debug!("Ignoring {} before CONNECTED", other.as_str()),
            }
        }
    }

    Err(SwapError::Feed("Connection closed during STOMP handshake".into()))
}

async fn dispatch(shared: &Shared, text: &str) -> Result<()> {
    for frame in decode_all(text)? {
        match frame.command {
            Command::Message => {
                let Some(id) = frame.get("subscription").map(str::to_string) else {
                    debug!("MESSAGE frame without subscription header");
                    continue;
                };
                let sender = shared.routes.read().await.get(&id).map(|r| r.events.clone());
                match sender {
                    Some(sender) => {
                        if sender.send(frame.body).await.is_err() {
                            debug!("Subscriber {} is gone, dropping event", id);
                        }
                    }
                    None => debug!("MESSAGE for unknown subscription {}", id),
                }
            }
            Command::Error => {
                let reason = describe_error(&frame);
                error!("STOMP error: {}", reason);
                return Err(SwapError::Feed(reason));
            }
            other => debug!("Ignoring {} frame", other.as_str()),
        }
    }
    Ok(())
}

fn describe_error(frame: &Frame) -> String {
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{} ({})", message, body),
        (None, "") => "unspecified error".to_string(),
        (None, body) => body.to_string(),
    }
}

fn ws_error(e: WsError) -> SwapError {
    SwapError::Feed(e.to_string())
}
