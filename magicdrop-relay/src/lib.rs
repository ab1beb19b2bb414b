use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use magicdrop_core::{
    ChannelBroadcast, ChannelName, ControlMessage, MAX_RELAY_MESSAGE_BYTES,
    MAX_SUBSCRIBERS_PER_CHANNEL, WireMessage, decode_frame, encode_frame,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

type ConnectionId = u64;

// Reads above this close the socket; frames between the relay limit and this
// ceiling are dropped one at a time in `handle_socket`.
const MAX_WEBSOCKET_READ_BYTES: usize = 2 * MAX_RELAY_MESSAGE_BYTES;

#[derive(Debug, Default)]
struct Topic {
    subscribers: HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
}

#[derive(Debug, Default)]
struct RelayState {
    topics: HashMap<ChannelName, Topic>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub async fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.inner
            .read()
            .await
            .topics
            .get(channel)
            .map_or(0, |topic| topic.subscribers.len())
    }

    fn allocate_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Runs the relay until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_WEBSOCKET_READ_BYTES)
        .max_message_size(MAX_WEBSOCKET_READ_BYTES)
        .on_upgrade(move |socket| async move {
            handle_socket(state, socket).await;
        })
}

async fn handle_socket(state: AppState, socket: axum::extract::ws::WebSocket) {
    let connection_id = state.allocate_connection_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Split streams only flush queued Pongs when the write half sends, so an
    // idle connection needs periodic writes to stay alive behind proxies.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    info!(connection_id, "connection opened");

    let mut subscriptions: HashSet<ChannelName> = HashSet::new();
    let mut rate_limiter = TokenBucket::new(24.0, 12.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id, "websocket receive error: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => continue,
        };

        if data.len() > MAX_RELAY_MESSAGE_BYTES {
            warn!(connection_id, "dropping oversized message");
            continue;
        }

        let wire = match decode_frame(&data) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(connection_id, "failed to decode frame: {}", err);
                continue;
            }
        };

        match wire {
            WireMessage::Control(ControlMessage::Subscribe { channel }) => {
                match subscribe(&state, &channel, connection_id, &outbound_tx).await {
                    Ok(()) => {
                        info!(connection_id, channel = %channel, "subscribed");
                        subscriptions.insert(channel.clone());
                        send_control(&outbound_tx, ControlMessage::Subscribed { channel });
                    }
                    Err(message) => {
                        warn!(connection_id, channel = %channel, "subscribe refused: {}", message);
                        send_control(
                            &outbound_tx,
                            ControlMessage::Error {
                                channel: Some(channel),
                                message,
                            },
                        );
                    }
                }
            }
            WireMessage::Control(ControlMessage::Unsubscribe { channel }) => {
                if subscriptions.remove(&channel) {
                    unsubscribe(&state, &channel, connection_id).await;
                    info!(connection_id, channel = %channel, "unsubscribed");
                }
            }
            WireMessage::Control(other) => {
                warn!(connection_id, "unexpected control message: {:?}", other);
            }
            WireMessage::Broadcast(broadcast) => {
                if !rate_limiter.consume(1.0) {
                    warn!(connection_id, "rate limit exceeded");
                    continue;
                }
                forward_broadcast(&state, connection_id, broadcast).await;
            }
        }
    }

    for channel in &subscriptions {
        unsubscribe(&state, channel, connection_id).await;
    }
    send_task.abort();
    info!(
        connection_id,
        released = subscriptions.len(),
        "connection closed"
    );
}

async fn subscribe(
    state: &AppState,
    channel: &ChannelName,
    connection_id: ConnectionId,
    tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    let topic = relay.topics.entry(channel.clone()).or_default();
    if topic.subscribers.contains_key(&connection_id) {
        return Err(format!("already subscribed to {}", channel));
    }
    if topic.subscribers.len() >= MAX_SUBSCRIBERS_PER_CHANNEL {
        return Err(format!(
            "channel {} is full (max {})",
            channel, MAX_SUBSCRIBERS_PER_CHANNEL
        ));
    }
    topic.subscribers.insert(connection_id, tx.clone());
    Ok(())
}

async fn unsubscribe(state: &AppState, channel: &ChannelName, connection_id: ConnectionId) {
    let mut relay = state.inner.write().await;
    if let Some(topic) = relay.topics.get_mut(channel) {
        topic.subscribers.remove(&connection_id);
        if topic.subscribers.is_empty() {
            relay.topics.remove(channel);
        }
    }
}

async fn forward_broadcast(
    state: &AppState,
    sender_connection_id: ConnectionId,
    broadcast: ChannelBroadcast,
) {
    let recipients = {
        let relay = state.inner.read().await;
        relay
            .topics
            .get(&broadcast.channel)
            .map(|topic| {
                topic
                    .subscribers
                    .iter()
                    .filter(|(connection_id, _)| **connection_id != sender_connection_id)
                    .map(|(_, tx)| tx.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    if recipients.is_empty() {
        debug!(channel = %broadcast.channel, "broadcast has no subscribers; dropped");
        return;
    }

    let channel = broadcast.channel.clone();
    let frame = match encode_frame(&WireMessage::Broadcast(broadcast)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize broadcast: {}", err);
            return;
        }
    };

    debug!(channel = %channel, recipients = recipients.len(), "forwarding broadcast");
    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}

fn send_control(tx: &mpsc::UnboundedSender<Message>, control: ControlMessage) {
    match encode_frame(&WireMessage::Control(control)) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize control message: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_allows_burst_then_throttles() {
        let mut bucket = TokenBucket::new(3.0, 0.0);
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }

    #[test]
    fn connection_ids_are_unique() {
        let state = AppState::new();
        let a = state.allocate_connection_id();
        let b = state.allocate_connection_id();
        assert_ne!(a, b);
    }
}
