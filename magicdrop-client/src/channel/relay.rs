use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use magicdrop_core::{
    ChannelBroadcast, ChannelEvent, ChannelName, ClipboardMessage, ControlMessage, WireMessage,
    decode_frame, encode_frame,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ChannelError, PubSub, Subscription};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
enum Outgoing {
    Frame(WireMessage),
    Close,
}

#[derive(Debug)]
struct PendingSubscription {
    ack: oneshot::Sender<Result<(), String>>,
    messages: mpsc::UnboundedSender<ClipboardMessage>,
}

#[derive(Debug, Default)]
struct Routes {
    active: HashMap<ChannelName, mpsc::UnboundedSender<ClipboardMessage>>,
    pending: HashMap<ChannelName, PendingSubscription>,
}

/// Rolls back an unfinished subscribe: clears the channel's routes and tells
/// the relay to drop a subscription it may already have granted.
struct PendingGuard<'a> {
    routes: &'a Mutex<Routes>,
    outgoing_tx: &'a mpsc::UnboundedSender<Outgoing>,
    channel: &'a ChannelName,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut routes = lock_routes(self.routes);
            routes.pending.remove(self.channel);
            routes.active.remove(self.channel);
        }
        let _ = queue_frame(
            self.outgoing_tx,
            WireMessage::Control(ControlMessage::Unsubscribe {
                channel: self.channel.clone(),
            }),
        );
        debug!(channel = %self.channel, "abandoned subscribe rolled back");
    }
}

fn lock_routes(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection to a `magicdrop-relay` server.
///
/// One WebSocket carries every subscription and publish made through this
/// handle. Call [`RelayClient::close`] to flush queued frames before exit.
#[derive(Debug)]
pub struct RelayClient {
    server_url: String,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    routes: Arc<Mutex<Routes>>,
    send_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
}

impl RelayClient {
    pub async fn connect(server_url: &str) -> Result<Self, ChannelError> {
        let url = Url::parse(server_url)
            .map_err(|err| ChannelError::Unavailable(format!("invalid server URL: {err}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ChannelError::Unavailable(format!(
                "server URL must be ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        let ws_stream = connect_with_retry(server_url).await?;
        info!(server_url, "connected to relay");

        let (write_half, read_half) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let routes = Arc::new(Mutex::new(Routes::default()));

        let send_task = tokio::spawn(network_send_task(write_half, outgoing_rx));
        let receive_task = tokio::spawn(network_receive_task(read_half, Arc::clone(&routes)));

        Ok(Self {
            server_url: server_url.to_owned(),
            outgoing_tx,
            routes,
            send_task: Some(send_task),
            receive_task: Some(receive_task),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn is_connected(&self) -> bool {
        !self.outgoing_tx.is_closed()
    }

    /// Flushes queued frames, sends a close frame and stops the I/O tasks.
    pub async fn close(mut self) {
        let _ = self.outgoing_tx.send(Outgoing::Close);
        if let Some(send_task) = self.send_task.take()
            && timeout(CLOSE_FLUSH_TIMEOUT, send_task).await.is_err()
        {
            warn!("relay connection did not flush before close timeout");
        }
        if let Some(receive_task) = self.receive_task.take() {
            receive_task.abort();
        }
        debug!(server_url = %self.server_url, "relay connection closed");
    }

    fn queue(&self, message: WireMessage) -> Result<(), ChannelError> {
        queue_frame(&self.outgoing_tx, message)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(task) = self.send_task.take() {
            task.abort();
        }
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
    }
}

fn queue_frame(
    outgoing_tx: &mpsc::UnboundedSender<Outgoing>,
    message: WireMessage,
) -> Result<(), ChannelError> {
    outgoing_tx
        .send(Outgoing::Frame(message))
        .map_err(|_| ChannelError::Unavailable("relay connection closed".to_owned()))
}

impl PubSub for RelayClient {
    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, ChannelError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        {
            let mut routes = lock_routes(&self.routes);
            if routes.active.contains_key(channel) || routes.pending.contains_key(channel) {
                return Err(ChannelError::AlreadySubscribed(channel.clone()));
            }
            routes.pending.insert(
                channel.clone(),
                PendingSubscription {
                    ack: ack_tx,
                    messages: messages_tx,
                },
            );
        }

        // Until disarmed, any exit (including the caller dropping this
        // future) takes the attempt's routes back out.
        let mut guard = PendingGuard {
            routes: &self.routes,
            outgoing_tx: &self.outgoing_tx,
            channel,
            armed: true,
        };

        self.queue(WireMessage::Control(ControlMessage::Subscribe {
            channel: channel.clone(),
        }))?;

        match timeout(SUBSCRIBE_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => guard.armed = false,
            Ok(Ok(Err(message))) => {
                guard.armed = false;
                return Err(ChannelError::Unavailable(message));
            }
            Ok(Err(_)) => {
                return Err(ChannelError::Unavailable(
                    "connection closed before subscription was acknowledged".to_owned(),
                ));
            }
            Err(_) => {
                return Err(ChannelError::Unavailable(format!(
                    "subscription not acknowledged within {:?}",
                    SUBSCRIBE_ACK_TIMEOUT
                )));
            }
        }

        info!(channel = %channel, "subscription acknowledged");

        let routes = Arc::clone(&self.routes);
        let outgoing_tx = self.outgoing_tx.clone();
        let topic = channel.clone();
        Ok(Subscription::new(channel.clone(), messages_rx, move || {
            lock_routes(&routes).active.remove(&topic);
            let _ = queue_frame(
                &outgoing_tx,
                WireMessage::Control(ControlMessage::Unsubscribe {
                    channel: topic.clone(),
                }),
            );
            debug!(channel = %topic, "subscription released");
        }))
    }

    async fn publish(
        &self,
        channel: &ChannelName,
        message: ClipboardMessage,
    ) -> Result<(), ChannelError> {
        let broadcast = ChannelBroadcast::clipboard(channel.clone(), message)?;
        self.queue(WireMessage::Broadcast(broadcast))
    }
}

async fn connect_with_retry(server_url: &str) -> Result<WsStream, ChannelError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            server_url,
            "connecting"
        );

        let failure = match timeout(CONNECT_TIMEOUT, connect_async(server_url)).await {
            Ok(Ok((ws_stream, _))) => return Ok(ws_stream),
            Ok(Err(err)) => format!("connect failed: {err}"),
            Err(_) => format!("connect timed out after {:?}", CONNECT_TIMEOUT),
        };
        error!(attempt, server_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(ChannelError::Unavailable(failure));
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = outgoing_rx.recv().await {
        let message = match outgoing {
            Outgoing::Frame(message) => message,
            Outgoing::Close => {
                let _ = ws_write.send(Message::Close(None)).await;
                break;
            }
        };
        match encode_frame(&message) {
            Ok(frame) => {
                if ws_write.send(Message::Binary(frame.into())).await.is_err() {
                    warn!("relay write failed; dropping outgoing queue");
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
}

async fn network_receive_task(
    mut ws_read: futures::stream::SplitStream<WsStream>,
    routes: Arc<Mutex<Routes>>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("relay read failed: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match decode_frame(&data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("decode frame failed: {}", err);
                continue;
            }
        };

        match frame {
            WireMessage::Control(control) => handle_control(&routes, control),
            WireMessage::Broadcast(broadcast) => {
                let ChannelEvent::ClipboardSync(message) = broadcast.event;
                let routes = lock_routes(&routes);
                match routes.active.get(&broadcast.channel) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => debug!(channel = %broadcast.channel, "broadcast for inactive channel"),
                }
            }
        }
    }

    // Dropping the senders ends every open Subscription and fails pending ones.
    let mut routes = lock_routes(&routes);
    routes.active.clear();
    routes.pending.clear();
    info!("relay connection ended");
}

fn handle_control(routes: &Mutex<Routes>, control: ControlMessage) {
    let mut routes = lock_routes(routes);
    match control {
        ControlMessage::Subscribed { channel } => {
            if let Some(pending) = routes.pending.remove(&channel) {
                routes.active.insert(channel, pending.messages);
                let _ = pending.ack.send(Ok(()));
            } else {
                debug!(channel = %channel, "late subscription acknowledgement ignored");
            }
        }
        ControlMessage::Error {
            channel: Some(channel),
            message,
        } => {
            warn!(channel = %channel, "relay error: {}", message);
            if let Some(pending) = routes.pending.remove(&channel) {
                let _ = pending.ack.send(Err(message));
            }
        }
        ControlMessage::Error {
            channel: None,
            message,
        } => warn!("relay error: {}", message),
        other => warn!("unexpected control message from relay: {:?}", other),
    }
}
