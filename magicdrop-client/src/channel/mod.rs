//! Pairing channel transports.
//!
//! Both sides talk to a [`PubSub`] handle that is constructed once and passed
//! in. [`RelayClient`] speaks the relay's WebSocket protocol; [`LocalBus`]
//! delivers within the process.

use std::{fmt, future::Future};

use magicdrop_core::{ChannelName, ClipboardMessage, CoreError};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;
pub mod relay;

pub use local::LocalBus;
pub use relay::RelayClient;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("already subscribed to {0}")]
    AlreadySubscribed(ChannelName),
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub trait PubSub: Send + Sync {
    /// Resolves once the provider has acknowledged the subscription.
    ///
    /// Messages published before that point are not replayed.
    fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> impl Future<Output = Result<Subscription, ChannelError>> + Send;

    /// Hands `message` to the transport. There is no delivery acknowledgement.
    fn publish(
        &self,
        channel: &ChannelName,
        message: ClipboardMessage,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// A live subscription. Dropping it releases the subscription.
pub struct Subscription {
    channel: ChannelName,
    rx: mpsc::UnboundedReceiver<ClipboardMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        channel: ChannelName,
        rx: mpsc::UnboundedReceiver<ClipboardMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Next message in transport order, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<ClipboardMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("released", &self.release.is_none())
            .finish()
    }
}
