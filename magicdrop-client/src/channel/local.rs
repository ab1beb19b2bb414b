use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use magicdrop_core::{ChannelBroadcast, ChannelEvent, ChannelName, ClipboardMessage};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChannelError, PubSub, Subscription};

type SubscriberId = u64;

#[derive(Debug, Default)]
struct LocalBusState {
    topics: HashMap<ChannelName, HashMap<SubscriberId, mpsc::UnboundedSender<ClipboardMessage>>>,
    next_id: SubscriberId,
    published: u64,
    unavailable: bool,
}

/// In-process pub/sub with the same delivery contract as the relay:
/// fan-out to current subscribers, nothing buffered for late ones.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<LocalBusState>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.lock().topics.get(channel).map_or(0, HashMap::len)
    }

    /// Publish calls accepted so far, delivered or not.
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    /// Makes every later subscribe and publish fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, LocalBusState> {
        lock_state(&self.inner)
    }
}

fn lock_state(inner: &Mutex<LocalBusState>) -> MutexGuard<'_, LocalBusState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PubSub for LocalBus {
    async fn subscribe(&self, channel: &ChannelName) -> Result<Subscription, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            if state.unavailable {
                return Err(ChannelError::Unavailable("local bus offline".to_owned()));
            }
            state.next_id += 1;
            let id = state.next_id;
            state
                .topics
                .entry(channel.clone())
                .or_default()
                .insert(id, tx);
            id
        };
        debug!(channel = %channel, subscriber = id, "local subscription added");

        let inner = Arc::clone(&self.inner);
        let topic = channel.clone();
        Ok(Subscription::new(channel.clone(), rx, move || {
            let mut state = lock_state(&inner);
            if let Some(subscribers) = state.topics.get_mut(&topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    state.topics.remove(&topic);
                }
            }
        }))
    }

    async fn publish(
        &self,
        channel: &ChannelName,
        message: ClipboardMessage,
    ) -> Result<(), ChannelError> {
        let ChannelEvent::ClipboardSync(message) =
            ChannelBroadcast::clipboard(channel.clone(), message)?.event;
        let mut state = self.lock();
        if state.unavailable {
            return Err(ChannelError::Unavailable("local bus offline".to_owned()));
        }
        state.published += 1;
        let delivered = state.topics.get(channel).map_or(0, |subscribers| {
            subscribers
                .values()
                .filter(|tx| tx.send(message.clone()).is_ok())
                .count()
        });
        debug!(channel = %channel, delivered, "local publish");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use magicdrop_core::SessionToken;

    use super::*;

    fn channel(token: &str) -> ChannelName {
        ChannelName::for_session(&SessionToken::parse(token).unwrap())
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_channel() {
        let bus = LocalBus::new();
        let topic = channel("fanout");
        let mut first = bus.subscribe(&topic).await.unwrap();
        let mut second = bus.subscribe(&topic).await.unwrap();

        bus.publish(&topic, ClipboardMessage::new("hi").unwrap())
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap().text, "hi");
        assert_eq!(second.recv().await.unwrap().text, "hi");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silently_dropped() {
        let bus = LocalBus::new();
        let topic = channel("nobody");
        bus.publish(&topic, ClipboardMessage::new("lost").unwrap())
            .await
            .unwrap();
        assert_eq!(bus.published_count(), 1);

        // No replay for a late subscriber.
        let mut late = bus.subscribe(&topic).await.unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), late.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn dropping_subscription_releases_it() {
        let bus = LocalBus::new();
        let topic = channel("release");
        let subscription = bus.subscribe(&topic).await.unwrap();
        assert_eq!(bus.subscriber_count(&topic), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn offline_bus_reports_unavailable() {
        let bus = LocalBus::new();
        bus.set_unavailable(true);
        let topic = channel("offline");
        assert!(matches!(
            bus.subscribe(&topic).await,
            Err(ChannelError::Unavailable(_))
        ));
        assert!(matches!(
            bus.publish(&topic, ClipboardMessage::new("x").unwrap()).await,
            Err(ChannelError::Unavailable(_))
        ));
        assert_eq!(bus.published_count(), 0);
    }
}
