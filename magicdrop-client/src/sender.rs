use std::io::Write;

use magicdrop_core::{
    ChannelBroadcast, ChannelEvent, ChannelName, ClipboardMessage, CoreError, SessionToken,
    session_from_link,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    channel::PubSub,
    clipboard::{Clipboard, ClipboardError, fingerprint},
};

pub const STATUS_TAP_TO_SEND: &str = "Tap to Send";
pub const STATUS_READING: &str = "Reading...";
pub const STATUS_SENDING: &str = "Sending...";
pub const STATUS_SENT: &str = "Sent!";
pub const STATUS_TAP_TO_GRANT_ACCESS: &str = "Tap to Grant Access";
pub const STATUS_TOO_LARGE: &str = "Too Large to Send";
pub const STATUS_INVALID_SESSION: &str = "Error: Invalid Session";

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),
    #[error("clipboard not sendable: {0}")]
    Rejected(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    ReadyToSend,
    Reading,
    Sending,
    Sent,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    Tap,
    ReadSucceeded,
    ReadDenied,
    Rejected,
    PublishReturned,
}

impl SenderState {
    /// Transition table. `None` means the event is not valid in this state.
    pub fn on(self, event: SenderEvent) -> Option<SenderState> {
        use SenderEvent as E;
        use SenderState as S;

        match (self, event) {
            (S::ReadyToSend | S::Sent | S::PermissionDenied, E::Tap) => Some(S::Reading),
            (S::Reading | S::Sending, E::Tap) => None,

            (S::Reading, E::ReadSucceeded) => Some(S::Sending),
            (S::Reading, E::ReadDenied) => Some(S::PermissionDenied),
            (S::Reading, E::Rejected | E::PublishReturned) => None,

            (S::Sending, E::PublishReturned) => Some(S::Sent),
            (S::Sending, E::Rejected) => Some(S::ReadyToSend),
            (S::Sending, E::ReadSucceeded | E::ReadDenied) => None,

            (
                S::ReadyToSend | S::Sent | S::PermissionDenied,
                E::ReadSucceeded | E::ReadDenied | E::Rejected | E::PublishReturned,
            ) => None,
        }
    }
}

/// Acknowledges a completed send to the user.
pub trait Feedback: Send + Sync {
    fn acknowledge(&self);
}

impl Feedback for () {
    fn acknowledge(&self) {}
}

/// Rings the terminal bell.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Feedback for TerminalBell {
    fn acknowledge(&self) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

/// Mobile side: reads the local clipboard and publishes it to the paired desktop.
#[derive(Debug)]
pub struct MobileSender<P, C, F = ()> {
    pubsub: P,
    clipboard: C,
    feedback: F,
    token: SessionToken,
    channel: ChannelName,
    state: SenderState,
    status: &'static str,
    last_sent: Option<String>,
}

impl<P: PubSub, C: Clipboard, F: Feedback> MobileSender<P, C, F> {
    pub fn new(token: SessionToken, pubsub: P, clipboard: C, feedback: F) -> Self {
        let channel = ChannelName::for_session(&token);
        Self {
            pubsub,
            clipboard,
            feedback,
            token,
            channel,
            state: SenderState::ReadyToSend,
            status: STATUS_TAP_TO_SEND,
            last_sent: None,
        }
    }

    /// Builds a sender for the session named in a pairing link.
    ///
    /// Fails with `CoreError::InvalidSession` when the link has no usable `s`
    /// parameter; nothing is sent in that case.
    pub fn from_link(link: &Url, pubsub: P, clipboard: C, feedback: F) -> Result<Self, CoreError> {
        let token = session_from_link(link)?;
        Ok(Self::new(token, pubsub, clipboard, feedback))
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn status(&self) -> &'static str {
        self.status
    }

    /// Text of the most recent send, for display.
    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    pub fn into_pubsub(self) -> P {
        self.pubsub
    }

    /// One tap: read the clipboard and publish it.
    ///
    /// A denied read leaves the sender in `PermissionDenied` and publishes
    /// nothing; tapping again retries. Text that cannot fit in one relay frame
    /// is refused before publishing and returns the sender to `ReadyToSend`.
    /// Transport errors from the publish call are logged only.
    pub async fn send_clipboard(&mut self) -> Result<(), SendError> {
        if !self.apply(SenderEvent::Tap) {
            return Ok(());
        }
        self.status = STATUS_READING;

        let text = match self.clipboard.read_text().await {
            Ok(text) => text,
            Err(err) => {
                warn!("clipboard read denied: {}", err);
                self.apply(SenderEvent::ReadDenied);
                self.status = STATUS_TAP_TO_GRANT_ACCESS;
                return Err(err.into());
            }
        };
        self.apply(SenderEvent::ReadSucceeded);
        self.status = STATUS_SENDING;

        let bytes = text.len();
        let digest = fingerprint(&text);
        let checked = ClipboardMessage::new(text.clone())
            .and_then(|message| ChannelBroadcast::clipboard(self.channel.clone(), message));
        let ChannelEvent::ClipboardSync(message) = match checked {
            Ok(broadcast) => broadcast.event,
            Err(err) => {
                warn!(bytes, fingerprint = %digest, "clipboard not sendable: {}", err);
                self.apply(SenderEvent::Rejected);
                self.status = STATUS_TOO_LARGE;
                return Err(err.into());
            }
        };

        match self.pubsub.publish(&self.channel, message).await {
            Ok(()) => {
                info!(channel = %self.channel, bytes, fingerprint = %digest, "clipboard published");
            }
            Err(err) => {
                warn!(channel = %self.channel, "publish failed: {}", err);
            }
        }

        self.apply(SenderEvent::PublishReturned);
        self.status = STATUS_SENT;
        self.last_sent = Some(text);
        self.feedback.acknowledge();
        Ok(())
    }

    fn apply(&mut self, event: SenderEvent) -> bool {
        match self.state.on(event) {
            Some(next) => {
                debug!(from = ?self.state, to = ?next, ?event, "sender transition");
                self.state = next;
                true
            }
            None => {
                debug!(state = ?self.state, ?event, "sender event ignored");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{channel::LocalBus, clipboard::MemoryClipboard};

    #[derive(Debug, Default)]
    struct CountingFeedback(AtomicUsize);

    impl Feedback for &CountingFeedback {
        fn acknowledge(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn token() -> SessionToken {
        SessionToken::parse("mobile-test").unwrap()
    }

    #[test]
    fn taps_are_ignored_while_busy() {
        assert_eq!(SenderState::Reading.on(SenderEvent::Tap), None);
        assert_eq!(SenderState::Sending.on(SenderEvent::Tap), None);
        assert_eq!(
            SenderState::PermissionDenied.on(SenderEvent::Tap),
            Some(SenderState::Reading)
        );
        assert_eq!(
            SenderState::Sent.on(SenderEvent::Tap),
            Some(SenderState::Reading)
        );
    }

    #[tokio::test]
    async fn successful_send_publishes_and_acknowledges() {
        let bus = LocalBus::new();
        let channel = ChannelName::for_session(&token());
        let mut subscription = bus.subscribe(&channel).await.unwrap();
        let feedback = CountingFeedback::default();

        let mut sender = MobileSender::new(
            token(),
            bus.clone(),
            MemoryClipboard::with_text("hello"),
            &feedback,
        );
        sender.send_clipboard().await.unwrap();

        assert_eq!(sender.state(), SenderState::Sent);
        assert_eq!(sender.status(), STATUS_SENT);
        assert_eq!(sender.last_sent(), Some("hello"));
        assert_eq!(feedback.0.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.recv().await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn denied_read_publishes_nothing_and_allows_retry() {
        let bus = LocalBus::new();
        let clipboard = MemoryClipboard::with_text("later");
        clipboard.deny_reads(true);
        let mut sender = MobileSender::new(token(), bus.clone(), clipboard.clone(), ());

        let err = sender.send_clipboard().await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Clipboard(ClipboardError::AccessDenied(_))
        ));
        assert_eq!(sender.state(), SenderState::PermissionDenied);
        assert_eq!(sender.status(), STATUS_TAP_TO_GRANT_ACCESS);
        assert_eq!(bus.published_count(), 0);

        clipboard.deny_reads(false);
        sender.send_clipboard().await.unwrap();
        assert_eq!(sender.state(), SenderState::Sent);
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn publish_failure_still_reads_as_sent() {
        let bus = LocalBus::new();
        bus.set_unavailable(true);
        let mut sender =
            MobileSender::new(token(), bus, MemoryClipboard::with_text("lost"), ());
        sender.send_clipboard().await.unwrap();
        assert_eq!(sender.state(), SenderState::Sent);
    }

    #[tokio::test]
    async fn oversized_text_is_refused_without_feedback() {
        let bus = LocalBus::new();
        let feedback = CountingFeedback::default();
        let clipboard =
            MemoryClipboard::with_text(&"x".repeat(magicdrop_core::MAX_CLIPBOARD_TEXT_BYTES + 1));
        let mut sender = MobileSender::new(token(), bus.clone(), clipboard, &feedback);

        let err = sender.send_clipboard().await.unwrap_err();

        assert!(matches!(
            err,
            SendError::Rejected(CoreError::ClipboardTooLarge)
        ));
        assert_eq!(sender.state(), SenderState::ReadyToSend);
        assert_eq!(sender.status(), STATUS_TOO_LARGE);
        assert_eq!(sender.last_sent(), None);
        assert_eq!(feedback.0.load(Ordering::SeqCst), 0);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn text_that_escapes_past_the_frame_limit_is_refused() {
        let bus = LocalBus::new();
        let feedback = CountingFeedback::default();
        let quotes = "\"".repeat(magicdrop_core::MAX_CLIPBOARD_TEXT_BYTES);
        let clipboard = MemoryClipboard::with_text(&quotes);
        let mut sender = MobileSender::new(token(), bus.clone(), clipboard.clone(), &feedback);

        let err = sender.send_clipboard().await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Rejected(CoreError::ClipboardTooLarge)
        ));
        assert_eq!(feedback.0.load(Ordering::SeqCst), 0);
        assert_eq!(bus.published_count(), 0);

        clipboard.set_text("short");
        sender.send_clipboard().await.unwrap();
        assert_eq!(sender.state(), SenderState::Sent);
        assert_eq!(feedback.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn link_without_session_is_rejected() {
        let bus = LocalBus::new();
        let link = Url::parse("http://127.0.0.1:8080/mobile").unwrap();
        let result = MobileSender::from_link(&link, bus.clone(), MemoryClipboard::default(), ());
        assert!(matches!(result, Err(CoreError::InvalidSession)));
        assert_eq!(bus.published_count(), 0);
    }
}
