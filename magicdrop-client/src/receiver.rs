use magicdrop_core::ClipboardMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    channel::Subscription,
    clipboard::{Clipboard, ClipboardError, fingerprint},
};

pub const STATUS_SCAN_TO_CONNECT: &str = "Scan to Connect";
pub const STATUS_READY: &str = "Ready";
pub const STATUS_RECEIVED: &str = "Received!";
pub const STATUS_COPIED_TO_CLIPBOARD: &str = "Copied to Clipboard!";
pub const STATUS_CLICK_TO_COPY: &str = "Click to Copy";
pub const STATUS_COPIED: &str = "Copied!";
pub const STATUS_FAILED_TO_COPY: &str = "Failed to copy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Received,
    CopiedOk,
    CopiedManual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverEvent {
    MessageArrived,
    CopySucceeded,
    CopyFailed,
    ScanAnother,
}

impl ReceiverState {
    /// Transition table. `None` means the event is not valid in this state.
    pub fn on(self, event: ReceiverEvent) -> Option<ReceiverState> {
        use ReceiverEvent as E;
        use ReceiverState as S;

        match (self, event) {
            (_, E::MessageArrived) => Some(S::Received),

            (S::Received, E::CopySucceeded) => Some(S::CopiedOk),
            (S::Received, E::CopyFailed) => Some(S::CopiedManual),
            (S::Received, E::ScanAnother) => None,

            // Manual copy from a terminal state; failure keeps the state.
            (S::CopiedOk | S::CopiedManual, E::CopySucceeded) => Some(S::CopiedOk),
            (S::CopiedOk, E::CopyFailed) => Some(S::CopiedOk),
            (S::CopiedManual, E::CopyFailed) => Some(S::CopiedManual),
            (S::CopiedOk | S::CopiedManual, E::ScanAnother) => Some(S::Idle),

            (S::Idle, E::ScanAnother) => Some(S::Idle),
            (S::Idle, E::CopySucceeded | E::CopyFailed) => None,
        }
    }
}

/// Desktop side: shows the latest received text and puts it on the clipboard.
#[derive(Debug)]
pub struct DesktopReceiver<C> {
    clipboard: C,
    state: ReceiverState,
    content: Option<String>,
    status: &'static str,
}

impl<C: Clipboard> DesktopReceiver<C> {
    pub fn new(clipboard: C) -> Self {
        Self {
            clipboard,
            state: ReceiverState::Idle,
            content: None,
            status: STATUS_SCAN_TO_CONNECT,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn status(&self) -> &'static str {
        self.status
    }

    pub fn clipboard(&self) -> &C {
        &self.clipboard
    }

    /// Stores `message` and attempts the automatic clipboard write.
    ///
    /// Empty text carries nothing to show and is ignored.
    pub async fn on_message(&mut self, message: ClipboardMessage) {
        if message.text.is_empty() {
            debug!("ignoring empty clipboard message");
            return;
        }

        info!(
            bytes = message.text.len(),
            fingerprint = %fingerprint(&message.text),
            "clipboard content received"
        );
        self.apply(ReceiverEvent::MessageArrived);
        self.content = Some(message.text);
        self.status = STATUS_RECEIVED;

        let result = match self.content.as_deref() {
            Some(text) => self.clipboard.write_text(text).await,
            None => return,
        };
        match result {
            Ok(()) => {
                self.apply(ReceiverEvent::CopySucceeded);
                self.status = STATUS_COPIED_TO_CLIPBOARD;
            }
            Err(err) => {
                warn!("automatic copy failed, waiting for manual copy: {}", err);
                self.apply(ReceiverEvent::CopyFailed);
                self.status = STATUS_CLICK_TO_COPY;
            }
        }
    }

    /// Retries the clipboard write for the current content.
    ///
    /// Returns `Ok(false)` when there is no content to copy.
    pub async fn manual_copy(&mut self) -> Result<bool, ClipboardError> {
        let result = match self.content.as_deref() {
            Some(text) => self.clipboard.write_text(text).await,
            None => return Ok(false),
        };
        match result {
            Ok(()) => {
                self.apply(ReceiverEvent::CopySucceeded);
                self.status = STATUS_COPIED;
                Ok(true)
            }
            Err(err) => {
                self.apply(ReceiverEvent::CopyFailed);
                self.status = STATUS_FAILED_TO_COPY;
                Err(err)
            }
        }
    }

    /// Clears the content and returns to `Idle`. The subscription is untouched.
    pub fn scan_another(&mut self) {
        if self.apply(ReceiverEvent::ScanAnother) {
            self.content = None;
            self.status = STATUS_READY;
        }
    }

    fn apply(&mut self, event: ReceiverEvent) -> bool {
        match self.state.on(event) {
            Some(next) => {
                debug!(from = ?self.state, to = ?next, ?event, "receiver transition");
                self.state = next;
                true
            }
            None => {
                debug!(state = ?self.state, ?event, "receiver event ignored");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverCommand {
    ManualCopy,
    ScanAnother,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    Quit,
    SubscriptionClosed,
}

/// Drives `receiver` from its subscription and user commands until quit.
///
/// Messages already queued are handled before pending commands. `on_change`
/// runs after every handled message or command. The subscription is released
/// on every return path.
pub async fn run_receiver<C, F>(
    receiver: &mut DesktopReceiver<C>,
    mut subscription: Subscription,
    mut commands: mpsc::UnboundedReceiver<ReceiverCommand>,
    mut on_change: F,
) -> ReceiverExit
where
    C: Clipboard,
    F: FnMut(&DesktopReceiver<C>),
{
    info!(channel = %subscription.channel(), "receiver listening");
    on_change(receiver);

    let exit = loop {
        tokio::select! {
            biased;
            message = subscription.recv() => match message {
                Some(message) => receiver.on_message(message).await,
                None => break ReceiverExit::SubscriptionClosed,
            },
            command = commands.recv() => match command {
                Some(ReceiverCommand::ManualCopy) => {
                    if let Err(err) = receiver.manual_copy().await {
                        warn!("manual copy failed: {}", err);
                    }
                }
                Some(ReceiverCommand::ScanAnother) => receiver.scan_another(),
                Some(ReceiverCommand::Quit) | None => break ReceiverExit::Quit,
            },
        }
        on_change(receiver);
    };

    info!(channel = %subscription.channel(), ?exit, "receiver stopped");
    drop(subscription);
    exit
}
