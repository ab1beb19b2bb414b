use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClipboardError {
    #[error("clipboard access denied: {0}")]
    AccessDenied(String),
}

/// Platform clipboard, text only.
pub trait Clipboard: Send + Sync {
    fn read_text(&self) -> impl Future<Output = Result<String, ClipboardError>> + Send;

    fn write_text(&self, text: &str) -> impl Future<Output = Result<(), ClipboardError>> + Send;
}

/// System clipboard backed by `arboard`.
///
/// The handle is created lazily and then kept for the life of the value: on
/// X11 and Wayland the copied text is served by the owning process, so a
/// short-lived handle would drop the content as soon as it was written.
#[derive(Clone, Default)]
pub struct SystemClipboard {
    handle: Arc<Mutex<Option<arboard::Clipboard>>>,
}

impl SystemClipboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_handle<T, F>(&self, op: F) -> Result<T, ClipboardError>
    where
        T: Send + 'static,
        F: FnOnce(&mut arboard::Clipboard) -> Result<T, arboard::Error> + Send + 'static,
    {
        let handle = Arc::clone(&self.handle);
        tokio::task::spawn_blocking(move || {
            let mut slot = handle.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(arboard::Clipboard::new().map_err(denied)?);
            }
            let Some(clipboard) = slot.as_mut() else {
                return Err(ClipboardError::AccessDenied(
                    "clipboard handle missing".to_owned(),
                ));
            };
            op(clipboard).map_err(denied)
        })
        .await
        .map_err(|err| ClipboardError::AccessDenied(err.to_string()))?
    }
}

impl Clipboard for SystemClipboard {
    async fn read_text(&self) -> Result<String, ClipboardError> {
        self.with_handle(|clipboard| clipboard.get_text()).await
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let text = text.to_owned();
        self.with_handle(move |clipboard| clipboard.set_text(text))
            .await
    }
}

fn denied(err: arboard::Error) -> ClipboardError {
    ClipboardError::AccessDenied(err.to_string())
}

#[derive(Debug, Default)]
struct MemoryClipboardState {
    text: String,
    deny_reads: bool,
    deny_writes: bool,
    writes: usize,
}

/// In-process clipboard with switchable permission failures.
///
/// Clones share the same contents, so a test can keep one handle while the
/// sender or receiver owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    inner: Arc<Mutex<MemoryClipboardState>>,
}

impl MemoryClipboard {
    #[must_use]
    pub fn with_text(text: &str) -> Self {
        let clipboard = Self::default();
        clipboard.set_text(text);
        clipboard
    }

    pub fn set_text(&self, text: &str) {
        self.lock().text = text.to_owned();
    }

    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    pub fn deny_reads(&self, deny: bool) {
        self.lock().deny_reads = deny;
    }

    pub fn deny_writes(&self, deny: bool) {
        self.lock().deny_writes = deny;
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryClipboardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clipboard for MemoryClipboard {
    async fn read_text(&self) -> Result<String, ClipboardError> {
        let state = self.lock();
        if state.deny_reads {
            return Err(ClipboardError::AccessDenied("read not permitted".to_owned()));
        }
        Ok(state.text.clone())
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut state = self.lock();
        if state.deny_writes {
            return Err(ClipboardError::AccessDenied("write not permitted".to_owned()));
        }
        state.text = text.to_owned();
        state.writes += 1;
        Ok(())
    }
}

/// Short content digest for logs; clipboard text itself is never logged.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..6])
}
