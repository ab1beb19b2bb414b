pub mod channel;
pub mod clipboard;
pub mod config;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod storage;

pub use channel::{ChannelError, LocalBus, PubSub, RelayClient, Subscription};
pub use clipboard::{Clipboard, ClipboardError, MemoryClipboard, SystemClipboard};
pub use receiver::{DesktopReceiver, ReceiverCommand, ReceiverExit, ReceiverState, run_receiver};
pub use sender::{Feedback, MobileSender, SendError, SenderState, TerminalBell};
pub use session::{SessionIdentity, get_or_create_session};
