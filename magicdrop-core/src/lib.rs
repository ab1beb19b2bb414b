use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const MAX_CLIPBOARD_TEXT_BYTES: usize = 256 * 1024;
pub const MAX_RELAY_MESSAGE_BYTES: usize = 300 * 1024;
pub const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 10;
pub const MAX_SESSION_TOKEN_LEN: usize = 128;
pub const CLIPBOARD_SCHEMA_VERSION: u16 = 1;
pub const CHANNEL_PREFIX: &str = "pairing-";
pub const PAIRING_PATH: &str = "/mobile";
pub const SESSION_QUERY_PARAM: &str = "s";
pub const SESSION_STORAGE_KEY: &str = "session-id";

// u32 length prefix plus the message type byte.
const FRAME_HEADER_BYTES: usize = 5;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session: pairing link has no usable `s` parameter")]
    InvalidSession,
    #[error("session token must be 1..=128 chars of [A-Za-z0-9_-]")]
    InvalidToken,
    #[error("invalid channel name {0:?}")]
    InvalidChannelName(String),
    #[error("clipboard text exceeds 256 KiB or does not fit in one relay frame")]
    ClipboardTooLarge,
    #[error("unsupported clipboard schema version {0}")]
    UnsupportedSchemaVersion(u16),
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Opaque identifier pairing one desktop receiver with its mobile senders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let valid_len = !raw.is_empty() && raw.len() <= MAX_SESSION_TOKEN_LEN;
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid_len && valid_chars {
            Ok(Self(raw.to_owned()))
        } else {
            Err(CoreError::InvalidToken)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters of the token, for display only.
    pub fn short(&self, max_chars: usize) -> &str {
        // Tokens are ASCII, so byte offsets are char boundaries.
        &self.0[..self.0.len().min(max_chars)]
    }
}

impl TryFrom<String> for SessionToken {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pub/sub topic name, always `pairing-<token>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    #[must_use]
    pub fn for_session(token: &SessionToken) -> Self {
        Self(format!("{CHANNEL_PREFIX}{}", token.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let token = value
            .strip_prefix(CHANNEL_PREFIX)
            .and_then(|raw| SessionToken::parse(raw).ok())
            .ok_or_else(|| CoreError::InvalidChannelName(value.clone()))?;
        Ok(Self::for_session(&token))
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipboardMessage {
    #[serde(default = "default_schema_version")]
    pub version: u16,
    pub text: String,
}

fn default_schema_version() -> u16 {
    CLIPBOARD_SCHEMA_VERSION
}

impl ClipboardMessage {
    pub fn new(text: impl Into<String>) -> Result<Self, CoreError> {
        let message = Self {
            version: CLIPBOARD_SCHEMA_VERSION,
            text: text.into(),
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.version == 0 || self.version > CLIPBOARD_SCHEMA_VERSION {
            return Err(CoreError::UnsupportedSchemaVersion(self.version));
        }
        if self.text.len() > MAX_CLIPBOARD_TEXT_BYTES {
            return Err(CoreError::ClipboardTooLarge);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelEvent {
    ClipboardSync(ClipboardMessage),
}

impl ChannelEvent {
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            ChannelEvent::ClipboardSync(message) => message.validate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelBroadcast {
    pub channel: ChannelName,
    pub event: ChannelEvent,
}

impl ChannelBroadcast {
    /// Clipboard broadcast on `channel`.
    ///
    /// Fails with `ClipboardTooLarge` when the encoded frame would exceed
    /// `MAX_RELAY_MESSAGE_BYTES`. JSON escaping can double the text size, so
    /// the text limit alone does not guarantee a deliverable frame.
    pub fn clipboard(channel: ChannelName, message: ClipboardMessage) -> Result<Self, CoreError> {
        let broadcast = Self {
            channel,
            event: ChannelEvent::ClipboardSync(message),
        };
        broadcast_payload(&broadcast)?;
        Ok(broadcast)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Subscribe {
        channel: ChannelName,
    },
    Subscribed {
        channel: ChannelName,
    },
    Unsubscribe {
        channel: ChannelName,
    },
    Error {
        #[serde(default)]
        channel: Option<ChannelName>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Control(ControlMessage),
    Broadcast(ChannelBroadcast),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control = 0,
    Broadcast = 1,
}

/// Builds `<origin>/mobile?s=<token>`.
pub fn pairing_link(origin: &Url, token: &SessionToken) -> Result<Url, CoreError> {
    if origin.cannot_be_a_base() {
        return Err(CoreError::InvalidOrigin(origin.to_string()));
    }
    let mut link = origin
        .join(PAIRING_PATH)
        .map_err(|err| CoreError::InvalidOrigin(err.to_string()))?;
    link.set_query(None);
    link.set_fragment(None);
    link.query_pairs_mut()
        .append_pair(SESSION_QUERY_PARAM, token.as_str());
    Ok(link)
}

pub fn session_from_link(link: &Url) -> Result<SessionToken, CoreError> {
    let raw = link
        .query_pairs()
        .find(|(key, _)| key == SESSION_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .ok_or(CoreError::InvalidSession)?;
    SessionToken::parse(&raw).map_err(|_| CoreError::InvalidSession)
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Control(control) => (MessageType::Control as u8, to_json(control)?),
        WireMessage::Broadcast(broadcast) => {
            (MessageType::Broadcast as u8, broadcast_payload(broadcast)?)
        }
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(FRAME_HEADER_BYTES - 1 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < FRAME_HEADER_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Control as u8 => {
            let control: ControlMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Control(control))
        }
        x if x == MessageType::Broadcast as u8 => {
            let broadcast: ChannelBroadcast = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            broadcast.event.validate()?;
            Ok(WireMessage::Broadcast(broadcast))
        }
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

fn broadcast_payload(broadcast: &ChannelBroadcast) -> Result<Vec<u8>, CoreError> {
    broadcast.event.validate()?;
    let payload = to_json(broadcast)?;
    if FRAME_HEADER_BYTES + payload.len() > MAX_RELAY_MESSAGE_BYTES {
        return Err(CoreError::ClipboardTooLarge);
    }
    Ok(payload)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|err| CoreError::Serialization(err.to_string()))
}
