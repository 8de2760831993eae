//! Wire message contract.
//!
//! Every message on a link is a heterogeneous array of already-decoded
//! values. The first integer after the channel id discriminates the action,
//! so both directions are modeled as tagged enums here and converted to and
//! from raw value arrays at the link boundary. Decoding is lenient: arrays
//! that do not match any shape are reported as `None` and the caller drops
//! them with a warning.

use serde_json::Number;

use crate::error::Error;

/// A decoded wire value. Payloads (call arguments, results, state, close
/// reasons) are carried as-is.
pub type Value = serde_json::Value;

/// One raw message on the link: a heterogeneous array of values.
pub type WireMessage = Vec<Value>;

/// Client→source action codes.
pub mod client_action {
    pub const CALL: u64 = 0;
    pub const CLOSE: u64 = 1;
    pub const CREATE: u64 = 2;
    pub const NOTIFY: u64 = 3;
}

/// Source→client action codes.
pub mod source_action {
    pub const RESPONSE_OK: u64 = 0;
    pub const CLOSE: u64 = 1;
    pub const STATE: u64 = 2;
    pub const RESPONSE_ERROR: u64 = 3;
    pub const EVENT: u64 = 4;
}

/// Identifier of one logical channel within a link.
///
/// Ids minted by this crate are strings (16 hex chars by default), but the
/// contract allows numeric ids, so both forms are preserved on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Str(String),
    Num(i64),
}

impl ChannelId {
    /// Decode a channel id from a wire value.
    pub fn from_value(value: &Value) -> Option<ChannelId> {
        match value {
            Value::String(s) => Some(ChannelId::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(ChannelId::Num),
            _ => None,
        }
    }

    /// Encode this channel id as a wire value.
    pub fn to_value(&self) -> Value {
        match self {
            ChannelId::Str(s) => Value::String(s.clone()),
            ChannelId::Num(n) => Value::Number(Number::from(*n)),
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelId::Str(s) => write!(f, "{s}"),
            ChannelId::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::Str(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        ChannelId::Str(s)
    }
}

impl From<i64> for ChannelId {
    fn from(n: i64) -> Self {
        ChannelId::Num(n)
    }
}

/// One step of a procedure or event path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Name(String),
    Index(i64),
}

impl Segment {
    fn from_value(value: &Value) -> Option<Segment> {
        match value {
            Value::String(s) => Some(Segment::Name(s.clone())),
            // Non-integral numbers keep their textual form; canonical keys
            // coerce to strings anyway.
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Segment::Index(i),
                None => Segment::Name(n.to_string()),
            }),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Segment::Name(s) => Value::String(s.clone()),
            Segment::Index(i) => Value::Number(Number::from(*i)),
        }
    }

    /// The segment as text, with numeric segments coerced.
    pub fn as_text(&self) -> String {
        match self {
            Segment::Name(s) => s.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Name(s.to_string())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment::Name(s)
    }
}

impl From<i64> for Segment {
    fn from(i: i64) -> Self {
        Segment::Index(i)
    }
}

/// A procedure or event address: a sequence of segments.
pub type Path = Vec<Segment>;

/// Build a [`Path`] from anything segment-like.
pub fn path<S: Into<Segment>, I: IntoIterator<Item = S>>(segments: I) -> Path {
    segments.into_iter().map(Into::into).collect()
}

/// Render a path as a dotted string for logs and error messages.
pub fn display_path(path: &[Segment]) -> String {
    path.iter()
        .map(Segment::as_text)
        .collect::<Vec<_>>()
        .join(".")
}

/// The canonical event-dispatch key for a path.
///
/// The key is the JSON encoding of the segment list with numeric segments
/// coerced to strings, so `["a", 1]` and `["a", "1"]` share a key. Built-in
/// lifecycle events use their bare names as keys; since a canonical path key
/// always starts with `[`, the two namespaces cannot collide.
pub fn event_path_key(path: &[Segment]) -> String {
    let texts: Vec<String> = path.iter().map(Segment::as_text).collect();
    serde_json::to_string(&texts).unwrap_or_default()
}

fn decode_path(value: &Value) -> Option<Path> {
    let items = value.as_array()?;
    items.iter().map(Segment::from_value).collect()
}

fn encode_path(path: &[Segment]) -> Value {
    Value::Array(path.iter().map(Segment::to_value).collect())
}

fn decode_args(value: &Value) -> Option<Vec<Value>> {
    value.as_array().cloned()
}

/// A decoded client→source message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `[channelId]`: open a channel bound to the root source.
    Init { channel: ChannelId },
    /// `[channelId, CALL, responseKey, path, args]`
    Call {
        channel: ChannelId,
        response_key: u64,
        path: Path,
        args: Vec<Value>,
    },
    /// `[channelId, CLOSE, reason]`
    Close { channel: ChannelId, reason: Value },
    /// `[channelId, CREATE, newChannelId, path, args]`
    Create {
        channel: ChannelId,
        new_channel: ChannelId,
        path: Path,
        args: Vec<Value>,
    },
    /// `[channelId, NOTIFY, path, args]`
    Notify {
        channel: ChannelId,
        path: Path,
        args: Vec<Value>,
    },
}

impl ClientMessage {
    /// Decode a raw message. Returns `None` for messages that must be
    /// ignored (too short, unknown action, malformed fields).
    pub fn decode(message: &[Value]) -> Option<ClientMessage> {
        if message.len() == 1 {
            return Some(ClientMessage::Init {
                channel: ChannelId::from_value(&message[0])?,
            });
        }
        if message.len() < 3 {
            return None;
        }
        let channel = ChannelId::from_value(&message[0])?;
        let action = message[1].as_u64()?;
        match action {
            client_action::CALL => Some(ClientMessage::Call {
                channel,
                response_key: message.get(2)?.as_u64()?,
                path: decode_path(message.get(3)?)?,
                args: decode_args(message.get(4)?)?,
            }),
            client_action::CLOSE => Some(ClientMessage::Close {
                channel,
                reason: message.get(2).cloned().unwrap_or(Value::Null),
            }),
            client_action::CREATE => Some(ClientMessage::Create {
                channel,
                new_channel: ChannelId::from_value(message.get(2)?)?,
                path: decode_path(message.get(3)?)?,
                args: decode_args(message.get(4)?)?,
            }),
            client_action::NOTIFY => Some(ClientMessage::Notify {
                channel,
                path: decode_path(message.get(2)?)?,
                args: decode_args(message.get(3)?)?,
            }),
            _ => None,
        }
    }

    /// Encode into a raw message.
    pub fn encode(&self) -> WireMessage {
        match self {
            ClientMessage::Init { channel } => vec![channel.to_value()],
            ClientMessage::Call {
                channel,
                response_key,
                path,
                args,
            } => vec![
                channel.to_value(),
                Value::from(client_action::CALL),
                Value::from(*response_key),
                encode_path(path),
                Value::Array(args.clone()),
            ],
            ClientMessage::Close { channel, reason } => vec![
                channel.to_value(),
                Value::from(client_action::CLOSE),
                reason.clone(),
            ],
            ClientMessage::Create {
                channel,
                new_channel,
                path,
                args,
            } => vec![
                channel.to_value(),
                Value::from(client_action::CREATE),
                new_channel.to_value(),
                encode_path(path),
                Value::Array(args.clone()),
            ],
            ClientMessage::Notify {
                channel,
                path,
                args,
            } => vec![
                channel.to_value(),
                Value::from(client_action::NOTIFY),
                encode_path(path),
                Value::Array(args.clone()),
            ],
        }
    }
}

/// A decoded source→client message. The first wire element is always the
/// array of destination channel ids; broadcasts are grouped, responses carry
/// exactly one id.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    /// `[ids, RESPONSE_OK, responseKey, value]`
    ResponseOk {
        channels: Vec<ChannelId>,
        response_key: u64,
        value: Value,
    },
    /// `[ids, RESPONSE_ERROR, responseKey, error]`
    ResponseError {
        channels: Vec<ChannelId>,
        response_key: u64,
        error: Value,
    },
    /// `[ids, CLOSE, reason]`
    Close {
        channels: Vec<ChannelId>,
        reason: Value,
    },
    /// `[ids, STATE, value]`
    State {
        channels: Vec<ChannelId>,
        value: Value,
    },
    /// `[ids, EVENT, path, args]`
    Event {
        channels: Vec<ChannelId>,
        path: Path,
        args: Vec<Value>,
    },
}

impl SourceMessage {
    /// Close addressed to a single channel, with an [`Error`] as the reason.
    pub fn close_with(channel: ChannelId, error: &Error) -> SourceMessage {
        SourceMessage::Close {
            channels: vec![channel],
            reason: error.to_value(),
        }
    }

    /// Decode a raw message. Returns `None` for messages that must be
    /// ignored.
    pub fn decode(message: &[Value]) -> Option<SourceMessage> {
        if message.len() < 3 {
            return None;
        }
        let channels: Vec<ChannelId> = message[0]
            .as_array()?
            .iter()
            .map(ChannelId::from_value)
            .collect::<Option<_>>()?;
        let action = message[1].as_u64()?;
        match action {
            source_action::RESPONSE_OK => Some(SourceMessage::ResponseOk {
                channels,
                response_key: message.get(2)?.as_u64()?,
                value: message.get(3).cloned().unwrap_or(Value::Null),
            }),
            source_action::RESPONSE_ERROR => Some(SourceMessage::ResponseError {
                channels,
                response_key: message.get(2)?.as_u64()?,
                error: message.get(3).cloned().unwrap_or(Value::Null),
            }),
            source_action::CLOSE => Some(SourceMessage::Close {
                channels,
                reason: message.get(2).cloned().unwrap_or(Value::Null),
            }),
            source_action::STATE => Some(SourceMessage::State {
                channels,
                value: message.get(2).cloned().unwrap_or(Value::Null),
            }),
            source_action::EVENT => Some(SourceMessage::Event {
                channels,
                path: decode_path(message.get(2)?)?,
                args: decode_args(message.get(3)?)?,
            }),
            _ => None,
        }
    }

    /// Encode into a raw message.
    pub fn encode(&self) -> WireMessage {
        fn ids(channels: &[ChannelId]) -> Value {
            Value::Array(channels.iter().map(ChannelId::to_value).collect())
        }
        match self {
            SourceMessage::ResponseOk {
                channels,
                response_key,
                value,
            } => vec![
                ids(channels),
                Value::from(source_action::RESPONSE_OK),
                Value::from(*response_key),
                value.clone(),
            ],
            SourceMessage::ResponseError {
                channels,
                response_key,
                error,
            } => vec![
                ids(channels),
                Value::from(source_action::RESPONSE_ERROR),
                Value::from(*response_key),
                error.clone(),
            ],
            SourceMessage::Close { channels, reason } => vec![
                ids(channels),
                Value::from(source_action::CLOSE),
                reason.clone(),
            ],
            SourceMessage::State { channels, value } => vec![
                ids(channels),
                Value::from(source_action::STATE),
                value.clone(),
            ],
            SourceMessage::Event {
                channels,
                path,
                args,
            } => vec![
                ids(channels),
                Value::from(source_action::EVENT),
                encode_path(path),
                Value::Array(args.clone()),
            ],
        }
    }
}
