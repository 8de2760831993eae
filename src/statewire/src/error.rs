//! Protocol error type.
//!
//! One error struct is used everywhere: handler failures, registry
//! rejections, close reasons. It serializes to a plain JSON object so it can
//! ride the wire as a `CLOSE` reason or a `RESPONSE_ERROR` payload and be
//! reconstructed on the other side.

use serde::{Deserialize, Serialize};

use crate::wire::Value;

/// A protocol or application error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    /// Numeric error code (see the `codes` module).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional extra payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error codes. Negative codes follow the JSON-RPC convention for
/// protocol-level failures; the `-33xxx` range is statewire-specific.
pub mod codes {
    /// A value could not be encoded for the wire.
    pub const PARSE_ERROR: i64 = -32700;
    /// Catch-all internal failure.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Message addressed a channel id with no live channel.
    pub const WRONG_CHANNEL: i64 = -33000;
    /// A channel id was reused while the prior channel was still live.
    pub const CHANNEL_CONFLICT: i64 = -33001;
    /// The per-link channel limit was reached.
    pub const CHANNELS_LIMIT: i64 = -33002;
    /// Path resolution failed in the default handler.
    pub const WRONG_PATH: i64 = -33003;
    /// A handler returned a value of the wrong kind for the operation.
    pub const WRONG_DATA_TYPE: i64 = -33004;
    /// The operation's channel is closed.
    pub const CHANNEL_CLOSED: i64 = -33005;
    /// The connection timed out before the channel became ready.
    pub const TIMEOUT: i64 = -33006;
}

impl Error {
    /// Create an error with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach extra data to this error.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Catch-all internal failure.
    pub fn internal_error() -> Self {
        Error::new(codes::INTERNAL_ERROR, "internal error")
    }

    /// Wrap any displayable failure as an internal error.
    pub fn into_internal_error(err: impl std::fmt::Display) -> Self {
        Error::internal_error().with_data(err.to_string())
    }

    /// A value could not be encoded for the wire.
    pub fn parse_error() -> Self {
        Error::new(codes::PARSE_ERROR, "parse error")
    }

    /// A state value could not be encoded for the wire.
    pub fn state_parse_error() -> Self {
        Error::new(codes::PARSE_ERROR, "state parse error")
    }

    /// Message addressed a channel id with no live channel.
    pub fn wrong_channel() -> Self {
        Error::new(codes::WRONG_CHANNEL, "wrong channel")
    }

    /// A channel id was reused while the prior channel was still live.
    pub fn channel_conflict() -> Self {
        Error::new(codes::CHANNEL_CONFLICT, "channel id conflict")
    }

    /// The per-link channel limit was reached.
    pub fn channels_limit() -> Self {
        Error::new(codes::CHANNELS_LIMIT, "channels limit")
    }

    /// Path resolution failed; `detail` names the offending segment.
    pub fn wrong_path(detail: impl std::fmt::Display) -> Self {
        Error::new(codes::WRONG_PATH, format!("wrong path: {detail}"))
    }

    /// A handler returned a value of the wrong kind for the operation.
    pub fn wrong_data_type() -> Self {
        Error::new(codes::WRONG_DATA_TYPE, "wrong data type")
    }

    /// The operation's channel is closed.
    pub fn channel_closed() -> Self {
        Error::new(codes::CHANNEL_CLOSED, "channel closed")
    }

    /// The connection timed out before the channel became ready.
    pub fn timeout() -> Self {
        Error::new(codes::TIMEOUT, "timeout")
    }

    /// Encode this error as a wire value.
    pub fn to_value(&self) -> Value {
        // Serializing a plain struct of JSON-native fields cannot fail.
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }

    /// Reconstruct an error from a wire value.
    ///
    /// Accepts the serialized form of [`Error`], a bare string, or any other
    /// value (kept as `data` on an internal error) so that foreign peers can
    /// send free-form reasons.
    pub fn from_value(value: &Value) -> Self {
        if let Ok(err) = serde_json::from_value::<Error>(value.clone()) {
            return err;
        }
        match value {
            Value::String(message) => Error::new(codes::INTERNAL_ERROR, message.clone()),
            Value::Null => Error::channel_closed(),
            other => Error::internal_error().with_data(other.clone()),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} (code {}): {}", self.message, self.code, data),
            None => write!(f, "{} (code {})", self.message, self.code),
        }
    }
}

impl std::error::Error for Error {}
