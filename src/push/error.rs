//! Structured errors emitted on the `error` event.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::types::ConnectionState;
use crate::error::{Error, Kind};
use crate::transport::TransportFailure;

pub(crate) const MAX_ATTEMPTS_EXCEEDED: &str = "Max reconnection attempts exceeded";

/// The connection could not be established, or an established one was lost.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub message: String,
    pub url: String,
    pub correlation_id: String,
    /// State the client was in when the failure was observed
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub original_error: Option<TransportFailure>,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (url: {}, state: {}, attempts: {})",
            self.message, self.url, self.state, self.reconnect_attempts
        )
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.original_error
            .as_ref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

/// An error record pushed by the server.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct StreamError {
    pub url: String,
    /// Taken from the payload when it carries one, else the client's
    pub correlation_id: String,
    pub message: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub raw_data: String,
}

impl StreamError {
    /// Build from a server-pushed error body.
    ///
    /// JSON objects contribute `message`, `code` (string or number), `name` and
    /// `correlationId`; anything else becomes the message verbatim.
    pub(crate) fn from_payload(url: &str, client_correlation_id: &str, raw_data: &str) -> Self {
        let mut error = Self {
            url: url.to_owned(),
            correlation_id: client_correlation_id.to_owned(),
            message: raw_data.to_owned(),
            code: None,
            name: None,
            raw_data: raw_data.to_owned(),
        };

        let Ok(Value::Object(body)) = serde_json::from_str::<Value>(raw_data) else {
            return error;
        };

        if let Some(message) = body.get("message").and_then(Value::as_str) {
            message.clone_into(&mut error.message);
        }
        error.code = body.get("code").and_then(|code| match code {
            Value::String(code) => Some(code.clone()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        });
        error.name = body.get("name").and_then(Value::as_str).map(str::to_owned);
        if let Some(id) = body.get("correlationId").and_then(Value::as_str) {
            id.clone_into(&mut error.correlation_id);
        }

        error
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "stream error [{code}]: {}", self.message),
            None => write!(f, "stream error: {}", self.message),
        }
    }
}

impl StdError for StreamError {}

impl From<StreamError> for Error {
    fn from(err: StreamError) -> Self {
        Error::with_source(Kind::Stream, err)
    }
}

/// No record arrived within the heartbeat window.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HeartbeatError {
    pub url: String,
    pub correlation_id: String,
    pub heartbeat_timeout: Duration,
    pub time_since_last_event: Duration,
    pub last_event_id: Option<String>,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no event received for {:?} (heartbeat timeout {:?})",
            self.time_since_last_event, self.heartbeat_timeout
        )
    }
}

impl StdError for HeartbeatError {}

impl From<HeartbeatError> for Error {
    fn from(err: HeartbeatError) -> Self {
        Error::with_source(Kind::Heartbeat, err)
    }
}
