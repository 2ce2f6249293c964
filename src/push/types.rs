use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::error::Error;

/// Lifecycle state of a push client.
///
/// ```text
/// Connecting ──► Connected ──► Disconnected ──► Connecting ...
///     │              │              │
///     └──────────────┴──────────────┴──► Closed (terminal)
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Connecting,
                Self::Connected | Self::Disconnected | Self::Closed
            ) | (Self::Connected, Self::Disconnected | Self::Closed)
                | (Self::Disconnected, Self::Connecting | Self::Closed)
        )
    }

    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Snapshot of client counters.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub events_received: u64,
    pub bytes_received: u64,
    /// Time since the first successful connection; frozen once the client is closed
    pub connection_duration: Duration,
    /// Reconnection attempts since the last successful connection
    pub reconnect_attempts: u32,
    pub last_event_id: Option<String>,
}

/// Decoded record body.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Body delivered unchanged, either because JSON decoding is off or because it failed
    Text(String),
}

impl Payload {
    pub(crate) fn decode(data: &str, parse_json: bool) -> Self {
        if !parse_json {
            return Self::Text(data.to_owned());
        }

        match serde_json::from_str(data) {
            Ok(value) => Self::Json(value),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(error = %e, "Record body is not JSON, delivering raw text");
                #[cfg(not(feature = "tracing"))]
                let _: &serde_json::Error = &e;
                Self::Text(data.to_owned())
            }
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }
}

/// A record dispatched to `message` or custom event handlers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Name the record was dispatched under
    pub event: String,
    pub data: Payload,
    pub last_event_id: Option<String>,
}

impl MessageEvent {
    /// Deserialize the payload into `T`. Text payloads are parsed as JSON first.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Text(text) => Ok(serde_json::from_str(text)?),
        }
    }
}

/// Payload of the `close` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Whether the client is going to reconnect
    pub reconnect: bool,
    pub reason: Option<String>,
}

/// What handlers receive.
#[non_exhaustive]
#[derive(Debug)]
pub enum Event {
    Open,
    Message(MessageEvent),
    Close(CloseEvent),
    /// A [`ConnectionError`](crate::push::error::ConnectionError),
    /// [`StreamError`](crate::push::error::StreamError) or
    /// [`HeartbeatError`](crate::push::error::HeartbeatError), see [`Error::kind`]
    Error(Error),
}

impl Event {
    #[must_use]
    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_close(&self) -> Option<&CloseEvent> {
        match self {
            Self::Close(close) => Some(close),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[test]
    fn state_machine_transitions() {
        use ConnectionState::{Closed, Connected, Connecting, Disconnected};

        let allowed = [
            (Connecting, Connected),
            (Connecting, Disconnected),
            (Connecting, Closed),
            (Connected, Disconnected),
            (Connected, Closed),
            (Disconnected, Connecting),
            (Disconnected, Closed),
        ];
        let all = [Connecting, Connected, Disconnected, Closed];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn payload_falls_back_to_text() {
        assert_eq!(
            Payload::decode(r#"{"price":1}"#, true),
            Payload::Json(json!({"price": 1}))
        );
        assert_eq!(
            Payload::decode("not json", true),
            Payload::Text("not json".to_owned())
        );
        assert_eq!(
            Payload::decode(r#"{"price":1}"#, false),
            Payload::Text(r#"{"price":1}"#.to_owned())
        );
    }

    #[test]
    fn message_event_deserializes() {
        #[derive(Deserialize)]
        struct Tick {
            price: u32,
        }

        let event = MessageEvent {
            event: "tick".to_owned(),
            data: Payload::Json(json!({"price": 7})),
            last_event_id: None,
        };

        let tick: Tick = event.json().expect("payload should deserialize");
        assert_eq!(tick.price, 7);
    }
}
