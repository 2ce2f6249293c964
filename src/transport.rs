//! Transport port: the push connection primitive the client drives.
//!
//! The client performs no framing or HTTP work itself. A [`TransportFactory`] opens a
//! push connection for a URL and hands back a [`Transport`] handle that reports
//! `open`, `error` and record notifications to the listeners the client attaches.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::Result;

/// Native event name signalled once the connection is established.
pub const OPEN: &str = "open";
/// Native event name for unnamed records.
pub const MESSAGE: &str = "message";
/// Native event name for transport failures and server-pushed error records.
pub const ERROR: &str = "error";

/// One decoded record delivered by the transport.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record body as received
    pub data: String,
    /// Identifier the server attached to this record, if any
    pub last_event_id: Option<String>,
    /// Event name; `message` for unnamed records
    pub event_type: String,
}

impl Record {
    #[must_use]
    pub fn new<T: Into<String>, D: Into<String>>(event_type: T, data: D) -> Self {
        Self {
            data: data.into(),
            last_event_id: None,
            event_type: event_type.into(),
        }
    }

    #[must_use]
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.last_event_id = Some(id.into());
        self
    }
}

/// Failure reported by the transport, either while connecting or on a live connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub reason: String,
}

impl TransportFailure {
    #[must_use]
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport failure: {}", self.reason)
    }
}

impl StdError for TransportFailure {}

/// Notification delivered to a transport listener.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(Record),
    Error(TransportFailure),
}

/// Readiness of a transport handle.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    /// Already open when the factory returns. The client then treats the
    /// connection as established once its listeners are attached.
    Open,
    Closed,
}

/// Identifies a listener attached with [`Transport::add_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Callback attached to a transport event name.
pub type Listener = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A live push connection.
///
/// Listeners may be called from any thread, but never from inside
/// [`add_event_listener`](Transport::add_event_listener) itself.
///
/// Records are only accepted after the client has observed `open`, either
/// through an `open` notification or through [`ReadyState::Open`] checked
/// right after its listeners are attached. Records delivered before that
/// point are dropped, so a transport that is already open must hold back
/// records until its listeners are in place.
pub trait Transport: Send + Sync {
    /// Attach `listener` to notifications named `event`.
    fn add_event_listener(&self, event: &str, listener: Listener) -> ListenerId;

    /// Detach a listener previously returned by `add_event_listener`.
    fn remove_event_listener(&self, event: &str, id: ListenerId);

    /// Close the connection. No notifications are expected afterwards.
    fn close(&self);

    fn ready_state(&self) -> ReadyState;
}

/// Options forwarded to the transport when a connection is created.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Send cookies/credentials on cross-origin requests
    pub with_credentials: bool,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

/// Creates transports. Injected into the client so tests can supply fakes.
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &Url, options: &TransportOptions) -> Result<Arc<dyn Transport>>;
}
