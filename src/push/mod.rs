//! Resilient push-stream client.
//!
//! # Architecture
//!
//! - [`Client`]: public handle; cheap to clone
//! - `ConnectionManager`: state machine, transport lifecycle and timers
//! - `EventDispatcher`: named handler registry
//! - `HeartbeatMonitor` / `ReconnectionEngine`: timer-owning policies driven by the
//!   manager through the injected [`Clock`](crate::clock::Clock)
//!
//! Events reach handlers by name. `open`, `close`, `error` and `message` are client
//! events; any other name is a record type bound on the transport while at least
//! one handler for it is registered.

pub mod client;
pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
mod heartbeat;
mod reconnect;
pub mod types;

pub use client::Client;
pub use config::{Config, HeartbeatPolicy, ReconnectConfig};
pub use dispatcher::{BUILTIN_EVENTS, Handler, HandlerId, is_builtin};
pub use error::{ConnectionError, HeartbeatError, StreamError};
pub use types::{CloseEvent, ConnectionState, Event, MessageEvent, Metrics, Payload};
