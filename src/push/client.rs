use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use url::Url;

use super::config::Config;
use super::connection::{ConnectionManager, Origin};
use super::dispatcher::{Handler, HandlerId};
use super::types::{ConnectionState, Event, Metrics};
use crate::Result;
use crate::clock::Clock;
use crate::error::Error;
use crate::transport::TransportFactory;

/// Resilient push-stream client.
///
/// Wraps a [`TransportFactory`] with connection lifecycle management: a
/// `connecting → connected → disconnected → closed` state machine, automatic
/// reconnection with pluggable backoff, a heartbeat watchdog and named-event dispatch.
///
/// Cloning is cheap; every clone drives the same connection.
///
/// # Examples
///
/// ```rust, no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pushstream_client::push::{Client, Config, Event};
/// # use pushstream_client::transport::TransportFactory;
///
/// # async fn run(transport: Arc<dyn TransportFactory>) -> pushstream_client::Result<()> {
/// let config = Config::builder()
///     .heartbeat_timeout(Duration::from_secs(30))
///     .build();
/// let client = Client::with_tokio_clock("https://stream.example.com/prices", config, transport)?;
///
/// client.on("price", |event: &Event| {
///     if let Some(message) = event.as_message() {
///         println!("price update: {:?}", message.data);
///     }
/// });
///
/// client.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ConnectionManager>,
}

impl Client {
    /// Create a client without connecting.
    ///
    /// Relative endpoints are resolved against [`Config::base_url`]. Fails when the
    /// endpoint cannot be parsed or a configured timeout is zero.
    pub fn new(
        endpoint: &str,
        config: Config,
        transport: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            inner: ConnectionManager::new(endpoint, config, transport, clock)?,
        })
    }

    /// Create a client whose timers run on the current Tokio runtime.
    #[cfg(feature = "tokio-clock")]
    pub fn with_tokio_clock(
        endpoint: &str,
        config: Config,
        transport: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let clock = crate::clock::TokioClock::current()?;
        Self::new(endpoint, config, transport, Arc::new(clock))
    }

    /// Create a client and start connecting.
    ///
    /// Waits for the first connection when [`Config::wait_for_connection`] is set.
    /// Otherwise returns right away; the outcome is reported through the `open`
    /// and `error` events.
    pub async fn open(
        endpoint: &str,
        config: Config,
        transport: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Self::new(endpoint, config, transport, clock)?;
        let connecting = client.connect();

        if client.inner.config().wait_for_connection {
            connecting.await?;
        } else {
            drop(connecting);
        }

        Ok(client)
    }

    /// Start a connection attempt and wait for its outcome.
    ///
    /// The attempt starts when this method is called, not when the future is first
    /// polled. Resolves immediately when already connected. Fails when the client is
    /// closed, when another attempt is in flight, or when this attempt fails or times
    /// out. Dropping the future does not cancel the attempt; its failure is then
    /// reported on the `error` event instead.
    pub fn connect(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let started = self.inner.start_connect(Origin::Initial);

        async move {
            match started? {
                Some(receiver) => receiver.await.unwrap_or_else(|_closed| {
                    Err(Error::validation(
                        "client was dropped before the connection settled",
                    ))
                }),
                None => Ok(()),
            }
        }
    }

    /// Register a handler for `event`.
    ///
    /// `open`, `close`, `error` and `message` are client events; any other name is
    /// bound on the transport as a named record type.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.inner.on(event, handler)
    }

    /// Register a handler that runs for the first matching event only.
    pub fn once<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.inner.once(event, handler)
    }

    /// Remove one handler, or every handler for `event` when `id` is `None`.
    pub fn off(&self, event: &str, id: Option<HandlerId>) {
        self.inner.off(event, id);
    }

    /// Number of handlers currently registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.handler_count(event)
    }

    /// Close the client for good. Idempotent.
    pub fn close(&self) {
        self.inner.close_with_reason(None);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_receiver()
    }

    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.inner.metrics()
    }

    /// Identifier sent with every connection as the `correlationId` query parameter.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        self.inner.correlation_id()
    }

    /// The resolved endpoint, without per-connection query parameters.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        self.inner.endpoint()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint().as_str())
            .field("correlation_id", &self.inner.correlation_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
