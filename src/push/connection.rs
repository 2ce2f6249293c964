use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use url::Url;
use uuid::Uuid;

use super::config::{Config, HeartbeatPolicy};
use super::dispatcher::{
    Attachment, EventDispatcher, Handler, HandlerId, is_builtin, record_metrics,
};
use super::error::{ConnectionError, HeartbeatError, MAX_ATTEMPTS_EXCEEDED, StreamError};
use super::heartbeat::HeartbeatMonitor;
use super::reconnect::{Plan, ReconnectionEngine};
use super::types::{CloseEvent, ConnectionState, Event, MessageEvent, Metrics, Payload};
use crate::Result;
use crate::clock::{Clock, TimerHandle};
use crate::error::Error;
use crate::transport::{
    ERROR, Listener, MESSAGE, OPEN, ReadyState, Record, Transport, TransportEvent,
    TransportFactory, TransportFailure, TransportOptions,
};

const CLOSE: &str = "close";
pub(crate) const LAST_EVENT_ID_PARAM: &str = "lastEventId";
pub(crate) const CORRELATION_ID_PARAM: &str = "correlationId";

/// Who started a connection attempt, which decides what a failure leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// `connect()` called by the consumer; failures settle the returned future
    Initial,
    /// Fired by the reconnection engine; failures schedule the next attempt
    Reconnect { attempt: u32 },
}

/// The settle-once half of a `connect()` call.
///
/// Lives in `Shared::pending` and is moved out by whichever of open, error, timeout
/// or close gets there first, so a late notification finds nothing to settle.
struct Completion {
    origin: Origin,
    tx: oneshot::Sender<Result<()>>,
}

impl Completion {
    /// Returns the error back when nobody is waiting for the outcome anymore.
    fn settle(self, result: Result<()>) -> Option<Error> {
        self.tx.send(result).err().and_then(std::result::Result::err)
    }
}

struct Shared {
    state: ConnectionState,
    /// Bumped whenever a transport is created or abandoned; callbacks from older
    /// generations are ignored
    generation: u64,
    url: Url,
    pending: Option<Completion>,
    connect_timer: Option<TimerHandle>,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectionEngine,
    metrics: Metrics,
    connected_since: Option<Instant>,
}

/// Drives one push connection: the state machine, transport lifecycle, heartbeat,
/// reconnection and handler dispatch.
///
/// All coordination happens inside transport and clock callbacks. The shared state
/// lock is never held while handlers run or while the transport is called; the
/// attachment lock may be taken before the shared state lock, never after it.
pub(crate) struct ConnectionManager {
    endpoint: Url,
    correlation_id: String,
    config: Config,
    factory: Arc<dyn TransportFactory>,
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    attachment: Mutex<Option<Attachment>>,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub(crate) fn new(
        endpoint: &str,
        config: Config,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        if config.heartbeat_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::validation(
                "heartbeat timeout must be greater than zero",
            ));
        }
        if config.connection_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::validation(
                "connection timeout must be greater than zero",
            ));
        }

        let endpoint = resolve_endpoint(endpoint, &config)?;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        Ok(Arc::new(Self {
            correlation_id: Uuid::new_v4().to_string(),
            shared: Mutex::new(Shared {
                state: ConnectionState::Connecting,
                generation: 0,
                url: endpoint.clone(),
                pending: None,
                connect_timer: None,
                heartbeat: HeartbeatMonitor::new(config.heartbeat_timeout),
                reconnect: ReconnectionEngine::new(&config.reconnect),
                metrics: Metrics::default(),
                connected_since: None,
            }),
            endpoint,
            config,
            factory,
            clock,
            attachment: Mutex::new(None),
            dispatcher: EventDispatcher::default(),
            state_tx,
        }))
    }

    pub(crate) fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn metrics(&self) -> Metrics {
        let shared = self.lock();
        let mut metrics = shared.metrics.clone();
        if let Some(since) = shared.connected_since {
            metrics.connection_duration = self.clock.now().saturating_duration_since(since);
        }
        metrics
    }

    /// Begin a connection attempt.
    ///
    /// `Ok(None)` when already connected; otherwise the receiver settles exactly once
    /// with the outcome of this attempt.
    pub(crate) fn start_connect(
        self: &Arc<Self>,
        origin: Origin,
    ) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let (generation, url, receiver) = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::Closed => {
                    return Err(self
                        .connection_error(&shared, "Client is closed", None)
                        .into());
                }
                ConnectionState::Connected => return Ok(None),
                ConnectionState::Connecting if shared.pending.is_some() => {
                    return Err(Error::validation(
                        "a connection attempt is already in progress",
                    ));
                }
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }

            if origin == Origin::Initial {
                shared.reconnect.cancel();
                shared.metrics.reconnect_attempts = 0;
            }
            self.set_state(&mut shared, ConnectionState::Connecting);
            shared.generation = shared.generation.wrapping_add(1);
            let generation = shared.generation;

            let url = build_connection_url(
                &self.endpoint,
                shared.metrics.last_event_id.as_deref(),
                &self.correlation_id,
            );
            shared.url = url.clone();

            let (tx, rx) = oneshot::channel();
            shared.pending = Some(Completion { origin, tx });

            if let Some(timeout) = self.config.connection_timeout {
                let weak = Arc::downgrade(self);
                shared.connect_timer = Some(self.clock.schedule(
                    timeout,
                    Box::new(move || {
                        if let Some(manager) = weak.upgrade() {
                            manager.handle_failure(
                                generation,
                                TransportFailure::new("connection timed out"),
                            );
                        }
                    }),
                ));
            }

            (generation, url, rx)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%url, generation, ?origin, "Opening push connection");

        let options = TransportOptions {
            with_credentials: self.config.with_credentials,
            headers: self.config.headers.clone(),
        };

        match self.factory.create(&url, &options) {
            Ok(transport) => self.attach(generation, transport),
            Err(e) => self.handle_failure(generation, TransportFailure::new(e.to_string())),
        }

        Ok(Some(receiver))
    }

    /// Attach the native listeners to a freshly created transport and install it.
    fn attach(self: &Arc<Self>, generation: u64, transport: Arc<dyn Transport>) {
        let mut attachment = Attachment::new(generation, Arc::clone(&transport));

        let stale = {
            let mut slot = self.attachment_lock();
            for event in [OPEN, ERROR, MESSAGE] {
                attachment.subscribe(event, self.listener(generation, event));
            }
            for event in self.dispatcher.custom_events() {
                let listener = self.listener(generation, &event);
                attachment.subscribe(&event, listener);
            }

            if self.is_current(generation) {
                slot.replace(attachment)
            } else {
                Some(attachment)
            }
        };

        if let Some(stale) = stale {
            stale.detach();
        }

        if transport.ready_state() == ReadyState::Open {
            self.handle_open(generation);
        }
    }

    fn listener(self: &Arc<Self>, generation: u64, event: &str) -> Listener {
        let weak = Arc::downgrade(self);
        let event = event.to_owned();

        Arc::new(move |notification: TransportEvent| {
            if let Some(manager) = weak.upgrade() {
                manager.on_transport_event(generation, &event, notification);
            }
        })
    }

    fn on_transport_event(
        self: &Arc<Self>,
        generation: u64,
        event: &str,
        notification: TransportEvent,
    ) {
        match notification {
            TransportEvent::Open => self.handle_open(generation),
            TransportEvent::Error(failure) => self.handle_failure(generation, failure),
            TransportEvent::Message(record) if event == ERROR => {
                self.handle_stream_error(generation, &record);
            }
            TransportEvent::Message(record) => self.handle_record(generation, event, record),
        }
    }

    fn handle_open(self: &Arc<Self>, generation: u64) {
        let completion = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state != ConnectionState::Connecting {
                return;
            }

            self.set_state(&mut shared, ConnectionState::Connected);
            shared.connect_timer = None;
            shared.metrics.reconnect_attempts = 0;
            let now = self.clock.now();
            shared.connected_since.get_or_insert(now);
            self.arm_heartbeat(&mut shared);
            shared.pending.take()
        };

        #[cfg(feature = "tracing")]
        tracing::info!(generation, "Push connection established");

        self.dispatcher.dispatch(OPEN, &Event::Open);

        if let Some(completion) = completion {
            // An `open` handler may have closed the client.
            let outcome = {
                let shared = self.lock();
                if shared.state.is_closed() {
                    Err(self
                        .connection_error(&shared, "Client closed during open", None)
                        .into())
                } else {
                    Ok(())
                }
            };
            drop(completion.settle(outcome));
        }
    }

    /// A transport error, a factory error or a connect timeout for `generation`.
    fn handle_failure(self: &Arc<Self>, generation: u64, failure: TransportFailure) {
        enum Failed {
            Attempt(Completion, ConnectionError),
            Live(ConnectionError, bool),
        }

        let failed = {
            let mut shared = self.lock();
            if shared.generation != generation {
                return;
            }

            let state = shared.state;
            match state {
                ConnectionState::Connecting => {
                    let Some(completion) = shared.pending.take() else {
                        return;
                    };
                    let error = self.connection_error(&shared, "Connection failed", Some(failure));
                    shared.connect_timer = None;
                    shared.generation = shared.generation.wrapping_add(1);
                    self.set_state(&mut shared, ConnectionState::Disconnected);
                    Failed::Attempt(completion, error)
                }
                ConnectionState::Connected => {
                    let error = self.connection_error(&shared, "Connection lost", Some(failure));
                    shared.heartbeat.disarm();
                    shared.generation = shared.generation.wrapping_add(1);
                    self.set_state(&mut shared, ConnectionState::Disconnected);
                    Failed::Live(error, shared.reconnect.is_enabled())
                }
                ConnectionState::Disconnected | ConnectionState::Closed => return,
            }
        };

        self.detach(generation);

        match failed {
            Failed::Attempt(completion, error) => self.fail_attempt(completion, error),
            Failed::Live(error, reconnect) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, reconnect, "Push connection lost");

                let reason = error.message.clone();
                self.emit_error(error.into());
                self.emit_close(reconnect, Some(reason.as_str()));
                if reconnect {
                    self.schedule_reconnect(0);
                }
            }
        }
    }

    fn fail_attempt(self: &Arc<Self>, completion: Completion, error: ConnectionError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, origin = ?completion.origin, "Push connection attempt failed");

        match completion.origin {
            Origin::Initial => {
                if let Some(unclaimed) = completion.settle(Err(error.into())) {
                    self.emit_error(unclaimed);
                }
                if !self.config.reconnect.enabled {
                    self.close_with_reason(Some("Connection failed"));
                }
            }
            Origin::Reconnect { attempt } => {
                drop(completion);
                self.emit_error(error.into());
                self.schedule_reconnect(attempt.saturating_add(1));
            }
        }
    }

    /// Update metrics and restart the heartbeat for a record on the live transport.
    ///
    /// Returns the connection URL, or `None` when the record must be ignored.
    fn accept_record(self: &Arc<Self>, generation: u64, record: &Record) -> Option<String> {
        let mut shared = self.lock();
        if shared.generation != generation || !shared.state.is_connected() {
            return None;
        }

        record_metrics(&mut shared.metrics, record);
        self.arm_heartbeat(&mut shared);
        Some(shared.url.to_string())
    }

    fn handle_record(self: &Arc<Self>, generation: u64, event: &str, record: Record) {
        if self.accept_record(generation, &record).is_none() {
            return;
        }

        let message = MessageEvent {
            event: event.to_owned(),
            data: Payload::decode(&record.data, self.config.parse_json),
            last_event_id: record.last_event_id,
        };
        self.dispatcher.dispatch(event, &Event::Message(message));
    }

    fn handle_stream_error(self: &Arc<Self>, generation: u64, record: &Record) {
        let Some(url) = self.accept_record(generation, record) else {
            return;
        };

        let error = StreamError::from_payload(&url, &self.correlation_id, &record.data);

        #[cfg(feature = "tracing")]
        tracing::debug!(%error, "Server pushed an error record");

        self.emit_error(error.into());
    }

    fn arm_heartbeat(self: &Arc<Self>, shared: &mut Shared) {
        let weak = Arc::downgrade(self);
        shared.heartbeat.arm(self.clock.as_ref(), move |seq| {
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.on_heartbeat_expired(seq);
                }
            }
        });
    }

    fn on_heartbeat_expired(self: &Arc<Self>, seq: u64) {
        let (error, generation) = {
            let mut shared = self.lock();
            if !shared.state.is_connected() {
                return;
            }
            let now = self.clock.now();
            let Some(elapsed) = shared.heartbeat.expire(seq, now) else {
                return;
            };
            let Some(timeout) = shared.heartbeat.timeout() else {
                return;
            };

            let error = HeartbeatError {
                url: shared.url.to_string(),
                correlation_id: self.correlation_id.clone(),
                heartbeat_timeout: timeout,
                time_since_last_event: elapsed,
                last_event_id: shared.metrics.last_event_id.clone(),
            };
            let generation = shared.generation;
            shared.generation = shared.generation.wrapping_add(1);
            self.set_state(&mut shared, ConnectionState::Disconnected);
            (error, generation)
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(%error, policy = ?self.config.heartbeat_policy, "Heartbeat timeout");

        self.detach(generation);
        self.emit_error(error.into());

        let reason = "Heartbeat timeout";
        match self.config.heartbeat_policy {
            HeartbeatPolicy::Reconnect if self.config.reconnect.enabled => {
                self.emit_close(true, Some(reason));
                self.schedule_reconnect(0);
            }
            HeartbeatPolicy::Reconnect => self.emit_close(false, Some(reason)),
            HeartbeatPolicy::Close => self.close_with_reason(Some(reason)),
        }
    }

    /// Plan reconnection attempt `attempt`, or give up when the budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, attempt: u32) {
        let exhausted = {
            let mut shared = self.lock();
            // A handler may already have closed the client or started a new attempt.
            if shared.state != ConnectionState::Disconnected {
                return;
            }

            match shared.reconnect.plan(attempt) {
                Plan::Exhausted => {
                    Some(self.connection_error(&shared, MAX_ATTEMPTS_EXCEEDED, None))
                }
                Plan::Retry { delay } => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, ?delay, "Scheduling reconnection");

                    shared.metrics.reconnect_attempts = attempt.saturating_add(1);
                    let weak = Arc::downgrade(self);
                    shared
                        .reconnect
                        .schedule(self.clock.as_ref(), delay, move |seq| {
                            move || {
                                if let Some(manager) = weak.upgrade() {
                                    manager.on_reconnect_due(seq, attempt);
                                }
                            }
                        });
                    None
                }
            }
        };

        if let Some(error) = exhausted {
            #[cfg(feature = "tracing")]
            tracing::error!(%error, "Giving up on reconnection");

            self.emit_error(error.into());
            self.close_with_reason(Some(MAX_ATTEMPTS_EXCEEDED));
        }
    }

    fn on_reconnect_due(self: &Arc<Self>, seq: u64, attempt: u32) {
        {
            let mut shared = self.lock();
            if shared.state != ConnectionState::Disconnected || !shared.reconnect.take_due(seq) {
                return;
            }
        }

        // The outcome arrives through `handle_open` or `fail_attempt`.
        if let Err(e) = self.start_connect(Origin::Reconnect { attempt }) {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, attempt, "Reconnection attempt not started");
            #[cfg(not(feature = "tracing"))]
            let _: &Error = &e;
        }
    }

    pub(crate) fn close_with_reason(&self, reason: Option<&str>) {
        let pending = {
            let mut shared = self.lock();
            if shared.state.is_closed() {
                return;
            }

            let pending = shared.pending.take().map(|completion| {
                let error = self.connection_error(
                    &shared,
                    "Connection closed before it was established",
                    None,
                );
                (completion, error)
            });

            self.set_state(&mut shared, ConnectionState::Closed);
            shared.generation = shared.generation.wrapping_add(1);
            shared.heartbeat.disarm();
            shared.reconnect.cancel();
            shared.connect_timer = None;
            if let Some(since) = shared.connected_since.take() {
                shared.metrics.connection_duration =
                    self.clock.now().saturating_duration_since(since);
            }
            pending
        };

        let attachment = self.attachment_lock().take();
        if let Some(attachment) = attachment {
            attachment.detach();
        }

        if let Some((completion, error)) = pending {
            drop(completion.settle(Err(error.into())));
        }

        #[cfg(feature = "tracing")]
        tracing::info!(reason, "Push client closed");

        self.emit_close(false, reason);
        self.dispatcher.clear();
    }

    pub(crate) fn on(self: &Arc<Self>, event: &str, handler: Handler) -> HandlerId {
        let id = self.dispatcher.next_id();
        self.register(event, id, handler);
        id
    }

    pub(crate) fn once(self: &Arc<Self>, event: &str, handler: Handler) -> HandlerId {
        let id = self.dispatcher.next_id();
        let fired = AtomicBool::new(false);
        let weak = Arc::downgrade(self);
        let name = event.to_owned();

        let wrapper: Handler = Arc::new(move |payload: &Event| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(manager) = weak.upgrade() {
                manager.off(&name, Some(id));
            }
            handler(payload);
        });

        self.register(event, id, wrapper);
        id
    }

    fn register(self: &Arc<Self>, event: &str, id: HandlerId, handler: Handler) {
        let first = self.dispatcher.insert(event, id, handler);
        if !first || is_builtin(event) {
            return;
        }

        let mut slot = self.attachment_lock();
        if let Some(attachment) = slot.as_mut() {
            let listener = self.listener(attachment.generation, event);
            attachment.subscribe(event, listener);
        }
    }

    pub(crate) fn off(&self, event: &str, id: Option<HandlerId>) {
        if !self.dispatcher.remove(event, id) || is_builtin(event) {
            return;
        }

        if let Some(attachment) = self.attachment_lock().as_mut() {
            attachment.unsubscribe(event);
        }
    }

    pub(crate) fn handler_count(&self, event: &str) -> usize {
        self.dispatcher.handler_count(event)
    }

    fn emit_error(&self, error: Error) {
        self.dispatcher.dispatch(ERROR, &Event::Error(error));
    }

    fn emit_close(&self, reconnect: bool, reason: Option<&str>) {
        let event = Event::Close(CloseEvent {
            reconnect,
            reason: reason.map(str::to_owned),
        });
        self.dispatcher.dispatch(CLOSE, &event);
    }

    fn detach(&self, generation: u64) {
        let attachment = {
            let mut slot = self.attachment_lock();
            if slot
                .as_ref()
                .is_some_and(|attachment| attachment.generation == generation)
            {
                slot.take()
            } else {
                None
            }
        };

        if let Some(attachment) = attachment {
            attachment.detach();
        }
    }

    fn set_state(&self, shared: &mut Shared, next: ConnectionState) {
        let previous = shared.state;
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            #[cfg(feature = "tracing")]
            tracing::warn!(from = %previous, to = %next, "Refusing invalid state transition");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(from = %previous, to = %next, "Connection state changed");

        shared.state = next;
        self.state_tx.send_replace(next);
    }

    fn connection_error(
        &self,
        shared: &Shared,
        message: &str,
        original_error: Option<TransportFailure>,
    ) -> ConnectionError {
        ConnectionError {
            message: message.to_owned(),
            url: shared.url.to_string(),
            correlation_id: self.correlation_id.clone(),
            state: shared.state,
            reconnect_attempts: shared.metrics.reconnect_attempts,
            original_error,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attachment_lock(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let attachment = self
            .attachment
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(attachment) = attachment {
            attachment.detach();
        }
    }
}

/// Parse `endpoint`, resolving relative paths against the configured base.
fn resolve_endpoint(endpoint: &str, config: &Config) -> Result<Url> {
    match Url::parse(endpoint) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(config.base_url()?.join(endpoint)?),
        Err(e) => Err(e.into()),
    }
}

/// `endpoint` with `lastEventId` (when known) and `correlationId` query parameters,
/// replacing any values already present.
pub(crate) fn build_connection_url(
    endpoint: &Url,
    last_event_id: Option<&str>,
    correlation_id: &str,
) -> Url {
    let mut url = endpoint.clone();
    let retained: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(key, _)| *key != LAST_EVENT_ID_PARAM && *key != CORRELATION_ID_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(retained);
        if let Some(id) = last_event_id {
            pairs.append_pair(LAST_EVENT_ID_PARAM, id);
        }
        pairs.append_pair(CORRELATION_ID_PARAM, correlation_id);
    }

    url
}
