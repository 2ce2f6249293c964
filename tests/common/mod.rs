#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pushstream_client::backoff::fixed;
use pushstream_client::clock::ManualClock;
use pushstream_client::error::Kind;
use pushstream_client::push::{
    Client, CloseEvent, Config, ConnectionState, Event, MessageEvent, ReconnectConfig,
};
use pushstream_client::transport::{
    ERROR, Listener, ListenerId, OPEN, ReadyState, Record, Transport, TransportEvent,
    TransportFactory, TransportFailure, TransportOptions,
};
use url::Url;

pub const ENDPOINT: &str = "https://stream.example.com/events";
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// In-memory transport driven by the test.
#[derive(Default)]
pub struct FakeTransport {
    pub url: Option<Url>,
    pub options: TransportOptions,
    listeners: Mutex<Vec<(String, ListenerId, Listener)>>,
    next_id: AtomicU64,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    closed: AtomicUsize,
    open: AtomicBool,
}

impl FakeTransport {
    fn emit(&self, event: &str, notification: &TransportEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == event)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(notification.clone());
        }
    }

    pub fn emit_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.emit(OPEN, &TransportEvent::Open);
    }

    pub fn emit_error(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.emit(ERROR, &TransportEvent::Error(TransportFailure::new(reason)));
    }

    /// Deliver a record to the listeners attached for its event type.
    pub fn emit_record(&self, record: Record) {
        let event = record.event_type.clone();
        self.emit(&event, &TransportEvent::Message(record));
    }

    pub fn emit_message(&self, data: &str) {
        self.emit_record(Record::new("message", data));
    }

    /// Event names with a listener currently attached.
    pub fn listening(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &Url {
        self.url.as_ref().unwrap()
    }
}

impl Transport for FakeTransport {
    fn add_event_listener(&self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap()
            .push((event.to_owned(), id, listener));
        self.added.lock().unwrap().push(event.to_owned());
        id
    }

    fn remove_event_listener(&self, event: &str, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(name, listener_id, _)| !(name == event && *listener_id == id));
        self.removed.lock().unwrap().push(event.to_owned());
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn ready_state(&self) -> ReadyState {
        if self.open.load(Ordering::SeqCst) {
            ReadyState::Open
        } else if self.closed.load(Ordering::SeqCst) > 0 {
            ReadyState::Closed
        } else {
            ReadyState::Connecting
        }
    }
}

/// Hands out [`FakeTransport`]s and remembers every one it created.
#[derive(Default)]
pub struct FakeFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    /// Fail this many upcoming `create` calls
    failures: AtomicUsize,
    /// Create transports that already report `Open`
    open_on_create: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn open_on_create(&self) {
        self.open_on_create.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn latest(&self) -> Arc<FakeTransport> {
        Arc::clone(self.transports.lock().unwrap().last().unwrap())
    }

    pub fn nth(&self, index: usize) -> Arc<FakeTransport> {
        Arc::clone(&self.transports.lock().unwrap()[index])
    }
}

impl TransportFactory for FakeFactory {
    fn create(
        &self,
        url: &Url,
        options: &TransportOptions,
    ) -> pushstream_client::Result<Arc<dyn Transport>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(pushstream_client::error::Error::validation(
                "transport unavailable",
            ));
        }

        let transport = Arc::new(FakeTransport {
            url: Some(url.clone()),
            options: options.clone(),
            open: AtomicBool::new(self.open_on_create.load(Ordering::SeqCst)),
            ..FakeTransport::default()
        });
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// What a handler saw, detached from the borrowed [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Open,
    Message(MessageEvent),
    Close(CloseEvent),
    Error { kind: Kind, message: String },
}

impl Seen {
    fn from_event(event: &Event) -> Self {
        match event {
            Event::Open => Self::Open,
            Event::Message(message) => Self::Message(message.clone()),
            Event::Close(close) => Self::Close(close.clone()),
            Event::Error(error) => Self::Error {
                kind: error.kind(),
                message: error.to_string(),
            },
            _ => unreachable!("unexpected event {event:?}"),
        }
    }
}

/// Collects every event delivered to the handlers it registered.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, Seen)>>>,
}

impl Recorder {
    pub fn attach(client: &Client, events: &[&str]) -> Self {
        let recorder = Self::default();
        for event in events {
            let seen = Arc::clone(&recorder.seen);
            let name = (*event).to_owned();
            client.on(event, move |payload: &Event| {
                seen.lock()
                    .unwrap()
                    .push((name.clone(), Seen::from_event(payload)));
            });
        }
        recorder
    }

    /// Records `open`, `close`, `error` and `message`.
    pub fn builtin(client: &Client) -> Self {
        Self::attach(client, &["open", "close", "error", "message"])
    }

    pub fn all(&self) -> Vec<(String, Seen)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn named(&self, event: &str) -> Vec<Seen> {
        self.all()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, seen)| seen)
            .collect()
    }

    pub fn errors(&self) -> Vec<(Kind, String)> {
        self.named("error")
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Error { kind, message } => Some((kind, message)),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<CloseEvent> {
        self.named("close")
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Close(close) => Some(close),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self, event: &str) -> Vec<MessageEvent> {
        self.named(event)
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

pub fn reconnect_config(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig::builder()
        .max_attempts(max_attempts)
        .strategy(Arc::new(fixed(RETRY_DELAY)))
        .build()
}

pub struct Harness {
    pub client: Client,
    pub factory: Arc<FakeFactory>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let factory = FakeFactory::new();
        let clock = ManualClock::new();
        let client = Client::new(
            ENDPOINT,
            config,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(clock.clone()),
        )
        .unwrap();

        Self {
            client,
            factory,
            clock,
        }
    }

    /// Connect and open the first transport.
    pub async fn connected(config: Config) -> Self {
        let harness = Self::new(config);
        let connecting = harness.client.connect();
        harness.factory.latest().emit_open();
        connecting.await.unwrap();
        assert_eq!(harness.client.state(), ConnectionState::Connected);
        harness
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}
