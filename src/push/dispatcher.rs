//! Handler registry and native listener bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::types::{Event, Metrics};
use crate::transport::{ERROR, Listener, ListenerId, MESSAGE, OPEN, Record, Transport};

/// Client-level event names. Everything else is a custom event bound on the transport.
pub const BUILTIN_EVENTS: [&str; 4] = [OPEN, "close", ERROR, MESSAGE];

/// Callback registered with [`Client::on`](crate::push::Client::on).
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[must_use]
pub fn is_builtin(event: &str) -> bool {
    BUILTIN_EVENTS.contains(&event)
}

/// Event name to ordered handlers.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub(crate) fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a handler. Returns `true` when it is the first one for `event`.
    pub(crate) fn insert(&self, event: &str, id: HandlerId, handler: Handler) -> bool {
        let mut entry = self.handlers.entry(event.to_owned()).or_default();
        entry.push((id, handler));
        entry.len() == 1
    }

    /// Remove one handler, or all of them when `id` is `None`.
    ///
    /// Returns `true` when this call left `event` without handlers.
    pub(crate) fn remove(&self, event: &str, id: Option<HandlerId>) -> bool {
        let Some(id) = id else {
            return self.handlers.remove(event).is_some();
        };

        let emptied = match self.handlers.get_mut(event) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(handler_id, _)| *handler_id != id);
                before != entry.len() && entry.is_empty()
            }
            None => false,
        };

        if emptied {
            self.handlers.remove_if(event, |_, handlers| handlers.is_empty());
        }
        emptied
    }

    pub(crate) fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, |entry| entry.len())
    }

    pub(crate) fn custom_events(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|event| !is_builtin(event))
            .collect()
    }

    /// Invoke every handler registered for `event`.
    ///
    /// Handlers are copied out first so they may register or remove handlers themselves.
    pub(crate) fn dispatch(&self, event: &str, payload: &Event) {
        let handlers: Vec<Handler> = match self.handlers.get(event) {
            Some(entry) => entry.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => return,
        };

        for handler in handlers {
            handler(payload);
        }
    }

    pub(crate) fn clear(&self) {
        self.handlers.clear();
    }
}

/// Account for a record before it is dispatched.
pub(crate) fn record_metrics(metrics: &mut Metrics, record: &Record) {
    metrics.events_received = metrics.events_received.saturating_add(1);
    metrics.bytes_received = metrics
        .bytes_received
        .saturating_add(u64::try_from(record.data.len()).unwrap_or(u64::MAX));
    if let Some(id) = &record.last_event_id {
        metrics.last_event_id = Some(id.clone());
    }
}

/// The live transport together with the listeners attached to it.
pub(crate) struct Attachment {
    pub(crate) generation: u64,
    transport: Arc<dyn Transport>,
    listeners: HashMap<String, ListenerId>,
}

impl Attachment {
    pub(crate) fn new(generation: u64, transport: Arc<dyn Transport>) -> Self {
        Self {
            generation,
            transport,
            listeners: HashMap::new(),
        }
    }

    /// Attach a native listener for `event` unless one is already attached.
    pub(crate) fn subscribe(&mut self, event: &str, listener: Listener) {
        if self.listeners.contains_key(event) {
            return;
        }

        let id = self.transport.add_event_listener(event, listener);
        self.listeners.insert(event.to_owned(), id);
    }

    pub(crate) fn unsubscribe(&mut self, event: &str) {
        if let Some(id) = self.listeners.remove(event) {
            self.transport.remove_event_listener(event, id);
        }
    }

    /// Remove every listener and close the transport.
    pub(crate) fn detach(mut self) {
        for (event, id) in self.listeners.drain() {
            self.transport.remove_event_listener(&event, id);
        }
        self.transport.close();
    }
}
