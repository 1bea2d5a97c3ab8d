//! # Event Bus
//!
//! Components post [`Event`]s to a shared, bounded [`EventBus`]. The runtime
//! drains it on its own loop, hands each event to the configured
//! [`EventSink`] and fires the [`Notifier`] callbacks subscribed to its topic.
//!
//! | Class | Examples | Evicted |
//! |-------|----------|---------|
//! | `Log` | free-form diagnostics | first |
//! | `Stats` | periodic telemetry | second |
//! | `Control` | circuit ready/broken, gateway toggles, handle changes | last |
//!
//! Data-plane traffic never goes through the bus.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventClass {
    Log,
    Stats,
    Control,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    CircuitReady,
    CircuitBroken,
    GatewayAccepting,
    GatewayRefusing,
    HandleAdded,
    HandleRemoved,
    Stats,
    Log,
}

impl Topic {
    pub fn class(self) -> EventClass {
        match self {
            Topic::Log => EventClass::Log,
            Topic::Stats => EventClass::Stats,
            _ => EventClass::Control,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::CircuitReady => "circuit_ready",
            Topic::CircuitBroken => "circuit_broken",
            Topic::GatewayAccepting => "gateway_accepting",
            Topic::GatewayRefusing => "gateway_refusing",
            Topic::HandleAdded => "handle_added",
            Topic::HandleRemoved => "handle_removed",
            Topic::Stats => "stats",
            Topic::Log => "log",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub detail: String,
}

impl Event {
    pub fn new(topic: Topic, detail: impl Into<String>) -> Self {
        Self {
            topic,
            detail: detail.into(),
        }
    }

    pub fn class(&self) -> EventClass {
        self.topic.class()
    }
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Debug)]
struct BusInner {
    queue: VecDeque<Event>,
    capacity: usize,
    evicted: u64,
}

/// Bounded multi-producer event queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                queue: VecDeque::new(),
                capacity: capacity.max(1),
                evicted: 0,
            })),
        }
    }

    // a panicking producer must not silence everyone else
    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an event. When full, the oldest event of the least useful
    /// class present is evicted, which may be the new one. Returns false
    /// when the new event itself was dropped.
    pub fn push(&self, event: Event) -> bool {
        let mut inner = self.lock();
        inner.queue.push_back(event);
        if inner.queue.len() <= inner.capacity {
            return true;
        }
        let Some(least) = inner.queue.iter().map(Event::class).min() else {
            return true;
        };
        let Some(victim) = inner.queue.iter().position(|e| e.class() == least) else {
            return true;
        };
        inner.queue.remove(victim);
        inner.evicted += 1;
        victim != inner.queue.len()
    }

    pub fn emit(&self, topic: Topic, detail: impl Into<String>) -> bool {
        self.push(Event::new(topic, detail))
    }

    pub fn drain(&self) -> Vec<Event> {
        self.lock().queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

// ============================================================================
// Notifier
// ============================================================================

pub type SubscriptionId = u64;

type Callback = Box<dyn FnMut(&Event) + Send>;

struct Subscription {
    id: SubscriptionId,
    once: bool,
    callback: Callback,
}

/// Topic to callbacks registry. Owned by the runtime loop.
#[derive(Default)]
pub struct Notifier {
    topics: HashMap<Topic, Vec<Subscription>>,
    next_id: SubscriptionId,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<Topic, usize> = self.topics.iter().map(|(t, s)| (*t, s.len())).collect();
        f.debug_struct("Notifier").field("topics", &counts).finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`. With `once` it is dropped after the
    /// first event it sees.
    pub fn subscribe(
        &mut self,
        topic: Topic,
        once: bool,
        callback: impl FnMut(&Event) + Send + 'static,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.topics.entry(topic).or_default().push(Subscription {
            id,
            once,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subs in self.topics.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Fire every callback of the event's topic. Returns how many ran.
    pub fn notify(&mut self, event: &Event) -> usize {
        let Some(subs) = self.topics.get_mut(&event.topic) else {
            return 0;
        };
        for sub in subs.iter_mut() {
            (sub.callback)(event);
        }
        let fired = subs.len();
        subs.retain(|s| !s.once);
        fired
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, Vec::len)
    }
}

// ============================================================================
// Sinks
// ============================================================================

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &Event);
}

/// Discards everything. Used by the CLI.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _event: &Event) {}
}

/// Keeps every event for later inspection.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.topic == topic).count())
            .unwrap_or(0)
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
