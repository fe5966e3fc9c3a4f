//! The flow coordinator
//!
//! A [`Flow`] is a cheap handle over shared state: the topic store, the
//! consumer registrations and a FIFO job queue. Every mutation happens under
//! one `parking_lot` lock; user callbacks never do. Whichever caller finds the
//! job queue idle drains it, so a `define` issued from inside a callback is
//! queued behind the work already scheduled instead of recursing.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, trace, warn};

use super::registration::{Handler, Job, Registration};
use super::runtime::{CallerLocation, Runtime};
use super::store::TopicStore;
use super::types::{IntoTopics, Payload, TopicEvent, ERROR_TOPIC, WILDCARD_TOPIC};
use crate::core::config::FlowConfig;
use crate::core::errors::{FlowError, Result};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot returned by [`Flow::state`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Topics with at least one unsatisfied registration, in registration order
    pub pending: Vec<String>,
    /// topic -> entries not yet dequeued
    pub queue: BTreeMap<String, usize>,
}

#[derive(Default)]
struct FlowState {
    store: TopicStore,
    registrations: Vec<Registration>,
    jobs: VecDeque<Job>,
    draining: bool,
    seen: HashSet<u64>,
    failure: Option<FlowError>,
    failure_delivered: bool,
    unhandled: Option<FlowError>,
    /// Flows this one imported; kept alive by the importer
    imports: Vec<Flow>,
    /// Re-publication targets, both directions of every import
    links: Vec<Weak<FlowInner>>,
    /// Number of flows importing this one
    importers: usize,
    warned: HashSet<String>,
}

impl FlowState {
    fn dispatch(&mut self) {
        let FlowState {
            store,
            registrations,
            jobs,
            failure_delivered,
            ..
        } = self;
        for registration in registrations.iter_mut() {
            if registration.poll(store, jobs) {
                *failure_delivered = true;
            }
        }
        registrations.retain(|r| !r.is_done());
    }

    fn snapshot(&self) -> FlowSnapshot {
        let mut pending: Vec<String> = Vec::new();
        for registration in &self.registrations {
            for key in registration.pending_keys(&self.store) {
                if !pending.contains(&key) {
                    pending.push(key);
                }
            }
        }
        FlowSnapshot {
            pending,
            queue: self.store.queue_counts(),
        }
    }
}

pub(crate) struct FlowInner {
    name: String,
    location: Mutex<Option<CallerLocation>>,
    max_listeners: AtomicUsize,
    state: Mutex<FlowState>,
    /// Signalled after every recorded entry
    pub(crate) settled: Notify,
    inbox: OnceLock<mpsc::UnboundedSender<TopicEvent>>,
}

impl FlowInner {
    /// Start the task draining re-published events, once
    fn open_inbox(self: &Arc<Self>, handle: &Handle) {
        self.inbox.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_inbox(Arc::downgrade(self), rx));
            tx
        });
    }

    /// Queue an event for this flow's next scheduling turn
    fn post(self: &Arc<Self>, event: TopicEvent) {
        let sent = self.inbox.get().is_some_and(|tx| tx.send(event).is_ok());
        if !sent {
            debug!(flow = %self.name, "inbox closed, event dropped");
        }
    }
}

async fn run_inbox(flow: Weak<FlowInner>, mut rx: mpsc::UnboundedReceiver<TopicEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = flow.upgrade() else { break };
        let flow = Flow { inner };
        flow.record(event);
        flow.pump();
    }
}

/// Resets the drain flag if a callback unwinds mid-drain
struct DrainGuard<'a>(&'a Mutex<FlowState>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

/// Reactive topic coordinator
#[derive(Clone)]
pub struct Flow {
    pub(crate) inner: Arc<FlowInner>,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow").field("name", &self.inner.name).finish()
    }
}

impl Flow {
    pub fn new() -> Self {
        Self::build(FlowConfig::default())
    }

    pub fn with_config(config: FlowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Create a flow seeing the topics of `imports` and seen by them.
    ///
    /// Needs a Tokio runtime: re-published entries arrive on the next turn.
    pub fn with_imports<'a>(imports: impl IntoIterator<Item = &'a Flow>) -> Self {
        let flow = Self::new();
        for other in imports {
            flow.import(other);
        }
        flow
    }

    pub(crate) fn build(config: FlowConfig) -> Self {
        let inner = FlowInner {
            name: config.name,
            location: Mutex::new(config.caller_location.map(CallerLocation::new)),
            max_listeners: AtomicUsize::new(config.max_listeners),
            state: Mutex::new(FlowState::default()),
            settled: Notify::new(),
            inbox: OnceLock::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_weak(weak: &Weak<FlowInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<FlowInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ptr_eq(&self, other: &Flow) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn caller_location(&self) -> Option<CallerLocation> {
        self.inner.location.lock().clone()
    }

    pub(crate) fn set_caller_location(&self, location: Option<CallerLocation>) {
        *self.inner.location.lock() = location;
    }

    pub fn set_max_listeners(&self, max: usize) -> &Self {
        self.inner.max_listeners.store(max, Ordering::Relaxed);
        self
    }

    pub fn max_listeners(&self) -> usize {
        self.inner.max_listeners.load(Ordering::Relaxed)
    }

    /// Handle given to callbacks and producers of this flow
    pub fn runtime(&self) -> Runtime {
        Runtime::new(self.clone(), self.caller_location())
    }

    /// Link `other` into this flow: entries defined in either flow, before or
    /// after the call, become visible in both.
    ///
    /// Needs a Tokio runtime: re-published entries arrive on the next turn.
    /// Without one the flows stay unlinked.
    pub fn import(&self, other: &Flow) -> &Self {
        if self.ptr_eq(other) {
            return self;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(flow = %self.name(), imported = %other.name(), "no Tokio runtime, flows not linked");
            return self;
        };
        self.inner.open_inbox(&handle);
        other.inner.open_inbox(&handle);
        {
            let mut state = self.inner.state.lock();
            if state.imports.iter().any(|f| f.ptr_eq(other)) {
                return self;
            }
            state.imports.push(other.clone());
            state.links.push(other.downgrade());
            for event in state.store.log() {
                other.inner.post(event.clone());
            }
        }
        {
            let mut state = other.inner.state.lock();
            state.importers += 1;
            state.links.push(self.downgrade());
            for event in state.store.log() {
                self.inner.post(event.clone());
            }
        }
        debug!(flow = %self.name(), imported = %other.name(), "flows linked");
        self
    }

    pub(crate) fn checked_topics(&self, topics: impl IntoTopics, operation: &str) -> Vec<String> {
        let topics = topics.into_topics();
        let valid: Vec<String> = topics
            .into_iter()
            .filter(|topic| {
                let ok = !topic.is_empty() && topic != WILDCARD_TOPIC;
                if !ok {
                    warn!(flow = %self.name(), topic = %topic, operation, "invalid topic ignored");
                }
                ok
            })
            .collect();
        if valid.is_empty() {
            warn!(flow = %self.name(), operation, "no topics given");
        }
        valid
    }

    /// Publish one entry onto every named topic.
    ///
    /// `null`/`()` is the end marker; an error value fails the flow.
    pub fn define(&self, topics: impl IntoTopics, payload: impl Into<Payload>) -> &Self {
        let payload = payload.into();
        for topic in self.checked_topics(topics, "define") {
            self.record(TopicEvent::new(&topic, payload.clone()));
        }
        self.pump();
        self
    }

    fn record(&self, event: TopicEvent) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.seen.insert(event.id) {
            return;
        }
        if state.failure.is_some() && !event.is_error() {
            trace!(flow = %self.name(), topic = %event.topic, "flow failed, entry dropped");
            return;
        }
        trace!(flow = %self.name(), topic = %event.topic, event_id = event.id, "define");

        let first_failure = match (&event.payload, &state.failure) {
            (Payload::Error(error), None) => Some(error.clone()),
            _ => None,
        };
        for link in &state.links {
            if let Some(peer) = link.upgrade() {
                peer.post(event.clone());
            }
        }
        state.store.append(event);

        if let Some(error) = &first_failure {
            warn!(flow = %self.name(), error = %error, category = error.category(), "flow failed");
            state.failure = Some(error.clone());
            for registration in state.registrations.iter_mut() {
                if registration.fail(error, &mut state.jobs) {
                    state.failure_delivered = true;
                }
            }
        }
        state.dispatch();
        drop(guard);

        self.inner.settled.notify_waiters();
        if let Some(error) = first_failure {
            self.watch_unhandled(error);
        }
    }

    /// Run queued jobs until none are left, unless another caller already is
    fn pump(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        let _guard = DrainGuard(&self.inner.state);
        loop {
            let job = {
                let mut state = self.inner.state.lock();
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            job.run(self);
        }
    }

    fn register(&self, topics: Vec<String>, handler: Handler) {
        let id = NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            for topic in &topics {
                state.store.touch(topic);
            }
            self.check_listeners(state, &topics);

            let mut registration = Registration::new(id, topics, handler);
            if let Some(error) = &state.failure {
                // a one-shot consumer never sees data from a failed flow
                if registration.is_once() && registration.fail(error, &mut state.jobs) {
                    state.failure_delivered = true;
                }
            }
            if !registration.is_done() {
                state.registrations.push(registration);
            }
            state.dispatch();

            // replayed history first, then the failure
            if let Some(error) = state.failure.clone() {
                if let Some(registration) = state.registrations.iter_mut().find(|r| r.id == id) {
                    if registration.fail(&error, &mut state.jobs) {
                        state.failure_delivered = true;
                    }
                }
                state.registrations.retain(|r| !r.is_done());
            }
        }
        self.pump();
    }

    fn check_listeners(&self, state: &mut FlowState, topics: &[String]) {
        let max = self.max_listeners();
        if max == 0 {
            return;
        }
        for topic in topics {
            let count = state
                .registrations
                .iter()
                .filter(|r| r.topics.contains(topic))
                .count()
                + 1;
            if count > max && state.warned.insert(topic.clone()) {
                warn!(
                    flow = %self.name(),
                    topic = %topic,
                    listeners = count,
                    max_listeners = max,
                    "possible listener leak"
                );
            }
        }
    }

    pub(crate) fn register_stream(&self, topic: String, handler: Handler) {
        self.register(vec![topic], handler);
    }

    /// Wait for one entry of every named topic, dequeuing them.
    ///
    /// Resolves with the value for a single topic, or an object keyed by
    /// topic. Rejects with the flow's failure.
    pub fn consume(&self, topics: impl IntoTopics) -> Consume {
        let topics = topics.into_topics();
        let (tx, rx) = oneshot::channel();
        let label = topics.join(",");
        if topics.is_empty() || topics.iter().any(|t| t.is_empty() || t == WILDCARD_TOPIC) {
            let _ = tx.send(Err(FlowError::invalid_arguments(
                "consume needs one or more named topics",
            )));
        } else {
            self.register(topics, Handler::Once(Some(tx)));
        }
        Consume { topics: label, rx }
    }

    /// Invoke `callback` every time each named topic has a new entry.
    ///
    /// `"*"` observes every entry of every topic as `{"name", "data"}`.
    pub fn consume_each<F>(&self, topics: impl IntoTopics, callback: F) -> &Self
    where
        F: FnMut(Value, &Runtime) + Send + 'static,
    {
        let topics = topics.into_topics();
        let callback = Arc::new(Mutex::new(callback));
        if topics.len() == 1 && topics[0] == WILDCARD_TOPIC {
            self.register(topics, Handler::Wildcard(callback));
            return self;
        }
        let topics = self.checked_topics(topics, "consume_each");
        if !topics.is_empty() {
            self.register(topics, Handler::Each(callback));
        }
        self
    }

    /// Subscribe to the error channel
    pub fn catch<F>(&self, handler: F) -> &Self
    where
        F: FnMut(FlowError) + Send + 'static,
    {
        self.register(
            vec![ERROR_TOPIC.to_string()],
            Handler::Catch(Arc::new(Mutex::new(handler))),
        );
        self
    }

    pub fn state(&self) -> FlowSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&FlowSnapshot, &TopicStoreView<'_>) -> R) -> R {
        let state = self.inner.state.lock();
        let snapshot = state.snapshot();
        f(&snapshot, &TopicStoreView(&state.store))
    }

    /// The failure that terminated this flow, if any
    pub fn failure(&self) -> Option<FlowError> {
        self.inner.state.lock().failure.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failure.is_some()
    }

    /// A failure that no consumer received by the turn after it happened
    pub fn unhandled_failure(&self) -> Option<FlowError> {
        self.inner.state.lock().unhandled.clone()
    }

    fn watch_unhandled(&self, error: FlowError) {
        let weak = self.downgrade();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    if let Some(flow) = Flow::from_weak(&weak) {
                        flow.check_unhandled(error);
                    }
                });
            }
            Err(_) => self.check_unhandled(error),
        }
    }

    fn check_unhandled(&self, error: FlowError) {
        let mut state = self.inner.state.lock();
        // an importer observes and reports our failures as its own
        if state.failure_delivered || state.importers > 0 {
            return;
        }
        error!(flow = %self.name(), error = %error, "unhandled flow failure");
        state.unhandled = Some(error);
    }
}

/// Read-only access to topic history for sibling modules
pub(crate) struct TopicStoreView<'a>(&'a TopicStore);

impl TopicStoreView<'_> {
    pub fn has_data(&self, topic: &str) -> bool {
        self.0.has_data(topic)
    }
}

/// Future returned by [`Flow::consume`]
#[must_use = "futures do nothing unless awaited"]
pub struct Consume {
    topics: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl Consume {
    /// Topics this consumer waits for, comma joined
    pub fn topics(&self) -> &str {
        &self.topics
    }
}

impl Future for Consume {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(FlowError::Abandoned {
                    topics: this.topics.clone(),
                })
            })
        })
    }
}
