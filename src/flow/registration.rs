//! Consumer registrations and the jobs they produce
//!
//! Registrations never run user code. Polling one against the topic store
//! only turns newly satisfied requirements into [`Job`]s; the flow runs those
//! jobs after releasing its state lock, one at a time and in FIFO order.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use super::flow::Flow;
use super::runtime::Runtime;
use super::store::TopicStore;
use super::types::{end_topic, Payload, ERROR_TOPIC};
use crate::core::errors::{FlowError, Result};
use crate::stream::buffer::{BufferItem, TopicBuffer};
use crate::stream::sink::StreamShared;

pub(crate) type EachCallback = Arc<Mutex<dyn FnMut(Value, &Runtime) + Send>>;
pub(crate) type CatchCallback = Arc<Mutex<dyn FnMut(FlowError) + Send>>;
pub(crate) type Resolver = oneshot::Sender<Result<Value>>;

pub(crate) enum Handler {
    /// Callback fired once per round of satisfied topics
    Each(EachCallback),
    /// Callback fired for every entry on every topic
    Wildcard(EachCallback),
    /// Error channel subscriber
    Catch(CatchCallback),
    /// One-shot consumer that dequeues
    Once(Option<Resolver>),
    Stream(Arc<StreamShared>),
    /// Dropped together with the reader
    Reader(Weak<TopicBuffer>),
}

impl Handler {
    /// Nothing can observe what this handler would deliver anymore
    fn is_abandoned(&self) -> bool {
        match self {
            Handler::Once(resolver) => resolver.as_ref().map_or(true, |r| r.is_closed()),
            // the registration holds the only handle and no listener is attached
            Handler::Stream(stream) => Arc::strong_count(stream) == 1 && !stream.has_listeners(),
            Handler::Reader(buffer) => buffer.strong_count() == 0,
            _ => false,
        }
    }
}

pub(crate) enum Job {
    Each { callback: EachCallback, value: Value },
    Catch { callback: CatchCallback, error: FlowError },
    Resolve { resolver: Resolver, result: Result<Value> },
    Flush(Arc<StreamShared>),
}

impl Job {
    pub fn run(self, flow: &Flow) {
        match self {
            Job::Each { callback, value } => {
                let runtime = flow.runtime();
                let mut callback = callback.lock();
                (*callback)(value, &runtime);
            }
            Job::Catch { callback, error } => {
                let mut callback = callback.lock();
                (*callback)(error);
            }
            Job::Resolve { resolver, result } => {
                // receiver may already be gone
                let _ = resolver.send(result);
            }
            Job::Flush(stream) => stream.flush(),
        }
    }
}

pub(crate) struct Registration {
    pub id: u64,
    pub topics: Vec<String>,
    cursors: Vec<usize>,
    handler: Handler,
    done: bool,
}

fn collect(topics: &[String], values: Vec<Value>) -> Value {
    if topics.len() == 1 {
        return values.into_iter().next().unwrap_or(Value::Null);
    }
    let mut map = Map::new();
    for (topic, value) in topics.iter().zip(values) {
        map.insert(topic.clone(), value);
    }
    Value::Object(map)
}

impl Registration {
    pub fn new(id: u64, topics: Vec<String>, handler: Handler) -> Self {
        let cursors = vec![0; topics.len()];
        Self {
            id,
            topics,
            cursors,
            handler,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_once(&self) -> bool {
        matches!(self.handler, Handler::Once(_))
    }

    /// Turn whatever the store can satisfy now into jobs.
    ///
    /// Returns true when an error entry was handed to this registration.
    pub fn poll(&mut self, store: &mut TopicStore, jobs: &mut VecDeque<Job>) -> bool {
        if self.done {
            return false;
        }
        if self.handler.is_abandoned() {
            self.done = true;
            return false;
        }
        match &mut self.handler {
            Handler::Each(callback) => {
                let mut delivered_error = false;
                while self
                    .topics
                    .iter()
                    .zip(&self.cursors)
                    .all(|(topic, cursor)| *cursor < store.len(topic))
                {
                    let mut values = Vec::with_capacity(self.topics.len());
                    for (topic, cursor) in self.topics.iter().zip(self.cursors.iter_mut()) {
                        if let Some(payload) = store.entry(topic, *cursor) {
                            delivered_error |= payload.is_error();
                            values.push(payload.to_value());
                        }
                        *cursor += 1;
                    }
                    jobs.push_back(Job::Each {
                        callback: callback.clone(),
                        value: collect(&self.topics, values),
                    });
                }
                delivered_error
            }
            Handler::Wildcard(callback) => {
                let mut delivered_error = false;
                let log = store.log();
                while self.cursors[0] < log.len() {
                    let event = &log[self.cursors[0]];
                    delivered_error |= event.is_error();
                    jobs.push_back(Job::Each {
                        callback: callback.clone(),
                        value: event.to_wildcard_value(),
                    });
                    self.cursors[0] += 1;
                }
                delivered_error
            }
            Handler::Catch(callback) => {
                let mut delivered_error = false;
                while let Some(payload) = store.entry(ERROR_TOPIC, self.cursors[0]) {
                    if let Payload::Error(error) = payload {
                        jobs.push_back(Job::Catch {
                            callback: callback.clone(),
                            error: error.clone(),
                        });
                        delivered_error = true;
                    }
                    self.cursors[0] += 1;
                }
                delivered_error
            }
            Handler::Once(resolver) => {
                if !self.topics.iter().all(|topic| store.available(topic) > 0) {
                    return false;
                }
                let payloads: Vec<Payload> = self
                    .topics
                    .iter()
                    .filter_map(|topic| store.take(topic))
                    .collect();
                let delivered_error = payloads.iter().any(Payload::is_error);
                let values = payloads.iter().map(Payload::to_value).collect();
                if let Some(resolver) = resolver.take() {
                    jobs.push_back(Job::Resolve {
                        resolver,
                        result: Ok(collect(&self.topics, values)),
                    });
                }
                self.done = true;
                delivered_error
            }
            Handler::Stream(stream) => {
                let (pushed, ended) =
                    feed(stream.buffer(), &self.topics[0], &mut self.cursors[0], store);
                if pushed {
                    jobs.push_back(Job::Flush(stream.clone()));
                }
                // stays pending until the end reaches the listeners
                self.done = stream.is_finished();
                false
            }
            Handler::Reader(buffer) => {
                if let Some(buffer) = buffer.upgrade() {
                    let (_, ended) = feed(&buffer, &self.topics[0], &mut self.cursors[0], store);
                    self.done = ended;
                }
                false
            }
        }
    }

    /// Deliver a flow failure to registrations that would otherwise wait forever.
    ///
    /// Returns true when the failure reached a consumer.
    pub fn fail(&mut self, error: &FlowError, jobs: &mut VecDeque<Job>) -> bool {
        if self.done {
            return false;
        }
        if self.handler.is_abandoned() {
            self.done = true;
            return false;
        }
        match &mut self.handler {
            // waiting on the error channel itself: the failure arrives as data
            Handler::Once(_) if self.topics.iter().any(|t| t == ERROR_TOPIC) => false,
            Handler::Once(resolver) => {
                self.done = true;
                match resolver.take() {
                    Some(resolver) => {
                        jobs.push_back(Job::Resolve {
                            resolver,
                            result: Err(error.clone()),
                        });
                        true
                    }
                    None => false,
                }
            }
            Handler::Stream(stream) => {
                self.done = true;
                if stream.buffer().push(BufferItem::Failed(error.clone())) {
                    jobs.push_back(Job::Flush(stream.clone()));
                }
                false
            }
            Handler::Reader(buffer) => {
                self.done = true;
                buffer
                    .upgrade()
                    .is_some_and(|buffer| buffer.push(BufferItem::Failed(error.clone())))
            }
            _ => false,
        }
    }

    /// Names reported by `state().pending` for this registration
    pub fn pending_keys(&self, store: &TopicStore) -> Vec<String> {
        if self.done || self.handler.is_abandoned() {
            return Vec::new();
        }
        let unresolved = |topic: &String| topic != ERROR_TOPIC && !store.has_data(topic);
        match &self.handler {
            Handler::Each(_) | Handler::Once(_) => {
                self.topics.iter().filter(|t| unresolved(t)).cloned().collect()
            }
            Handler::Stream(_) | Handler::Reader(_) => {
                let topic = &self.topics[0];
                // `<topic>:end` resolves once the stream finishes, not when the
                // marker is buffered
                let mut keys = vec![end_topic(topic)];
                if unresolved(topic) {
                    keys.push(topic.clone());
                }
                keys
            }
            Handler::Wildcard(_) | Handler::Catch(_) => Vec::new(),
        }
    }
}

/// Copy unseen entries of `topic` into a stream/reader buffer.
///
/// Returns (anything pushed, end marker reached).
fn feed(
    buffer: &TopicBuffer,
    topic: &str,
    cursor: &mut usize,
    store: &TopicStore,
) -> (bool, bool) {
    let mut pushed = false;
    while let Some(payload) = store.entry(topic, *cursor) {
        *cursor += 1;
        let item = match payload {
            Payload::Data(value) => BufferItem::Data(value.clone()),
            Payload::End => BufferItem::End,
            // errors never land on a data topic
            Payload::Error(error) => BufferItem::Failed(error.clone()),
        };
        let terminal = !matches!(item, BufferItem::Data(_));
        pushed |= buffer.push(item);
        if terminal || buffer.is_sealed() {
            return (pushed, true);
        }
    }
    (pushed, buffer.is_sealed())
}
