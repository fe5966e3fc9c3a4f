//! Push-style view of a topic
//!
//! Entries land in a [`TopicBuffer`] as soon as they are defined and stay
//! there until a data listener is attached. End fires once, after every
//! buffered value, and defines the companion `<topic>:end` topic; until then
//! the flow reports `<topic>:end` as pending. A stream whose handles are all
//! dropped with no listener attached stops buffering.

use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::buffer::{BufferItem, TopicBuffer};
use crate::core::errors::FlowError;
use crate::flow::flow::{Flow, FlowInner};
use crate::flow::registration::Handler;
use crate::flow::types::{end_topic, Payload};

type DataListener = Arc<Mutex<dyn FnMut(Value) + Send>>;
type EndListener = Box<dyn FnOnce() + Send>;
type ErrorListener = Box<dyn FnOnce(FlowError) + Send>;

#[derive(Default)]
struct Listeners {
    data: Option<DataListener>,
    end: Vec<EndListener>,
    error: Vec<ErrorListener>,
    finished: bool,
    ended: bool,
    failure: Option<FlowError>,
}

pub(crate) struct StreamShared {
    buffer: TopicBuffer,
    listeners: Mutex<Listeners>,
    flushing: AtomicBool,
    flow: Weak<FlowInner>,
}

impl StreamShared {
    fn new(topic: &str, flow: &Flow) -> Self {
        Self {
            buffer: TopicBuffer::new(topic),
            listeners: Mutex::new(Listeners::default()),
            flushing: AtomicBool::new(false),
            flow: flow.downgrade(),
        }
    }

    pub fn buffer(&self) -> &TopicBuffer {
        &self.buffer
    }

    pub fn is_finished(&self) -> bool {
        self.listeners.lock().finished
    }

    pub fn has_listeners(&self) -> bool {
        let listeners = self.listeners.lock();
        listeners.data.is_some() || !listeners.end.is_empty() || !listeners.error.is_empty()
    }

    /// Deliver buffered items to the listeners; a no-op until a data listener
    /// is attached, or while another flush runs
    pub fn flush(&self) {
        loop {
            if self.flushing.swap(true, Ordering::AcqRel) {
                return;
            }
            self.drain();
            self.flushing.store(false, Ordering::Release);
            // items pushed while we were finishing up
            if self.buffer.is_empty() || !self.is_listening() {
                return;
            }
        }
    }

    fn is_listening(&self) -> bool {
        let listeners = self.listeners.lock();
        listeners.data.is_some() && !listeners.finished
    }

    fn drain(&self) {
        loop {
            let listener = {
                let listeners = self.listeners.lock();
                if listeners.finished {
                    return;
                }
                match &listeners.data {
                    Some(listener) => listener.clone(),
                    None => return,
                }
            };
            match self.buffer.pop() {
                None => return,
                Some(BufferItem::Data(value)) => {
                    let mut listener = listener.lock();
                    (*listener)(value);
                }
                Some(BufferItem::End) => {
                    self.finish_end();
                    return;
                }
                Some(BufferItem::Failed(error)) => {
                    self.finish_error(error, true);
                    return;
                }
            }
        }
    }

    fn finish_end(&self) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if listeners.finished {
                return;
            }
            listeners.finished = true;
            listeners.ended = true;
            listeners.error.clear();
            std::mem::take(&mut listeners.end)
        };
        for listener in listeners {
            listener();
        }
        self.define_end();
    }

    fn finish_error(&self, error: FlowError, announce: bool) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if listeners.finished {
                return;
            }
            listeners.finished = true;
            listeners.failure = Some(error.clone());
            listeners.end.clear();
            std::mem::take(&mut listeners.error)
        };
        debug!(topic = %self.buffer.topic(), error = %error, "stream failed");
        for listener in listeners {
            listener(error.clone());
        }
        if announce {
            self.define_end();
        }
    }

    fn define_end(&self) {
        if let Some(flow) = Flow::from_weak(&self.flow) {
            flow.define(end_topic(self.buffer.topic()), Payload::End);
        }
    }
}

/// Push sink over one topic, created by [`Flow::consume_stream`]
#[derive(Clone)]
pub struct TopicStream {
    shared: Arc<StreamShared>,
}

impl TopicStream {
    pub fn topic(&self) -> &str {
        self.shared.buffer.topic()
    }

    /// Attach the data listener, replacing any previous one, and deliver
    /// everything buffered so far
    pub fn on_data<F>(&self, listener: F) -> &Self
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.shared.listeners.lock().data = Some(Arc::new(Mutex::new(listener)));
        self.shared.flush();
        self
    }

    /// End listener; called at once if the stream already ended
    pub fn on_end<F>(&self, listener: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let ended = {
            let mut listeners = self.shared.listeners.lock();
            if !listeners.finished {
                listeners.end.push(Box::new(listener));
                return self;
            }
            listeners.ended
        };
        if ended {
            listener();
        }
        self
    }

    /// Error listener; called at once if the stream already failed
    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(FlowError) + Send + 'static,
    {
        let failure = {
            let mut listeners = self.shared.listeners.lock();
            if !listeners.finished {
                listeners.error.push(Box::new(listener));
                return self;
            }
            listeners.failure.clone()
        };
        if let Some(error) = failure {
            listener(error);
        }
        self
    }

    /// Fail the sink independently of its topic: error listeners fire and
    /// `<topic>:end` is defined, end listeners never fire
    pub fn fail(&self, error: FlowError) {
        self.shared.buffer.push(BufferItem::Failed(error.clone()));
        self.shared.finish_error(error, true);
    }

    /// Entries received but not yet delivered
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }
}

impl fmt::Debug for TopicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicStream")
            .field("topic", &self.topic())
            .field("buffered", &self.buffered())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Flow {
    /// Push-style view of `topic`, replaying its history first
    pub fn consume_stream(&self, topic: impl Into<String>) -> TopicStream {
        let topic = topic.into();
        let shared = Arc::new(StreamShared::new(&topic, self));
        if self.checked_topics(topic.as_str(), "consume_stream").is_empty() {
            shared.finish_error(
                FlowError::invalid_arguments("consume_stream needs a named topic"),
                false,
            );
        } else {
            self.register_stream(topic, Handler::Stream(shared.clone()));
        }
        TopicStream { shared }
    }

    /// Chainable form of [`Flow::consume_stream`]
    pub fn with_stream<F>(&self, topic: impl Into<String>, attach: F) -> &Self
    where
        F: FnOnce(TopicStream),
    {
        attach(self.consume_stream(topic));
        self
    }
}
