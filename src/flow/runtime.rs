use std::fmt;
use std::sync::Arc;

use super::flow::{Consume, Flow};
use super::types::{IntoTopics, Payload};

/// Opaque tag naming where an action was invoked from.
///
/// The flow never interprets it; it is copied unchanged into every
/// [`Runtime`] handed to callbacks and producers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerLocation(Arc<str>);

impl CallerLocation {
    pub fn new(location: impl AsRef<str>) -> Self {
        Self(Arc::from(location.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Side-channel handle passed to consumer callbacks and producers
#[derive(Clone)]
pub struct Runtime {
    flow: Flow,
    location: Option<CallerLocation>,
}

impl Runtime {
    pub(crate) fn new(flow: Flow, location: Option<CallerLocation>) -> Self {
        Self { flow, location }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn caller_location(&self) -> Option<&CallerLocation> {
        self.location.as_ref()
    }

    pub fn define(&self, topics: impl IntoTopics, payload: impl Into<Payload>) -> &Flow {
        self.flow.define(topics, payload)
    }

    pub fn consume(&self, topics: impl IntoTopics) -> Consume {
        self.flow.consume(topics)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("flow", &self.flow.name())
            .field("location", &self.location)
            .finish()
    }
}

/// Handle emitting zero or more values onto fixed topics, possibly later
/// and from another task
#[derive(Clone)]
pub struct Publisher {
    flow: Flow,
    topics: Vec<String>,
}

impl Publisher {
    pub(crate) fn new(flow: Flow, topics: Vec<String>) -> Self {
        Self { flow, topics }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn publish(&self, payload: impl Into<Payload>) -> &Self {
        self.flow.define(self.topics.clone(), payload);
        self
    }

    /// Emit the end-of-stream marker
    pub fn end(&self) -> &Self {
        self.publish(Payload::End)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("flow", &self.flow.name())
            .field("topics", &self.topics)
            .finish()
    }
}
