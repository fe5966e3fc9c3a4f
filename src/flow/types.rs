//! Core types shared by the flow, its topic store and the adapters

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::errors::FlowError;

/// Reserved topic carrying the flow's failures
pub const ERROR_TOPIC: &str = "error";

/// Wildcard topic observing every entry of a flow
pub const WILDCARD_TOPIC: &str = "*";

/// Name of the companion topic defined when a stream completes
pub fn end_topic(topic: &str) -> String {
    format!("{}:end", topic)
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// One queued entry of a topic
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Value),
    Error(FlowError),
    /// End-of-stream marker, produced by defining `null`
    End,
}

impl Payload {
    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }

    /// Value handed to plain consumers: the end marker reads as `null`,
    /// an error as its message
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Data(value) => value.clone(),
            Payload::Error(err) => Value::String(err.to_string()),
            Payload::End => Value::Null,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        if value.is_null() {
            Payload::End
        } else {
            Payload::Data(value)
        }
    }
}

impl From<FlowError> for Payload {
    fn from(err: FlowError) -> Self {
        Payload::Error(err)
    }
}

impl From<anyhow::Error> for Payload {
    fn from(err: anyhow::Error) -> Self {
        Payload::Error(err.into())
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::End
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Data(Value::String(value.to_string()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Data(Value::String(value))
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Data(Value::Bool(value))
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Data(value.into())
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Data(value.into())
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Payload::Data(value.into())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::from(json!(value))
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Payload::End)
    }
}

/// An entry as recorded in a flow's history.
///
/// The id is global so a re-published entry is recognised by every flow it
/// reaches through import links.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub id: u64,
    pub topic: String,
    pub payload: Payload,
}

impl TopicEvent {
    /// Create an event with a fresh id; errors are routed to the error topic
    /// and non-error values defined on the error topic become errors
    pub fn new(topic: &str, payload: Payload) -> Self {
        let id = NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed);
        let (topic, payload) = match payload {
            Payload::Error(err) => (ERROR_TOPIC.to_string(), Payload::Error(err)),
            other if topic == ERROR_TOPIC => {
                let message = match other.to_value() {
                    Value::String(message) => message,
                    value => value.to_string(),
                };
                (topic.to_string(), Payload::Error(FlowError::defined(message)))
            }
            other => (topic.to_string(), other),
        };
        Self { id, topic, payload }
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_error()
    }

    /// `{name, data}` shape delivered to wildcard consumers
    pub fn to_wildcard_value(&self) -> Value {
        json!({
            "name": self.topic,
            "data": self.payload.to_value(),
        })
    }
}

/// Conversion into an ordered, de-duplicated topic list
pub trait IntoTopics {
    fn into_topics(self) -> Vec<String>;
}

fn dedup(topics: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        if !out.contains(&topic) {
            out.push(topic);
        }
    }
    out
}

impl IntoTopics for &str {
    fn into_topics(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoTopics for String {
    fn into_topics(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoTopics for &String {
    fn into_topics(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoTopics for Vec<String> {
    fn into_topics(self) -> Vec<String> {
        dedup(self)
    }
}

impl IntoTopics for Vec<&str> {
    fn into_topics(self) -> Vec<String> {
        dedup(self.into_iter().map(str::to_string))
    }
}

impl IntoTopics for &[&str] {
    fn into_topics(self) -> Vec<String> {
        dedup(self.iter().map(|t| t.to_string()))
    }
}

impl<const N: usize> IntoTopics for [&str; N] {
    fn into_topics(self) -> Vec<String> {
        dedup(self.iter().map(|t| t.to_string()))
    }
}
