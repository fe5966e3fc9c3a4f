pub mod flow;
pub mod producer;
pub(crate) mod registration;
pub mod runtime;
pub(crate) mod store;
pub mod timeout;
pub mod types;

pub use flow::{Consume, Flow, FlowSnapshot};
pub use runtime::{CallerLocation, Publisher, Runtime};
pub use types::{end_topic, IntoTopics, Payload, TopicEvent, ERROR_TOPIC, WILDCARD_TOPIC};
