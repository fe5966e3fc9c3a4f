//! Stream and reader adapters: push and pull views over one topic, both
//! backed by the same append-only buffer

pub(crate) mod buffer;
pub mod reader;
pub mod sink;

pub use reader::TopicReader;
pub use sink::TopicStream;
