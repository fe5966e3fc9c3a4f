use futures::stream::{self, Stream};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::buffer::{BufferItem, TopicBuffer};
use crate::core::errors::{FlowError, Result};
use crate::flow::flow::Flow;
use crate::flow::registration::Handler;

/// Pull-style cursor over one topic, created by [`Flow::reader`]
pub struct TopicReader {
    buffer: Arc<TopicBuffer>,
    closed: bool,
}

impl TopicReader {
    pub fn topic(&self) -> &str {
        self.buffer.topic()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next entry of the topic.
    ///
    /// `Ok(None)` marks the end of the topic and is returned once; reading
    /// further fails with [`FlowError::ClosedReader`].
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.closed {
            return Err(FlowError::closed_reader(self.buffer.topic()));
        }
        match self.buffer.recv().await {
            BufferItem::Data(value) => Ok(Some(value)),
            BufferItem::End => {
                self.closed = true;
                Ok(None)
            }
            BufferItem::Failed(error) => {
                self.closed = true;
                Err(error)
            }
        }
    }

    /// Adapt into a [`Stream`] ending at the end marker or after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        stream::unfold(self, |mut reader| async move {
            if reader.closed {
                return None;
            }
            match reader.next().await {
                Ok(Some(value)) => Some((Ok(value), reader)),
                Ok(None) => None,
                Err(error) => Some((Err(error), reader)),
            }
        })
    }
}

impl fmt::Debug for TopicReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicReader")
            .field("topic", &self.topic())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Flow {
    /// Pull-style view of `topic`, starting from its first entry
    pub fn reader(&self, topic: impl Into<String>) -> TopicReader {
        let topic = topic.into();
        let buffer = Arc::new(TopicBuffer::new(topic.as_str()));
        if self.checked_topics(topic.as_str(), "reader").is_empty() {
            buffer.push(BufferItem::Failed(FlowError::invalid_arguments(
                "reader needs a named topic",
            )));
        } else {
            self.register_stream(topic, Handler::Reader(Arc::downgrade(&buffer)));
        }
        TopicReader {
            buffer,
            closed: false,
        }
    }
}
