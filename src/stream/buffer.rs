use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::core::errors::FlowError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BufferItem {
    Data(Value),
    End,
    Failed(FlowError),
}

impl BufferItem {
    fn is_terminal(&self) -> bool {
        !matches!(self, BufferItem::Data(_))
    }
}

#[derive(Default)]
struct BufferState {
    items: VecDeque<BufferItem>,
    /// A terminal item was pushed; nothing is accepted after it
    sealed: bool,
}

/// Append-only queue shared by a topic registration and the stream or
/// reader draining it
pub(crate) struct TopicBuffer {
    topic: String,
    state: Mutex<BufferState>,
    notify: Notify,
}

impl TopicBuffer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns false once sealed
    pub fn push(&self, item: BufferItem) -> bool {
        {
            let mut state = self.state.lock();
            if state.sealed {
                return false;
            }
            state.sealed = item.is_terminal();
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<BufferItem> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Wait for the next item
    pub async fn recv(&self) -> BufferItem {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            // a push between pop and here leaves a permit behind
            self.notify.notified().await;
        }
    }
}
