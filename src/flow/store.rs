//! Topic store: per-flow mapping from topic name to its queued entries
//!
//! History is append-only. Observers (callbacks, streams, readers, wildcard)
//! keep their own cursors into it; one-shot consumers dequeue through a
//! shared per-topic `taken` cursor, which is what `queue` counts report.

use std::collections::{BTreeMap, HashMap};

use super::types::{Payload, TopicEvent};

#[derive(Debug, Default)]
struct Topic {
    entries: Vec<Payload>,
    taken: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TopicStore {
    topics: HashMap<String, Topic>,
    log: Vec<TopicEvent>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics are created lazily on first define or registration
    pub fn touch(&mut self, topic: &str) {
        self.topics.entry(topic.to_string()).or_default();
    }

    pub fn append(&mut self, event: TopicEvent) {
        self.topics
            .entry(event.topic.clone())
            .or_default()
            .entries
            .push(event.payload.clone());
        self.log.push(event);
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.entries.len())
    }

    pub fn has_data(&self, topic: &str) -> bool {
        self.len(topic) > 0
    }

    pub fn entry(&self, topic: &str, index: usize) -> Option<&Payload> {
        self.topics.get(topic).and_then(|t| t.entries.get(index))
    }

    /// Entries not yet dequeued by a one-shot consumer
    pub fn available(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |t| t.entries.len() - t.taken)
    }

    pub fn take(&mut self, topic: &str) -> Option<Payload> {
        let topic = self.topics.get_mut(topic)?;
        let payload = topic.entries.get(topic.taken)?.clone();
        topic.taken += 1;
        Some(payload)
    }

    /// Every event in define order, across topics
    pub fn log(&self) -> &[TopicEvent] {
        &self.log
    }

    /// topic -> count of entries not yet dequeued, for non-empty topics only
    pub fn queue_counts(&self) -> BTreeMap<String, usize> {
        self.topics
            .iter()
            .filter_map(|(name, topic)| {
                let count = topic.entries.len() - topic.taken;
                (count > 0).then(|| (name.clone(), count))
            })
            .collect()
    }
}
