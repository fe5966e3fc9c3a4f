use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::flow::Flow;
use super::types::{IntoTopics, ERROR_TOPIC};
use crate::core::errors::FlowError;

impl Flow {
    /// Race the named topics against a deadline.
    ///
    /// If any of them still has no entry when `duration` elapses, a
    /// [`FlowError::Timeout`] describing the flow's state fails the flow. The
    /// monitor stops as soon as every topic resolved or the flow failed;
    /// producers still running are not cancelled. Needs a Tokio runtime;
    /// without one no monitor is started.
    pub fn timeout(&self, topics: impl IntoTopics, duration: Duration) -> &Self {
        let topics = self.checked_topics(topics, "timeout");
        if topics.is_empty() {
            return self;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(flow = %self.name(), topics = %topics.join(","), "no Tokio runtime, timeout not armed");
            return self;
        };
        let flow = self.clone();
        handle.spawn(async move { flow.monitor(topics, duration).await });
        self
    }

    async fn monitor(self, topics: Vec<String>, duration: Duration) {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.is_failed() {
                return;
            }
            if self.unresolved(&topics).is_empty() {
                debug!(flow = %self.name(), topics = %topics.join(","), "timeout cancelled, topics resolved");
                return;
            }
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut settled => {}
            }
        }

        let error = self.timeout_error(&topics);
        warn!(flow = %self.name(), error = %error, "topics timed out");
        self.define(ERROR_TOPIC, error);
    }

    fn unresolved(&self, topics: &[String]) -> Vec<String> {
        self.with_state(|_, store| {
            topics
                .iter()
                .filter(|t| !store.has_data(t))
                .cloned()
                .collect()
        })
    }

    fn timeout_error(&self, topics: &[String]) -> FlowError {
        self.with_state(|snapshot, store| {
            let timed_out = topics
                .iter()
                .filter(|t| !store.has_data(t))
                .cloned()
                .collect();
            let pending = snapshot
                .pending
                .iter()
                .filter(|t| !topics.contains(t))
                .cloned()
                .collect();
            let queue =
                serde_json::to_string(&snapshot.queue).unwrap_or_else(|_| "{}".to_string());
            FlowError::Timeout {
                topics: timed_out,
                pending,
                queue,
            }
        })
    }
}
