//! Producer forms of `define`: closures, futures and publishers

use serde_json::Value;
use std::future::Future;
use tokio::runtime::Handle;
use tracing::warn;

use super::flow::Flow;
use super::runtime::{Publisher, Runtime};
use super::types::{IntoTopics, Payload};
use crate::core::errors::FlowError;

impl Flow {
    /// Define the value returned by `producer`
    pub fn define_with<F, P>(&self, topics: impl IntoTopics, producer: F) -> &Self
    where
        F: FnOnce(&Runtime) -> P,
        P: Into<Payload>,
    {
        let payload = producer(&self.runtime()).into();
        self.define(topics, payload)
    }

    /// Define the output of `future` once it completes; an `Err` fails the flow.
    ///
    /// Needs a Tokio runtime; without one the flow fails with a
    /// configuration error instead.
    pub fn define_future<Fut>(&self, topics: impl IntoTopics, future: Fut) -> &Self
    where
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let publisher = self.publisher(topics);
        let Ok(handle) = Handle::try_current() else {
            warn!(flow = %self.name(), "no Tokio runtime to drive the producer");
            publisher.publish(Payload::Error(FlowError::configuration(
                "define_future needs a Tokio runtime",
            )));
            return self;
        };
        handle.spawn(async move {
            let payload = match future.await {
                Ok(value) => Payload::from(value),
                Err(err) => Payload::Error(FlowError::from(err)),
            };
            publisher.publish(payload);
        });
        self
    }

    /// Start an async producer with this flow's runtime handle
    pub fn define_async<F, Fut>(&self, topics: impl IntoTopics, producer: F) -> &Self
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let future = producer(self.runtime());
        self.define_future(topics, future)
    }

    /// Hand a [`Publisher`] to `producer`, which may emit any number of values
    /// now or later
    pub fn define_publisher<F>(&self, topics: impl IntoTopics, producer: F) -> &Self
    where
        F: FnOnce(Publisher, &Runtime),
    {
        producer(self.publisher(topics), &self.runtime());
        self
    }

    pub fn publisher(&self, topics: impl IntoTopics) -> Publisher {
        let topics = self.checked_topics(topics, "publisher");
        Publisher::new(self.clone(), topics)
    }
}
