use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::behavior::{Behavior, Child, Noop};
use crate::core::config::FlowConfig;
use crate::core::errors::{FlowError, Result};
use crate::flow::flow::{Consume, Flow, FlowSnapshot};
use crate::flow::runtime::{CallerLocation, Runtime};
use crate::flow::types::{IntoTopics, Payload};
use crate::stream::{TopicReader, TopicStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Idle,
    /// Inside the behavior's `execute`
    Activated,
    /// `execute` returned and the children present then were activated
    Done,
}

struct ActionState {
    status: ActionStatus,
    children: Vec<Action>,
}

struct ActionInner {
    flow: Flow,
    behavior: Box<dyn Behavior>,
    state: Mutex<ActionState>,
    parent: Mutex<Weak<ActionInner>>,
}

/// A unit of work owning one flow, composable into a tree.
///
/// Activating an action runs its behavior once and then activates its
/// children, linking each child's flow with the parent's in both directions.
/// Actions with children need a Tokio runtime, since linked flows exchange
/// entries on the next scheduling turn; without one children still run but
/// their flows stay unlinked.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Default for Action {
    fn default() -> Self {
        Self::new(Noop)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("flow", &self.inner.flow.name())
            .field("behavior", &self.inner.behavior.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Action {
    pub fn new(behavior: impl Behavior + 'static) -> Self {
        Self::build(behavior, FlowConfig::unbounded())
    }

    pub fn with_config(behavior: impl Behavior + 'static, config: FlowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(behavior, config))
    }

    fn build(behavior: impl Behavior + 'static, config: FlowConfig) -> Self {
        let inner = ActionInner {
            flow: Flow::build(config),
            behavior: Box::new(behavior),
            state: Mutex::new(ActionState {
                status: ActionStatus::Idle,
                children: Vec::new(),
            }),
            parent: Mutex::new(Weak::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.inner.flow
    }

    /// Stamp the caller location handed to every callback of this action and
    /// of children that carry none
    pub fn at(&self, location: impl AsRef<str>) -> &Self {
        self.inner
            .flow
            .set_caller_location(Some(CallerLocation::new(location)));
        self
    }

    pub fn status(&self) -> ActionStatus {
        self.inner.state.lock().status
    }

    pub fn is_activated(&self) -> bool {
        self.status() != ActionStatus::Idle
    }

    /// The behavior ran to completion
    pub fn is_executed(&self) -> bool {
        self.status() == ActionStatus::Done
    }

    pub fn parent(&self) -> Option<Action> {
        self.inner.parent.lock().upgrade().map(|inner| Action { inner })
    }

    pub fn children(&self) -> Vec<Action> {
        self.inner.state.lock().children.clone()
    }

    pub fn ptr_eq(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_max_listeners(&self, max: usize) -> &Self {
        self.inner.flow.set_max_listeners(max);
        self
    }

    /// Add one child; see [`Action::add_all`]
    pub fn add(&self, child: impl Into<Child>) -> Result<&Self> {
        self.add_all([child.into()])
    }

    /// Add children in order.
    ///
    /// Fails without touching the tree if any of them was already activated.
    /// Children added to an activated parent are activated at once, or right
    /// after the parent's `execute` returns when added from inside it.
    pub fn add_all<I, C>(&self, children: I) -> Result<&Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Child>,
    {
        let children: Vec<Action> = children
            .into_iter()
            .map(|child| child.into().into_action())
            .collect();
        if children.iter().any(|child| child.is_activated()) {
            return Err(FlowError::invalid_arguments(
                "The action should not be in progress when it is added to the other action",
            ));
        }
        if children.iter().any(|child| child.ptr_eq(self)) {
            return Err(FlowError::invalid_arguments(
                "An action cannot be added to itself",
            ));
        }

        let activate_now = {
            let mut state = self.inner.state.lock();
            for child in &children {
                *child.inner.parent.lock() = Arc::downgrade(&self.inner);
                state.children.push(child.clone());
            }
            state.status == ActionStatus::Done
        };
        if activate_now {
            for child in &children {
                self.adopt(child);
            }
        }
        Ok(self)
    }

    /// Run the behavior, then activate every child. Activating twice is a no-op.
    pub fn activate(&self) -> &Self {
        {
            let mut state = self.inner.state.lock();
            if state.status != ActionStatus::Idle {
                return self;
            }
            state.status = ActionStatus::Activated;
        }
        debug!(
            action = %self.inner.flow.name(),
            behavior = %self.inner.behavior.name(),
            "activating"
        );
        self.inner.behavior.execute(self);

        let children = {
            let mut state = self.inner.state.lock();
            state.status = ActionStatus::Done;
            state.children.clone()
        };
        for child in &children {
            self.adopt(child);
        }
        self
    }

    fn adopt(&self, child: &Action) {
        let flow = &self.inner.flow;
        if child.inner.flow.caller_location().is_none() {
            child.inner.flow.set_caller_location(flow.caller_location());
        }
        flow.import(&child.inner.flow);
        debug!(action = %flow.name(), child = %child.inner.flow.name(), "child linked");
        child.activate();
    }

    pub fn runtime(&self) -> Runtime {
        self.inner.flow.runtime()
    }

    pub fn define(&self, topics: impl IntoTopics, payload: impl Into<Payload>) -> &Self {
        self.inner.flow.define(topics, payload);
        self
    }

    pub fn define_with<F, P>(&self, topics: impl IntoTopics, producer: F) -> &Self
    where
        F: FnOnce(&Runtime) -> P,
        P: Into<Payload>,
    {
        self.inner.flow.define_with(topics, producer);
        self
    }

    pub fn define_async<F, Fut>(&self, topics: impl IntoTopics, producer: F) -> &Self
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.flow.define_async(topics, producer);
        self
    }

    pub fn consume(&self, topics: impl IntoTopics) -> Consume {
        self.inner.flow.consume(topics)
    }

    pub fn consume_each<F>(&self, topics: impl IntoTopics, callback: F) -> &Self
    where
        F: FnMut(Value, &Runtime) + Send + 'static,
    {
        self.inner.flow.consume_each(topics, callback);
        self
    }

    pub fn catch<F>(&self, handler: F) -> &Self
    where
        F: FnMut(FlowError) + Send + 'static,
    {
        self.inner.flow.catch(handler);
        self
    }

    pub fn state(&self) -> FlowSnapshot {
        self.inner.flow.state()
    }

    pub fn consume_stream(&self, topic: impl Into<String>) -> TopicStream {
        self.inner.flow.consume_stream(topic)
    }

    pub fn reader(&self, topic: impl Into<String>) -> TopicReader {
        self.inner.flow.reader(topic)
    }

    pub fn timeout(&self, topics: impl IntoTopics, duration: Duration) -> &Self {
        self.inner.flow.timeout(topics, duration);
        self
    }
}
