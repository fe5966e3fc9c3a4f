//! Pluggable activation behavior
//!
//! An action does its work in [`Behavior::execute`], called exactly once on
//! activation. Closures taking the action implement the trait, so small
//! actions need no named type.

use std::sync::Arc;

use super::action::Action;
use crate::flow::flow::Flow;

/// Work run once when an action is activated
pub trait Behavior: Send + Sync {
    /// Define topics, register consumers or add children on `action`
    fn execute(&self, action: &Action);

    /// Label used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Behavior for F
where
    F: Fn(&Action) + Send + Sync,
{
    fn execute(&self, action: &Action) {
        self(action)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Does nothing: the action is done as soon as it activates
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl Behavior for Noop {
    fn execute(&self, _action: &Action) {}

    fn name(&self) -> &str {
        "noop"
    }
}

/// Behavior of an inline child added as a plain function of the flow
pub(crate) struct FlowFn(pub Arc<dyn Fn(&Flow) + Send + Sync>);

impl Behavior for FlowFn {
    fn execute(&self, action: &Action) {
        (self.0)(action.flow())
    }

    fn name(&self) -> &str {
        "function"
    }
}

/// Anything [`Action::add`] accepts
pub enum Child {
    Action(Action),
    Function(Arc<dyn Fn(&Flow) + Send + Sync>),
}

impl Child {
    /// Inline child running `f` against its own flow on activation
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Flow) + Send + Sync + 'static,
    {
        Child::Function(Arc::new(f))
    }

    pub(crate) fn into_action(self) -> Action {
        match self {
            Child::Action(action) => action,
            Child::Function(f) => Action::new(FlowFn(f)),
        }
    }
}

impl From<Action> for Child {
    fn from(action: Action) -> Self {
        Child::Action(action)
    }
}

impl From<&Action> for Child {
    fn from(action: &Action) -> Self {
        Child::Action(action.clone())
    }
}
