pub mod action;
pub mod behavior;

pub use action::{Action, ActionStatus};
pub use behavior::{Behavior, Child, Noop};
