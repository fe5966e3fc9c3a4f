// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod action; // Action tree over linked flows
pub mod flow; // Topic coordinator
pub mod stream; // Stream and reader adapters

// Re-exports for convenience
pub use action::{Action, ActionStatus, Behavior, Child, Noop};
pub use crate::core::config::FlowConfig;
pub use crate::core::errors::{FlowError, Result};
pub use flow::{
    CallerLocation, Consume, Flow, FlowSnapshot, IntoTopics, Payload, Publisher, Runtime,
};
pub use stream::{TopicReader, TopicStream};

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
