use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default diagnostic ceiling of registrations per topic on a plain flow
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Configuration for a single flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Label used in log fields
    pub name: String,
    /// Registrations per topic above which a warning is logged, 0 disables
    pub max_listeners: usize,
    /// Opaque caller location handed to every callback through the runtime handle
    pub caller_location: Option<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            name: format!("flow_{}", Uuid::new_v4()),
            max_listeners: DEFAULT_MAX_LISTENERS,
            caller_location: None,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlowError::configuration("name must not be empty"));
        }
        if let Some(location) = &self.caller_location {
            if location.is_empty() {
                return Err(FlowError::configuration(
                    "caller_location must not be empty when set",
                ));
            }
        }
        Ok(())
    }

    /// Configuration used by actions: no listener ceiling
    pub fn unbounded() -> Self {
        Self {
            name: format!("action_{}", Uuid::new_v4()),
            max_listeners: 0,
            caller_location: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_listeners(mut self, max_listeners: usize) -> Self {
        self.max_listeners = max_listeners;
        self
    }

    pub fn with_caller_location(mut self, location: impl Into<String>) -> Self {
        self.caller_location = Some(location.into());
        self
    }
}
