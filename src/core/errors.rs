use thiserror::Error;

/// Unified error type for the flow engine.
///
/// Errors are values in this crate: a failure defined on a topic is stored in
/// the flow's history and handed to every error consumer, so the type is
/// `Clone` and carries rendered messages rather than boxed sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// An error value defined on a topic, or a failed producer/future
    #[error("{message}")]
    Defined { message: String },

    /// Malformed arguments passed to a flow or action operation
    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    /// Produced by the timeout monitor
    #[error(
        "Topic/s ({}) timed out, pending topics ({}), queue state {}",
        .topics.join(","),
        render_pending(.pending),
        .queue
    )]
    Timeout {
        topics: Vec<String>,
        pending: Vec<String>,
        queue: String,
    },

    /// Read attempted past the end-of-stream sentinel
    #[error("The reader({topic}) is already closed")]
    ClosedReader { topic: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The flow owning a pending consumer was dropped
    #[error("Flow dropped before topic/s ({topics}) resolved")]
    Abandoned { topics: String },
}

fn render_pending(pending: &[String]) -> String {
    if pending.is_empty() {
        "none".to_string()
    } else {
        pending.join(",")
    }
}

impl FlowError {
    /// Create a defined (user level) error
    pub fn defined<S: Into<String>>(message: S) -> Self {
        Self::Defined {
            message: message.into(),
        }
    }

    /// Create an invalid arguments error
    pub fn invalid_arguments<S: Into<String>>(message: S) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Create a closed reader error
    pub fn closed_reader<S: Into<String>>(topic: S) -> Self {
        Self::ClosedReader {
            topic: topic.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Defined { .. } => "defined",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::Timeout { .. } => "timeout",
            Self::ClosedReader { .. } => "closed_reader",
            Self::Configuration { .. } => "configuration",
            Self::Abandoned { .. } => "abandoned",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlowError>;

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FlowError>() {
            Ok(flow_err) => flow_err,
            Err(other) => Self::defined(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::defined(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defined_message_is_verbatim() {
        let err = FlowError::defined("Boom");
        assert_eq!(err.to_string(), "Boom");
        assert_eq!(err.category(), "defined");
    }

    #[test]
    fn test_timeout_rendering() {
        let err = FlowError::Timeout {
            topics: vec!["foo".into()],
            pending: vec![],
            queue: "{}".into(),
        };
        assert_eq!(
            err.to_string(),
            "Topic/s (foo) timed out, pending topics (none), queue state {}"
        );

        let err = FlowError::Timeout {
            topics: vec!["bar".into()],
            pending: vec!["bar:end".into(), "qaz".into()],
            queue: r#"{"foo":1}"#.into(),
        };
        assert_eq!(
            err.to_string(),
            r#"Topic/s (bar) timed out, pending topics (bar:end,qaz), queue state {"foo":1}"#
        );
    }

    #[test]
    fn test_closed_reader_names_topic() {
        assert_eq!(
            FlowError::closed_reader("topic").to_string(),
            "The reader(topic) is already closed"
        );
    }

    #[test]
    fn test_anyhow_round_trip_keeps_variant() {
        let err: anyhow::Error = FlowError::closed_reader("t").into();
        assert_eq!(FlowError::from(err), FlowError::closed_reader("t"));

        let err = anyhow::anyhow!("BOOM");
        assert_eq!(FlowError::from(err), FlowError::defined("BOOM"));
    }
}
