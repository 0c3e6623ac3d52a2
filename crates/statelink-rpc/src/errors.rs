//! Router error taxonomy.

/// Malformed or unsupported envelope.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// Allowlist rejection or missing required field.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Handler or host operation failed.
pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
/// No handler registered for the operation.
pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
/// Handler exceeded its time budget.
pub const TIMEOUT: &str = "TIMEOUT";

/// Generic text shown to clients for execution failures.
pub const GENERIC_EXECUTION_MESSAGE: &str = "Operation failed";

/// Error produced while routing one inbound message.
///
/// None of these close the connection.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The envelope could not be parsed or has an unsupported type.
    #[error("{message}")]
    Protocol {
        /// What is wrong with the envelope.
        message: String,
    },

    /// The envelope is well-formed but fails policy or field checks.
    #[error("{message}")]
    Validation {
        /// Client-facing description.
        message: String,
    },

    /// A handler failed. `message` is logged, never sent to the client.
    #[error("{message}")]
    Execution {
        /// Internal description.
        message: String,
    },

    /// No handler for the requested operation.
    #[error("{message}")]
    NotFound {
        /// Client-facing description.
        message: String,
    },

    /// The handler did not finish in time.
    #[error("{message}")]
    Timeout {
        /// Client-facing description.
        message: String,
    },
}

impl RouterError {
    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => PROTOCOL_ERROR,
            Self::Validation { .. } => VALIDATION_ERROR,
            Self::Execution { .. } => EXECUTION_ERROR,
            Self::NotFound { .. } => HANDLER_NOT_FOUND,
            Self::Timeout { .. } => TIMEOUT,
        }
    }

    /// Message safe to put in a response `error` field.
    pub fn client_message(&self) -> String {
        sanitize_error_message(self)
    }
}

/// Strip internal details from execution failures.
pub fn sanitize_error_message(err: &RouterError) -> String {
    match err {
        RouterError::Protocol { message }
        | RouterError::Validation { message }
        | RouterError::NotFound { message }
        | RouterError::Timeout { message } => message.clone(),
        RouterError::Execution { .. } => GENERIC_EXECUTION_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(RouterError::protocol("x").code(), PROTOCOL_ERROR);
        assert_eq!(RouterError::validation("x").code(), VALIDATION_ERROR);
        assert_eq!(RouterError::execution("x").code(), EXECUTION_ERROR);
    }

    #[test]
    fn execution_details_not_leaked() {
        let err = RouterError::execution("open /home/me/.ssh/id_rsa: permission denied");
        assert_eq!(err.client_message(), GENERIC_EXECUTION_MESSAGE);
        assert!(err.to_string().contains("id_rsa"));
    }

    #[test]
    fn validation_message_preserved() {
        let err = RouterError::validation("Command validation failed: 'rm' is not allowed");
        assert_eq!(err.client_message(), "Command validation failed: 'rm' is not allowed");
    }
}
