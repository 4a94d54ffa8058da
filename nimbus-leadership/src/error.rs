//! Error types for leadership election and leader discovery

use std::time::Duration;

/// Errors that can occur during election or membership resolution
#[derive(Debug, thiserror::Error)]
pub enum LeadershipError {
    /// Coordination service unreachable or session lost
    #[error("Connection error: {message}")]
    Connection {
        /// What failed
        message: String,
    },

    /// Path or permission failure reported by the coordination service
    #[error("Coordination error at {path}: {message}")]
    Coordination {
        /// The node path the operation targeted
        path: String,
        /// What failed
        message: String,
    },

    /// Node vanished, usually because its owner disconnected
    #[error("Node not found: {path}")]
    NotFound {
        /// The missing node path
        path: String,
    },

    /// Non-sequential node already exists
    #[error("Node already exists: {path}")]
    AlreadyExists {
        /// The colliding node path
        path: String,
    },

    /// Contender payload is not a `host:port` address
    #[error("Malformed address {input:?}: {reason}")]
    MalformedAddress {
        /// The offending payload, lossily decoded
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// API misuse, such as acquiring twice
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The attempted operation
        operation: &'static str,
        /// The engine state at the time
        state: String,
    },

    /// Bounded wait for leadership exceeded
    #[error("Timed out after {waited:?} waiting for leadership")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },
}

impl LeadershipError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a coordination error for a path
    pub fn coordination(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Coordination {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error for a path
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a malformed-address error
    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<figment::Error> for LeadershipError {
    fn from(error: figment::Error) -> Self {
        Self::config(error.to_string())
    }
}

/// Result type for leadership operations
pub type Result<T> = std::result::Result<T, LeadershipError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_leadership_error_display() {
        let err = LeadershipError::not_found("/storm/nimbus/leadership/lock-0000000001");
        assert_eq!(
            format!("{}", err),
            "Node not found: /storm/nimbus/leadership/lock-0000000001"
        );

        let err = LeadershipError::InvalidState {
            operation: "acquire leadership",
            state: "Leader".to_string(),
        };
        assert_eq!(format!("{}", err), "Cannot acquire leadership while Leader");
    }

    #[test]
    fn test_leadership_error_source() {
        let err = LeadershipError::connection("session expired");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LeadershipError::connection("gone").is_retryable());
        assert!(LeadershipError::Timeout {
            waited: Duration::from_millis(5)
        }
        .is_retryable());

        assert!(!LeadershipError::coordination("/a", "no auth").is_retryable());
        assert!(!LeadershipError::not_found("/a").is_retryable());
        assert!(!LeadershipError::malformed("x", "no port").is_retryable());
        assert!(!LeadershipError::config("empty").is_retryable());
    }

    #[test]
    fn test_all_error_variants_display() {
        let exists = LeadershipError::AlreadyExists {
            path: "/a".to_string(),
        };
        assert!(format!("{}", exists).contains("already exists"));

        let malformed = LeadershipError::malformed("nimbus", "missing ':'");
        assert!(format!("{}", malformed).contains("\"nimbus\""));

        let timeout = LeadershipError::Timeout {
            waited: Duration::from_secs(2),
        };
        assert!(format!("{}", timeout).contains("Timed out"));

        let coordination = LeadershipError::coordination("/storm", "not authorized");
        assert!(format!("{}", coordination).contains("/storm"));
    }
}
