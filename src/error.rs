//! Error types for Cryostat
//!
//! This module defines the error taxonomy shared by discovery, the match
//! expression pipeline, the rule registry and the rule processor, using
//! `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Classification of a failure reported by the target session service.
///
/// Only authentication, TLS and service-type failures are considered
/// permanent for a scheduled task; everything else is retried at the next
/// firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFailureKind {
    /// Credentials were missing or rejected by the target
    Authentication,
    /// TLS handshake or certificate verification failed
    Ssl,
    /// The target is not a service this system can manage
    ServiceType,
    /// The target could not be reached
    Connection,
    /// Anything the session service did not classify
    Other,
}

impl SessionFailureKind {
    /// Returns true for failure classes that deactivate a periodic task
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SessionFailureKind::Authentication
                | SessionFailureKind::Ssl
                | SessionFailureKind::ServiceType
        )
    }
}

impl std::fmt::Display for SessionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionFailureKind::Authentication => "authentication",
            SessionFailureKind::Ssl => "ssl",
            SessionFailureKind::ServiceType => "service-type",
            SessionFailureKind::Connection => "connection",
            SessionFailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Main error type for Cryostat operations
#[derive(Error, Debug)]
pub enum CryostatError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A match expression contains a construct outside the allowed grammar.
    /// Terminal: never retried.
    #[error("Illegal match expression: {0}")]
    IllegalExpression(String),

    /// Rule fields violate construction constraints
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// A match expression failed or produced a non-boolean at run time
    #[error("Match expression evaluation failed: {0}")]
    Evaluation(String),

    /// A rule with the same name is already registered
    #[error("Rule already exists: {0}")]
    DuplicateRule(String),

    /// A discovery backend failed to answer
    #[error("Discovery backend error ({realm}): {message}")]
    Discovery {
        /// Realm of the failing backend
        realm: String,
        /// Failure description
        message: String,
    },

    /// A discovery backend could not be started
    #[error("Startup error: {0}")]
    Startup(String),

    /// Connecting to or commanding a target failed
    #[error("Session error ({kind}): {message}")]
    Session {
        /// Failure classification supplied by the session service
        kind: SessionFailureKind,
        /// Failure description
        message: String,
    },

    /// Rule or credential persistence failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CryostatError {
    /// Builds a discovery error for the given realm
    pub fn discovery(realm: impl Into<String>, message: impl Into<String>) -> Self {
        CryostatError::Discovery {
            realm: realm.into(),
            message: message.into(),
        }
    }

    /// Builds a session error with the given classification
    pub fn session(kind: SessionFailureKind, message: impl Into<String>) -> Self {
        CryostatError::Session {
            kind,
            message: message.into(),
        }
    }

    /// Returns true when this is a validation failure (expression or rule)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CryostatError::IllegalExpression(_) | CryostatError::InvalidRule(_)
        )
    }
}

/// Returns the session failure classification carried by an error, if any.
///
/// Walks the `anyhow` chain so wrapped session errors are still recognised.
pub fn session_failure_kind(err: &anyhow::Error) -> Option<SessionFailureKind> {
    err.chain().find_map(|cause| match cause.downcast_ref::<CryostatError>() {
        Some(CryostatError::Session { kind, .. }) => Some(*kind),
        _ => None,
    })
}

/// Returns true when the error chain contains an evaluation failure
pub fn is_evaluation_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<CryostatError>(), Some(CryostatError::Evaluation(_))))
}

/// Result type alias for Cryostat operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_config_error_display() {
        let error = CryostatError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_illegal_expression_display() {
        let error = CryostatError::IllegalExpression("new Foo()".to_string());
        assert_eq!(error.to_string(), "Illegal match expression: new Foo()");
        assert!(error.is_validation());
    }

    #[test]
    fn test_discovery_error_display() {
        let error = CryostatError::discovery("Docker", "socket refused");
        assert_eq!(
            error.to_string(),
            "Discovery backend error (Docker): socket refused"
        );
    }

    #[test]
    fn test_session_error_display() {
        let error = CryostatError::session(SessionFailureKind::Ssl, "bad cert");
        assert_eq!(error.to_string(), "Session error (ssl): bad cert");
    }

    #[test]
    fn test_permanent_session_failures() {
        assert!(SessionFailureKind::Authentication.is_permanent());
        assert!(SessionFailureKind::Ssl.is_permanent());
        assert!(SessionFailureKind::ServiceType.is_permanent());
        assert!(!SessionFailureKind::Connection.is_permanent());
        assert!(!SessionFailureKind::Other.is_permanent());
    }

    #[test]
    fn test_session_failure_kind_through_context() {
        let err: anyhow::Error =
            CryostatError::session(SessionFailureKind::Authentication, "denied").into();
        let wrapped = Err::<(), _>(err).context("archiving").unwrap_err();
        assert_eq!(
            session_failure_kind(&wrapped),
            Some(SessionFailureKind::Authentication)
        );
    }

    #[test]
    fn test_is_evaluation_error() {
        let err: anyhow::Error = CryostatError::Evaluation("not a boolean".into()).into();
        assert!(is_evaluation_error(&err));
        let other: anyhow::Error = CryostatError::Config("x".into()).into();
        assert!(!is_evaluation_error(&other));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: CryostatError = io_error.into();
        assert!(matches!(error, CryostatError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CryostatError>();
    }
}
