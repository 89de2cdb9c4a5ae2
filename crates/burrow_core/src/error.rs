//! Error types for Burrow.
//!
//! Errors are grouped by origin: configuration, SSH transport, database
//! connection and query execution.

use thiserror::Error;

/// Main error type for Burrow.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// Missing or invalid configuration (e.g. a tunnel requested without SSH settings).
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// SSH tunnel establishment or forwarding failed.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Database connection failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed on the server or while reading results.
    #[error("{message}")]
    Query {
        /// Server or driver error message.
        message: String,
        /// ClickHouse exception code, when the server reported one.
        code: Option<i32>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl BurrowError {
    // ========== Constructors ==========

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), hint: None }
    }

    /// Create a new SSH error with an actionable hint.
    pub fn ssh_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new query error.
    pub fn query(message: impl Into<String>, code: Option<i32>) -> Self {
        Self::Query { message: message.into(), code }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Ssh { .. } => "SSH",
            Self::Connection { .. } => "Connection",
            Self::Query { .. } => "Query",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => Some("Check the connection settings"),
            Self::Ssh { hint, .. } => hint.as_deref().or(Some("Check SSH key permissions")),
            Self::Connection { .. } => Some("Check that the ClickHouse server is running"),
            Self::Query { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }
}

/// Convert from std::io::Error to BurrowError.
impl From<std::io::Error> for BurrowError {
    fn from(err: std::io::Error) -> Self {
        BurrowError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_json::Error to BurrowError.
impl From<serde_json::Error> for BurrowError {
    fn from(err: serde_json::Error) -> Self {
        BurrowError::config(format!("Invalid configuration file: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_and_hint() {
        let err = BurrowError::config("No SSH tunnel configured");
        assert_eq!(err.category(), "Config");
        assert!(err.is_config());
        assert_eq!(err.to_string(), "Config error: No SSH tunnel configured");

        let err = BurrowError::ssh_with_hint("auth failed", "Check the key");
        assert_eq!(err.hint(), Some("Check the key"));
        assert_eq!(BurrowError::ssh("boom").hint(), Some("Check SSH key permissions"));
    }

    #[test]
    fn test_query_error_displays_server_message() {
        let err = BurrowError::query("Syntax error: failed at position 8", Some(62));
        assert_eq!(err.to_string(), "Syntax error: failed at position 8");
        assert_eq!(err.hint(), None);
        assert!(!err.is_config());
    }

    #[test]
    fn test_io_error_becomes_connection_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BurrowError::from(io);
        assert_eq!(err.category(), "Connection");
        assert!(std::error::Error::source(&err).is_some());
    }
}
