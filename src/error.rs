use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the qgate gateway
#[derive(Error, Debug, Clone)]
pub enum QgateError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Network related errors (dial, read, write)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Request parsing / dispatch errors
    #[error("Proxy error: {message}")]
    Proxy { message: String },

    /// CONNECT tunnel errors
    #[error("Tunnel error: {destination}: {message}")]
    Tunnel {
        destination: String,
        message: String,
    },

    /// Persistent store errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// The store reported busy/locked; safe to retry
    #[error("Database busy: {message}")]
    DatabaseBusy { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// Admission control rejections
    #[error("Rate limit exceeded for {client}")]
    RateLimit { client: String },

    /// Request body exceeds the configured maximum
    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// Provenance proof generation/verification errors
    #[error("Proof error: {message}")]
    Proof { message: String },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl QgateError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a proxy error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create a tunnel error
    pub fn tunnel<D: Into<String>, S: Into<String>>(destination: D, message: S) -> Self {
        Self::Tunnel {
            destination: destination.into(),
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(client: S) -> Self {
        Self::RateLimit {
            client: client.into(),
        }
    }

    /// Create a proof error
    pub fn proof<S: Into<String>>(message: S) -> Self {
        Self::Proof {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QgateError::Network { .. }
                | QgateError::Timeout { .. }
                | QgateError::DatabaseBusy { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QgateError::Config { .. } => ErrorSeverity::Critical,
            QgateError::Database { .. } => ErrorSeverity::High,
            QgateError::Internal { .. } => ErrorSeverity::High,
            QgateError::DatabaseBusy { .. } => ErrorSeverity::Medium,
            QgateError::Network { .. } => ErrorSeverity::Medium,
            QgateError::Timeout { .. } => ErrorSeverity::Medium,
            QgateError::Tunnel { .. } => ErrorSeverity::Medium,
            QgateError::Io { .. } => ErrorSeverity::Medium,
            QgateError::Proxy { .. } => ErrorSeverity::Low,
            QgateError::RateLimit { .. } => ErrorSeverity::Low,
            QgateError::PayloadTooLarge { .. } => ErrorSeverity::Low,
            QgateError::Proof { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for qgate operations
pub type QgateResult<T> = Result<T, QgateError>;

/// Convert from anyhow::Error to QgateError
impl From<anyhow::Error> for QgateError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return QgateError::io(format!("IO error: {}", io_err));
        }

        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            return QgateError::network(format!("HTTP error: {}", hyper_err));
        }

        QgateError::internal(err.to_string())
    }
}

/// Convert from std::io::Error to QgateError
impl From<std::io::Error> for QgateError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => {
                QgateError::network(format!("Connection error: {}", err))
            }
            _ => QgateError::io(err.to_string()),
        }
    }
}

/// Convert from hyper::Error to QgateError
impl From<hyper::Error> for QgateError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            QgateError::timeout(Duration::from_secs(30), "HTTP request")
        } else if err.is_connect() {
            QgateError::network(format!("Connection error: {}", err))
        } else {
            QgateError::network(format!("HTTP error: {}", err))
        }
    }
}

/// Convert from sqlx::Error to QgateError
impl From<sqlx::Error> for QgateError {
    fn from(err: sqlx::Error) -> Self {
        // SQLite surfaces contention as "database is locked"; that is retryable
        let text = err.to_string();
        if text.contains("database is locked") || text.contains("database table is locked") {
            QgateError::DatabaseBusy { message: text }
        } else {
            QgateError::database(text)
        }
    }
}

/// Convert from toml::de::Error to QgateError
impl From<toml::de::Error> for QgateError {
    fn from(err: toml::de::Error) -> Self {
        QgateError::config(format!("TOML parsing error: {}", err))
    }
}

/// Convert from serde_json::Error to QgateError
impl From<serde_json::Error> for QgateError {
    fn from(err: serde_json::Error) -> Self {
        QgateError::internal(format!("JSON serialization error: {}", err))
    }
}

/// Convert from hyper::http::Error to QgateError
impl From<hyper::http::Error> for QgateError {
    fn from(err: hyper::http::Error) -> Self {
        QgateError::network(format!("HTTP error: {}", err))
    }
}

/// Convert from tokio::time::Elapsed to QgateError
impl From<tokio::time::error::Elapsed> for QgateError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        QgateError::timeout(Duration::from_secs(30), "operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let config_err = QgateError::config("Invalid bind address");
        assert!(matches!(config_err, QgateError::Config { .. }));
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Invalid bind address"
        );

        let network_err = QgateError::network("Connection refused");
        assert!(matches!(network_err, QgateError::Network { .. }));
        assert_eq!(network_err.to_string(), "Network error: Connection refused");

        let timeout_err = QgateError::timeout(Duration::from_secs(5), "upstream connect");
        assert!(matches!(timeout_err, QgateError::Timeout { .. }));
        assert_eq!(
            timeout_err.to_string(),
            "Operation timed out after 5s: upstream connect"
        );
    }

    #[test]
    fn test_error_properties() {
        let network_err = QgateError::network("Connection error");
        assert!(network_err.is_retryable());
        assert_eq!(network_err.severity(), ErrorSeverity::Medium);

        let config_err = QgateError::config("Invalid config");
        assert!(!config_err.is_retryable());
        assert_eq!(config_err.severity(), ErrorSeverity::Critical);

        let busy = QgateError::DatabaseBusy {
            message: "database is locked".into(),
        };
        assert!(busy.is_retryable());

        let db_err = QgateError::database("constraint violation");
        assert!(!db_err.is_retryable());
        assert_eq!(db_err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let qgate_error: QgateError = io_error.into();
        assert!(matches!(qgate_error, QgateError::Network { .. }));

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let qgate_error: QgateError = io_error.into();
        assert!(matches!(qgate_error, QgateError::Io { .. }));

        let anyhow_error = anyhow::anyhow!("Generic error");
        let qgate_error: QgateError = anyhow_error.into();
        assert!(matches!(qgate_error, QgateError::Internal { .. }));
    }

    #[test]
    fn test_sqlx_busy_is_retryable() {
        let err = sqlx::Error::Protocol("database is locked".into());
        let qgate_error: QgateError = err.into();
        assert!(matches!(qgate_error, QgateError::DatabaseBusy { .. }));
        assert!(qgate_error.is_retryable());
    }
}
