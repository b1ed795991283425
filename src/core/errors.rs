use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unified error type for the master
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Missing or invalid specification/option. Never retried automatically.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
    },

    /// Bounded-wait connect to the coordination service failed or timed out
    #[error("Coordination service unavailable at {address}: {message}")]
    CoordinationUnavailable { address: String, message: String },

    /// A supervised child crossed its failure or deadline threshold
    #[error("Process failure in {process}: {message}")]
    ProcessFailure { process: String, message: String },

    /// Gateway checkpoint rejection
    #[error("Not authorized to perform {operation}")]
    Authorization { operation: String },

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster already exists: {0}")]
    ClusterExists(String),

    #[error("Bad cluster state: {0}")]
    BadClusterState(String),

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Channel/messaging errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error classification surfaced in status reports and RPC replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    CoordinationUnavailable,
    ProcessFailure,
    Authorization,
    ClusterNotFound,
    ClusterExists,
    BadClusterState,
    Io,
    Serialization,
    Channel,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::CoordinationUnavailable => "coordination_unavailable",
            Self::ProcessFailure => "process_failure",
            Self::Authorization => "authorization",
            Self::ClusterNotFound => "cluster_not_found",
            Self::ClusterExists => "cluster_exists",
            Self::BadClusterState => "bad_cluster_state",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Channel => "channel",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConvoyError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    /// Create a configuration error naming a missing option
    pub fn missing_option<K: Into<String>>(key: K) -> Self {
        let key = key.into();
        Self::Configuration {
            message: format!("missing mandatory option '{}'", key),
            key: Some(key),
        }
    }

    pub fn coordination_unavailable<A: Into<String>, M: Into<String>>(address: A, message: M) -> Self {
        Self::CoordinationUnavailable {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn process_failure<P: Into<String>, M: Into<String>>(process: P, message: M) -> Self {
        Self::ProcessFailure {
            process: process.into(),
            message: message.into(),
        }
    }

    pub fn authorization<S: Into<String>>(operation: S) -> Self {
        Self::Authorization {
            operation: operation.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Option key named by a configuration error, if any
    pub fn missing_key(&self) -> Option<&str> {
        match self {
            Self::Configuration { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::CoordinationUnavailable { .. } => ErrorKind::CoordinationUnavailable,
            Self::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::ClusterNotFound(_) => ErrorKind::ClusterNotFound,
            Self::ClusterExists(_) => ErrorKind::ClusterExists,
            Self::BadClusterState(_) => ErrorKind::BadClusterState,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Channel(_) => ErrorKind::Channel,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether an operator may retry the whole triggering action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CoordinationUnavailable { .. } | Self::ProcessFailure { .. } | Self::Io { .. } => true,
            Self::Configuration { .. } | Self::Authorization { .. } => false,
            _ => false,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvoyError>;

impl From<std::io::Error> for ConvoyError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConvoyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConvoyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for ConvoyError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_option_names_key() {
        let err = ConvoyError::missing_option("accumuloPassword");
        assert_eq!(err.missing_key(), Some("accumuloPassword"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("accumuloPassword"));
    }

    #[test]
    fn test_error_recoverability() {
        assert!(ConvoyError::coordination_unavailable("zk:2181", "timed out").is_recoverable());
        assert!(!ConvoyError::configuration("bad").is_recoverable());
        assert!(!ConvoyError::authorization("stop_cluster").is_recoverable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CoordinationUnavailable).unwrap();
        assert_eq!(json, "\"coordination_unavailable\"");
    }
}
