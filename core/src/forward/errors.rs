//! Error types for tunnel orchestration.

use thiserror::Error;

/// Errors that can occur while managing port-forward tunnels.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// A required helper binary was not handed to the core.
    #[error("required helper binary not available: {0}")]
    DependencyMissing(&'static str),

    /// The OS refused to create a helper process.
    #[error("failed to spawn {helper}: {reason}")]
    SpawnFailure { helper: &'static str, reason: String },

    /// A local port bind failed because the port is taken.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("Kubernetes cluster not connected. Check your kubeconfig.")]
    ClusterNotConnected,

    #[error("kubectl execution failed: {0}")]
    ExecutionFailed(String),

    #[error("kubectl execution timed out")]
    Timeout,

    #[error("failed to parse kubectl output: {0}")]
    ParsingFailed(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Returns true if this error indicates the cluster is unreachable.
    pub fn is_cluster_not_connected(&self) -> bool {
        matches!(self, Self::ClusterNotConnected)
    }

    /// Maps kubectl stderr output onto an error variant.
    pub fn from_kubectl_stderr(stderr: &str) -> Self {
        let stderr_lower = stderr.to_lowercase();
        if stderr_lower.contains("unable to connect")
            || stderr_lower.contains("connection refused")
            || stderr_lower.contains("no configuration")
            || stderr_lower.contains("dial tcp")
            || stderr_lower.contains("couldn't get current server api")
            || stderr_lower.contains("the connection to the server")
        {
            Self::ClusterNotConnected
        } else {
            Self::ExecutionFailed(stderr.trim().to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_error_detection() {
        assert!(ForwardError::from_kubectl_stderr("connection refused").is_cluster_not_connected());
        assert!(ForwardError::from_kubectl_stderr("no configuration has been provided")
            .is_cluster_not_connected());
        assert!(ForwardError::from_kubectl_stderr("dial tcp 127.0.0.1:6443: connect")
            .is_cluster_not_connected());
        assert!(!ForwardError::from_kubectl_stderr("some other error").is_cluster_not_connected());
    }
}
