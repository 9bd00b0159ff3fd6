//! Coordinator error types

use thiserror::Error;

/// Result type for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors surfaced by the topology coordinator's responder methods.
///
/// These are returned to the command layer as status codes; the coordinator
/// never panics across its API boundary for any of them. Violations of
/// internal invariants (e.g. a leader whose primary index is not itself) are
/// programmer errors and abort via `assert!` instead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopologyError {
    // ==================== Lifecycle ====================
    #[error("replication system is shutting down")]
    ShutdownInProgress,

    // ==================== Identity ====================
    #[error("wrong repl set name; expected: {expected}, received: {received}")]
    ReplicaSetNotFound { expected: String, received: String },

    #[error("repl set names do not match; ours: {ours}, remote node's: {remote}")]
    MismatchedSetName { ours: String, remote: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    // ==================== Command arguments ====================
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("not secondary: {0}")]
    NotSecondary(String),

    #[error("bad value: {0}")]
    BadValue(String),

    // ==================== Peer health ====================
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // ==================== Configuration ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TopologyError {
    /// Check if the caller may retry the same command later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TopologyError::HostUnreachable(_) | TopologyError::ShutdownInProgress
        )
    }

    /// Check if this error indicates the two nodes belong to different sets
    pub fn is_set_mismatch(&self) -> bool {
        matches!(
            self,
            TopologyError::ReplicaSetNotFound { .. } | TopologyError::MismatchedSetName { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(TopologyError::ShutdownInProgress.is_retriable());
        assert!(TopologyError::HostUnreachable("db1:27017".into()).is_retriable());
        assert!(!TopologyError::BadValue("pv 2".into()).is_retriable());
        assert!(!TopologyError::NodeNotFound("db9:27017".into()).is_retriable());
    }

    #[test]
    fn test_set_mismatch_classification() {
        let err = TopologyError::ReplicaSetNotFound {
            expected: "rs0".into(),
            received: "rs1".into(),
        };
        assert!(err.is_set_mismatch());
        assert!(!TopologyError::ShutdownInProgress.is_set_mismatch());
    }
}
