//! Error types for cluster operations.

use std::time::Duration;

use crate::gossip::FactSlot;
use crate::NodeId;

/// Errors that can occur during cluster operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The persisted metadata moved since this writer read it. Internal:
    /// the queue requeues the task instead of surfacing this.
    #[error("metadata conflict: expected {expected}, found {found}")]
    Conflict { expected: String, found: String },

    /// A task was not executed before its deadline.
    #[error("task '{task}' timed out after {timeout:?} in the queue")]
    Timeout { task: String, timeout: Duration },

    /// The task's own logic failed or panicked.
    #[error("task failed: {0}")]
    Task(String),

    /// Connecting to or disconnecting from a peer failed.
    #[error("connection to node {node} failed: {reason}")]
    Connectivity { node: NodeId, reason: String },

    /// A gossip fact could not be parsed.
    #[error("malformed {slot} fact: {reason}")]
    MalformedFact { slot: FactSlot, reason: String },

    /// A peer went down before acknowledging.
    #[error("node {0} failed before acknowledging")]
    NodeFailed(NodeId),

    /// The metadata store could not be read or written.
    #[error("metadata store error: {0}")]
    Persistence(String),

    /// The index does not exist.
    #[error("index '{0}' not found")]
    IndexMissing(String),

    /// The index already exists.
    #[error("index '{0}' already exists")]
    IndexAlreadyExists(String),

    /// The cluster service is shutting down or stopped.
    #[error("cluster service is closed")]
    Closed,

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Returns true for write/write conflicts on the metadata record.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    /// Returns true if a queue deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }

    /// Creates a task failure from any displayable error.
    pub fn task(err: impl std::fmt::Display) -> Self {
        ClusterError::Task(err.to_string())
    }

    /// Creates a persistence failure from any displayable error.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        ClusterError::Persistence(err.to_string())
    }
}

impl From<tessera_persistence::FormatError> for ClusterError {
    fn from(err: tessera_persistence::FormatError) -> Self {
        ClusterError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let conflict = ClusterError::Conflict {
            expected: "a/1".into(),
            found: "b/2".into(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_timeout());

        let timeout = ClusterError::Timeout {
            task: "create-index".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.to_string().contains("create-index"));
    }

    #[test]
    fn format_errors_become_persistence_errors() {
        let err: ClusterError = tessera_persistence::FormatError::InvalidMagic.into();
        assert!(matches!(err, ClusterError::Persistence(_)));
    }
}
