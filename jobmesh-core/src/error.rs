//! Error types for the coordination kernel
//!
//! Taxonomy covering store, coordination, configuration and runtime
//! failures. Only a lost session or a bad config at startup is fatal;
//! everything else is logged and retried on the next triggering event.

use thiserror::Error;

/// Primary error type for all coordination operations
#[derive(Debug, Error)]
pub enum JobMeshError {
    // ========== Store Errors ==========

    /// Connection to the store is temporarily suspended
    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    /// The session backing this client has expired
    #[error("Session {session_id} expired")]
    SessionExpired { session_id: u64 },

    /// Atomic create hit an existing node
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// Update hit a missing node
    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    /// Transactional batch was rejected as a whole
    #[error("Transaction rejected at {path}: {reason}")]
    TransactionRejected { path: String, reason: String },

    // ========== Coordination Errors ==========

    /// Distributed lock could not be acquired in the allotted attempts
    #[error("Timed out acquiring lock {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    /// Blocking operation cancelled by shutdown
    #[error("Interrupted while {operation}")]
    Interrupted { operation: String },

    /// Instance id could not be parsed
    #[error("Malformed instance id: {instance_id}")]
    InvalidInstanceId { instance_id: String },

    // ========== Configuration Errors ==========

    /// Job configuration failed validation
    #[error("Invalid job configuration: {reason}")]
    InvalidConfig { reason: String },

    /// No configuration registered for the job
    #[error("No configuration found for job {job_name}")]
    ConfigNotFound { job_name: String },

    /// Sharding strategy name not in the registry
    #[error("Unknown sharding strategy: {name}")]
    UnknownStrategy { name: String },

    /// Value stored in a node could not be decoded
    #[error("Failed to decode node {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    // ========== Runtime Errors ==========

    /// Startup failed and the job cannot run
    #[error("Job {job_name} failed to start: {source}")]
    StartupFailed {
        job_name: String,
        #[source]
        source: Box<JobMeshError>,
    },

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl JobMeshError {
    /// Returns true if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobMeshError::ConnectionLoss
                | JobMeshError::LockTimeout { .. }
                | JobMeshError::TransactionRejected { .. }
        )
    }

    /// Returns true if this error must abort job startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobMeshError::SessionExpired { .. }
                | JobMeshError::StartupFailed { .. }
                | JobMeshError::InvalidConfig { .. }
        )
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, JobMeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(JobMeshError::ConnectionLoss.is_retryable());
        assert!(JobMeshError::LockTimeout { path: "/job/leader".into(), attempts: 3 }.is_retryable());
        assert!(!JobMeshError::ShutdownInProgress.is_retryable());
    }

    #[test]
    fn test_startup_failure_is_fatal() {
        let err = JobMeshError::StartupFailed {
            job_name: "orders".into(),
            source: Box::new(JobMeshError::SessionExpired { session_id: 7 }),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("orders"));
    }
}
