// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the windlass engine.
//!
//! Provides a unified error type shared by the shard controller, the
//! mutable-state layer, the queue processors, and the replication stack.
//! Every variant carries enough structured context (domain, workflow, run,
//! shard, task IDs) to diagnose at operational scale.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// The shard's range ID was fenced by a newer owner. Fatal for the
    /// shard; triggers controlled handoff.
    ShardOwnershipLost {
        /// The shard that lost ownership.
        shard_id: i32,
        /// Detail from the persistence layer.
        details: String,
    },

    /// A conditional mutable-state write observed a stale condition.
    /// Callers reload, reapply, and retry with a bounded attempt cap.
    ConditionalUpdateFailed {
        /// The run whose update was rejected.
        run_id: String,
        /// Detail from the persistence layer.
        details: String,
    },

    /// The domain is not active in this cluster. The redirection layer
    /// uses the `active_cluster` field to retry against the right one.
    DomainNotActive {
        /// Domain name or ID as supplied by the caller.
        domain: String,
        /// The cluster that rejected the call.
        current_cluster: String,
        /// The cluster the domain is currently active in.
        active_cluster: String,
    },

    /// The referenced entity (workflow, run, domain, shard) does not exist.
    EntityNotExists {
        /// Human-readable description of what was being looked up.
        entity: String,
    },

    /// A start collided with an existing current run.
    WorkflowExecutionAlreadyStarted {
        /// The workflow ID that already has a current run.
        workflow_id: String,
        /// The run that holds the current pointer.
        run_id: String,
    },

    /// Returned by a queue processor to defer the task. The caller must not
    /// advance the ack level; the task is retried with backoff.
    TaskRetry,

    /// Permanently skip the task; the caller advances the ack level.
    TaskDiscarded,

    /// Standby processing needs events pulled from the active cluster
    /// before the task can be judged. Carries the re-replication hint.
    RetryTask {
        /// Domain owning the workflow.
        domain_id: String,
        /// Workflow whose history is incomplete locally.
        workflow_id: String,
        /// Run whose history is incomplete locally.
        run_id: String,
        /// First event ID that is missing locally.
        next_event_id: i64,
    },

    /// The host is saturated (e.g. the history cache is full of pinned
    /// entries). Callers retry with backoff.
    ServiceBusy,

    /// A storage-level failure.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether the caller may retry transparently.
        retryable: bool,
    },

    /// Invariant violation or unexpected internal state. Treated as a bug.
    Internal {
        /// What went wrong.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ShardOwnershipLost { .. } => "SHARD_OWNERSHIP_LOST",
            Self::ConditionalUpdateFailed { .. } => "CONDITIONAL_UPDATE_FAILED",
            Self::DomainNotActive { .. } => "DOMAIN_NOT_ACTIVE",
            Self::EntityNotExists { .. } => "ENTITY_NOT_EXISTS",
            Self::WorkflowExecutionAlreadyStarted { .. } => "WORKFLOW_ALREADY_STARTED",
            Self::TaskRetry => "TASK_RETRY",
            Self::TaskDiscarded => "TASK_DISCARDED",
            Self::RetryTask { .. } => "RETRY_TASK",
            Self::ServiceBusy => "SERVICE_BUSY",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether the operation may be retried transparently by the caller.
    ///
    /// `TaskRetry` and `RetryTask` are deferrals rather than retryable
    /// failures; queue processors handle them explicitly.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConditionalUpdateFailed { .. } | Self::ServiceBusy => true,
            Self::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Construct a retryable storage error.
    pub fn storage_retryable(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.into(),
            retryable: true,
        }
    }

    /// Construct a non-retryable storage error.
    pub fn storage_fatal(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardOwnershipLost { shard_id, details } => {
                write!(f, "Shard {} ownership lost: {}", shard_id, details)
            }
            Self::ConditionalUpdateFailed { run_id, details } => {
                write!(f, "Conditional update failed for run '{}': {}", run_id, details)
            }
            Self::DomainNotActive {
                domain,
                current_cluster,
                active_cluster,
            } => {
                write!(
                    f,
                    "Domain '{}' is not active in cluster '{}', active cluster is '{}'",
                    domain, current_cluster, active_cluster
                )
            }
            Self::EntityNotExists { entity } => {
                write!(f, "Entity not found: {}", entity)
            }
            Self::WorkflowExecutionAlreadyStarted { workflow_id, run_id } => {
                write!(
                    f,
                    "Workflow '{}' already started with run '{}'",
                    workflow_id, run_id
                )
            }
            Self::TaskRetry => write!(f, "Task must be retried"),
            Self::TaskDiscarded => write!(f, "Task was discarded"),
            Self::RetryTask {
                domain_id,
                workflow_id,
                run_id,
                next_event_id,
            } => {
                write!(
                    f,
                    "Task for domain '{}' workflow '{}' run '{}' needs events from {}",
                    domain_id, workflow_id, run_id, next_event_id
                )
            }
            Self::ServiceBusy => write!(f, "Service is busy"),
            Self::Storage {
                operation,
                details,
                retryable,
            } => {
                write!(
                    f,
                    "Storage error during '{}' (retryable: {}): {}",
                    operation, retryable, details
                )
            }
            Self::Internal { details } => write!(f, "Internal error: {}", details),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                EngineError::ShardOwnershipLost {
                    shard_id: 3,
                    details: "range id moved".to_string(),
                },
                "SHARD_OWNERSHIP_LOST",
            ),
            (
                EngineError::ConditionalUpdateFailed {
                    run_id: "run-1".to_string(),
                    details: "stale next_event_id".to_string(),
                },
                "CONDITIONAL_UPDATE_FAILED",
            ),
            (
                EngineError::DomainNotActive {
                    domain: "d".to_string(),
                    current_cluster: "a".to_string(),
                    active_cluster: "b".to_string(),
                },
                "DOMAIN_NOT_ACTIVE",
            ),
            (EngineError::TaskRetry, "TASK_RETRY"),
            (EngineError::TaskDiscarded, "TASK_DISCARDED"),
            (EngineError::ServiceBusy, "SERVICE_BUSY"),
        ];

        for (error, expected_code) in cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should map to {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_retryability() {
        assert!(EngineError::ServiceBusy.is_retryable());
        assert!(EngineError::ConditionalUpdateFailed {
            run_id: "r".to_string(),
            details: String::new(),
        }
        .is_retryable());
        assert!(EngineError::storage_retryable("get_workflow", "timeout").is_retryable());
        assert!(!EngineError::storage_fatal("get_workflow", "corrupt row").is_retryable());
        assert!(!EngineError::TaskRetry.is_retryable());
        assert!(!EngineError::ShardOwnershipLost {
            shard_id: 0,
            details: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::DomainNotActive {
            domain: "orders".to_string(),
            current_cluster: "dc-a".to_string(),
            active_cluster: "dc-b".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("orders"));
        assert!(rendered.contains("dc-a"));
        assert!(rendered.contains("dc-b"));

        let err = EngineError::RetryTask {
            domain_id: "did".to_string(),
            workflow_id: "wid".to_string(),
            run_id: "rid".to_string(),
            next_event_id: 7,
        };
        assert!(err.to_string().contains('7'));
    }
}
