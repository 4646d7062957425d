//! Failure detection and recovery for running agents.
//!
//! The [`FailureDetector`] turns activity signals into typed
//! [`AgentFailure`]s, the [`RecoveryCoordinator`] picks and runs a
//! remediation strategy, and [`RecoveryService`] ties both together behind
//! the [`FailureRecovery`] capability the orchestrator depends on.

pub mod checkpoint;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod history;
pub mod maintenance;
pub mod model;
pub mod runtime;
pub mod service;

pub use checkpoint::CheckpointStore;
pub use coordinator::RecoveryCoordinator;
pub use detector::FailureDetector;
pub use error::{RecoveryError, Result};
pub use history::RecoveryHistoryStore;
pub use maintenance::MaintenanceLoop;
pub use model::{
    AgentFailure, Checkpoint, ManualAction, RecoveryAttempt, RecoveryOutcome, RecoveryStatus,
    RecoveryStrategy, SessionInfo,
};
pub use runtime::{NoopPipelineControl, PipelineControl, QueueSessionRuntime, SessionRuntime};
pub use service::{FailureRecovery, NoopFailureRecovery, RecoveryService};
