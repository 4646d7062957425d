//! Workflow orchestration for autonomous delivery.
//!
//! A [`DeliveryTask`] becomes a workflow that walks the phase table
//! (planning, implementation, QA, deployment) with one freshly spawned agent
//! per phase. Every agent call goes through the job queue; failures are
//! handed to [`fm_recovery`] and retried on replacement agents.
//!
//! [`Foreman`] wires the whole system together from a
//! [`Config`](fm_core::config::Config).

pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod system;
pub mod task;

pub use dispatch::QueueDispatch;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use registry::{Control, WorkflowRegistry};
pub use state::{AgentRecord, JobRecord, WorkflowState};
pub use system::Foreman;
pub use task::{
    Autonomy, CancelOutcome, CustomStep, DeliveryTask, TaskKind, WorkflowOutcome, WorkflowStatus,
};
