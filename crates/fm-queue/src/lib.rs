//! Asynchronous job pipeline: a queue runtime with at-least-once delivery and
//! exponential backoff, a [`JobProcessor`] that dispatches each job to the
//! right agent implementation, and a bounded [`WorkerPool`].
//!
//! The queue runtime alone owns the attempt count. The processor copies it
//! onto the job record; it never increments it on its own.

pub mod error;
pub mod hooks;
pub mod job;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod store;

pub use error::{JobError, Result};
pub use hooks::{HookError, NoopHooks, PipelineHooks};
pub use job::{Job, JobCounts, JobPayload, JobSpec, JobStatus, JobType, PipelineLink};
pub use pool::WorkerPool;
pub use processor::JobProcessor;
pub use queue::{Delivery, JobQueue, QueueSettings};
pub use store::JobStore;
