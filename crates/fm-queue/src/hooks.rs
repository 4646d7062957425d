use async_trait::async_trait;

use crate::job::{Job, PipelineLink};

#[derive(Debug, thiserror::Error)]
#[error("pipeline hook failed: {0}")]
pub struct HookError(pub String);

/// Callbacks into the workflow layer for pipeline-linked jobs. Errors are
/// logged by the processor and never change the job's outcome.
#[async_trait]
pub trait PipelineHooks: Send + Sync {
    async fn phase_completed(&self, link: &PipelineLink, job: &Job) -> Result<(), HookError>;
    async fn phase_failed(
        &self,
        link: &PipelineLink,
        job: &Job,
        error: &str,
    ) -> Result<(), HookError>;
}

pub struct NoopHooks;

#[async_trait]
impl PipelineHooks for NoopHooks {
    async fn phase_completed(&self, _: &PipelineLink, _: &Job) -> Result<(), HookError> {
        Ok(())
    }

    async fn phase_failed(&self, _: &PipelineLink, _: &Job, _: &str) -> Result<(), HookError> {
        Ok(())
    }
}
