use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use fm_core::event_bus::EventBus;
use fm_core::events::EventKind;
use fm_queue::{HookError, Job, PipelineHooks, PipelineLink};
use fm_recovery::{PipelineControl, RecoveryError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::state::{JobRecord, WorkflowState};

/// Run control for one workflow, checked at every phase boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Running,
    Paused(String),
    Cancelled(String),
}

/// Bounded in-memory home of every [`WorkflowState`].
///
/// Inserting past capacity evicts the oldest finished workflows. Workflows
/// that are still running, or held by their runner, are never evicted, so the
/// population may exceed capacity while they last. Reads hand out copies.
pub struct WorkflowRegistry {
    workflows: DashMap<Uuid, WorkflowState>,
    controls: DashMap<Uuid, watch::Sender<Control>>,
    held: DashSet<Uuid>,
    capacity: usize,
    bus: EventBus,
}

impl WorkflowRegistry {
    pub fn new(capacity: usize, bus: EventBus) -> Self {
        Self {
            workflows: DashMap::new(),
            controls: DashMap::new(),
            held: DashSet::new(),
            capacity: capacity.max(1),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Store a new workflow and return how many finished ones were evicted
    /// to make room.
    pub fn insert(&self, state: WorkflowState) -> usize {
        let id = state.id;
        self.workflows.insert(id, state);
        let (tx, _) = watch::channel(Control::Running);
        self.controls.insert(id, tx);
        self.evict()
    }

    /// Store a new workflow that stays put, finished or not, until
    /// [`release`](Self::release).
    pub fn insert_held(&self, state: WorkflowState) -> usize {
        self.held.insert(state.id);
        self.insert(state)
    }

    /// Make a held workflow evictable again once it has finished.
    pub fn release(&self, id: Uuid) {
        if self.held.remove(&id).is_some() {
            self.evict();
        }
    }

    fn evict(&self) -> usize {
        let excess = self.workflows.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = self
            .workflows
            .iter()
            .filter(|w| w.is_terminal() && !self.held.contains(&w.id))
            .map(|w| (w.started_at, w.id))
            .collect();
        finished.sort();

        let mut evicted = 0;
        for (_, id) in finished.into_iter().take(excess) {
            // Re-check: the entry may have been replaced since the scan.
            let evictable =
                |_: &Uuid, w: &WorkflowState| w.is_terminal() && !self.held.contains(&id);
            if self.workflows.remove_if(&id, evictable).is_some() {
                self.controls.remove(&id);
                evicted += 1;
            }
        }
        if evicted < excess {
            warn!(
                len = self.workflows.len(),
                capacity = self.capacity,
                "workflow registry over capacity with running workflows"
            );
        }
        if evicted > 0 {
            debug!(evicted, "evicted finished workflows");
        }
        evicted
    }

    pub fn get(&self, id: Uuid) -> Option<WorkflowState> {
        self.workflows.get(&id).map(|w| w.clone())
    }

    /// Apply `f` to the stored workflow. The entry is locked while `f` runs.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut WorkflowState) -> R) -> Option<R> {
        self.workflows.get_mut(&id).map(|mut w| f(&mut w))
    }

    /// Unfinished workflows, oldest first, optionally for one tenant.
    pub fn active(&self, tenant_id: Option<&str>) -> Vec<WorkflowState> {
        let mut out: Vec<WorkflowState> = self
            .workflows
            .iter()
            .filter(|w| !w.is_terminal())
            .filter(|w| tenant_id.map_or(true, |t| w.tenant_id == t))
            .map(|w| w.clone())
            .collect();
        out.sort_by_key(|w| w.started_at);
        out
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    // -- Run control --------------------------------------------------------

    pub fn control(&self, id: Uuid) -> Option<Control> {
        self.controls.get(&id).map(|tx| tx.borrow().clone())
    }

    /// Pause a running workflow at its next phase boundary.
    pub fn pause(&self, id: Uuid, reason: &str) -> bool {
        let paused = self.controls.get(&id).is_some_and(|tx| {
            tx.send_if_modified(|c| {
                if *c == Control::Running {
                    *c = Control::Paused(reason.to_string());
                    true
                } else {
                    false
                }
            })
        });
        if paused {
            self.update(id, |w| w.paused = Some(reason.to_string()));
            warn!(workflow_id = %id, reason, "workflow paused");
            self.bus.emit(EventKind::WorkflowPaused {
                workflow_id: id,
                reason: reason.to_string(),
            });
        }
        paused
    }

    pub fn resume(&self, id: Uuid) -> bool {
        let resumed = self.controls.get(&id).is_some_and(|tx| {
            tx.send_if_modified(|c| {
                if matches!(c, Control::Paused(_)) {
                    *c = Control::Running;
                    true
                } else {
                    false
                }
            })
        });
        if resumed {
            self.update(id, |w| w.paused = None);
            info!(workflow_id = %id, "workflow resumed");
            self.bus.emit(EventKind::WorkflowResumed { workflow_id: id });
        }
        resumed
    }

    /// Stop the workflow at its next boundary. Overrides a pause.
    pub fn cancel(&self, id: Uuid, reason: &str) {
        if let Some(tx) = self.controls.get(&id) {
            tx.send_replace(Control::Cancelled(reason.to_string()));
        }
    }

    /// Wait while the workflow is paused. Errors once it is cancelled.
    pub async fn boundary(&self, id: Uuid) -> Result<()> {
        let Some(mut rx) = self.controls.get(&id).map(|tx| tx.subscribe()) else {
            return Ok(());
        };
        let control = match rx
            .wait_for(|c| !matches!(c, Control::Paused(_)))
            .await
        {
            Ok(c) => c.clone(),
            // Sender dropped: the workflow was evicted.
            Err(_) => return Err(OrchestratorError::UnknownWorkflow(id)),
        };
        match control {
            Control::Cancelled(_) => Err(OrchestratorError::Cancelled(id)),
            _ => Ok(()),
        }
    }

    /// Fail a workflow and publish `workflow.failed`, unless it already
    /// finished. Returns whether this call ended it.
    pub fn fail(&self, id: Uuid, error: &str) -> bool {
        let failed = self.update(id, |w| w.fail(error)).unwrap_or(false);
        if failed {
            warn!(workflow_id = %id, error, "workflow failed");
            self.bus.emit(EventKind::WorkflowFailed {
                workflow_id: id,
                error: error.to_string(),
            });
        }
        failed
    }

    fn record_job(&self, link: &PipelineLink, job: &Job) -> std::result::Result<(), HookError> {
        let record = JobRecord {
            job_id: job.id,
            job_type: job.job_type.to_string(),
            phase: link.phase,
            status: job.status,
            attempts: job.attempts,
            error: job.error.clone(),
        };
        self.update(link.workflow_id, |w| {
            w.jobs.push(record);
            w.updated_at = chrono::Utc::now();
        })
        .ok_or_else(|| HookError(format!("unknown workflow {}", link.workflow_id)))
    }
}

#[async_trait]
impl PipelineHooks for WorkflowRegistry {
    async fn phase_completed(
        &self,
        link: &PipelineLink,
        job: &Job,
    ) -> std::result::Result<(), HookError> {
        debug!(workflow_id = %link.workflow_id, phase = %link.phase, job_id = %job.id, "pipeline job completed");
        self.record_job(link, job)
    }

    async fn phase_failed(
        &self,
        link: &PipelineLink,
        job: &Job,
        error: &str,
    ) -> std::result::Result<(), HookError> {
        warn!(workflow_id = %link.workflow_id, phase = %link.phase, job_id = %job.id, error, "pipeline job failed");
        self.record_job(link, job)
    }
}

#[async_trait]
impl PipelineControl for WorkflowRegistry {
    async fn pause(&self, workflow_id: Uuid, reason: &str) -> fm_recovery::Result<()> {
        if self.get(workflow_id).is_none() {
            return Err(RecoveryError::Pipeline(format!("unknown workflow {workflow_id}")));
        }
        WorkflowRegistry::pause(self, workflow_id, reason);
        Ok(())
    }

    async fn fail(&self, workflow_id: Uuid, reason: &str) -> fm_recovery::Result<()> {
        if self.get(workflow_id).is_none() {
            return Err(RecoveryError::Pipeline(format!("unknown workflow {workflow_id}")));
        }
        self.cancel(workflow_id, reason);
        WorkflowRegistry::fail(self, workflow_id, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DeliveryTask, TaskKind};
    use fm_core::types::WorkflowPhase;
    use std::time::Duration;

    fn workflow() -> WorkflowState {
        WorkflowState::new(&DeliveryTask::new("acme", TaskKind::Deploy), 3)
    }

    fn finished() -> WorkflowState {
        let mut w = workflow();
        w.advance(WorkflowPhase::Completed).unwrap();
        w
    }

    #[test]
    fn evicts_oldest_finished_first() {
        let reg = WorkflowRegistry::new(2, EventBus::new());
        let old = finished();
        std::thread::sleep(Duration::from_millis(2));
        let newer = finished();
        let running = workflow();
        reg.insert(old.clone());
        reg.insert(newer.clone());
        assert_eq!(reg.insert(running.clone()), 1);
        assert!(reg.get(old.id).is_none());
        assert!(reg.get(newer.id).is_some());
        assert!(reg.get(running.id).is_some());
    }

    #[test]
    fn never_evicts_running_workflows() {
        let reg = WorkflowRegistry::new(1, EventBus::new());
        let a = workflow();
        let b = workflow();
        reg.insert(a.clone());
        assert_eq!(reg.insert(b.clone()), 0);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.active(Some("acme")).len(), 2);
        assert!(reg.active(Some("globex")).is_empty());
    }

    #[tokio::test]
    async fn boundary_waits_for_resume() {
        let reg = std::sync::Arc::new(WorkflowRegistry::new(10, EventBus::new()));
        let w = workflow();
        let id = w.id;
        reg.insert(w);
        assert!(reg.pause(id, "escalated"));
        assert_eq!(reg.get(id).unwrap().paused.as_deref(), Some("escalated"));

        let r = reg.clone();
        let waiter = tokio::spawn(async move { r.boundary(id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(reg.resume(id));
        waiter.await.unwrap().unwrap();
        assert!(reg.get(id).unwrap().paused.is_none());
    }

    #[tokio::test]
    async fn cancel_releases_a_paused_boundary() {
        let reg = WorkflowRegistry::new(10, EventBus::new());
        let w = workflow();
        let id = w.id;
        reg.insert(w);
        reg.pause(id, "escalated");
        reg.cancel(id, "operator");
        assert!(matches!(
            reg.boundary(id).await,
            Err(OrchestratorError::Cancelled(_))
        ));
        assert!(!reg.resume(id));
    }

    #[test]
    fn held_workflows_survive_eviction_until_released() {
        let reg = WorkflowRegistry::new(1, EventBus::new());
        let mine = workflow();
        reg.insert_held(mine.clone());
        reg.update(mine.id, |w| w.advance(WorkflowPhase::Completed))
            .unwrap()
            .unwrap();

        // Another run starts and finishes while the first result is unread.
        std::thread::sleep(Duration::from_millis(2));
        let other = workflow();
        assert_eq!(reg.insert_held(other.clone()), 0);
        assert!(reg.fail(other.id, "boom"));
        assert_eq!(reg.get(mine.id).map(|w| w.phase), Some(WorkflowPhase::Completed));

        reg.release(mine.id);
        assert!(reg.get(mine.id).is_none());
        assert!(reg.get(other.id).is_some());
        reg.release(other.id);
        assert_eq!(reg.len(), 1);
    }
}
