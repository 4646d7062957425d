use std::sync::Arc;

use fm_agents::{AgentService, AgentStatus, AgentTask};
use fm_context::ContextStore;
use fm_core::config::WorkflowConfig;
use fm_core::event_bus::EventBus;
use fm_core::events::EventKind;
use fm_core::types::{
    actions, AgentType, DeploymentResult, ImplementationResult, TestReport, WorkflowPhase,
};
use fm_queue::PipelineLink;
use fm_recovery::{Checkpoint, FailureRecovery, SessionInfo};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::QueueDispatch;
use crate::error::{OrchestratorError, Result};
use crate::registry::{Control, WorkflowRegistry};
use crate::state::WorkflowState;
use crate::task::{CancelOutcome, DeliveryTask, TaskKind, WorkflowOutcome};

/// How a workflow body ended when it did not error.
enum Flow {
    Completed,
    Failed(String),
}

/// The agent currently serving one phase of a workflow.
struct StepAgent {
    workflow_id: Uuid,
    phase: WorkflowPhase,
    agent_id: Uuid,
    agent_type: AgentType,
    tenant_id: String,
}

impl StepAgent {
    fn link(&self) -> PipelineLink {
        PipelineLink {
            workflow_id: self.workflow_id,
            phase: self.phase,
        }
    }

    fn session_id(&self) -> String {
        session_id(self.workflow_id, self.phase)
    }
}

fn session_id(workflow_id: Uuid, phase: WorkflowPhase) -> String {
    format!("{workflow_id}/{phase}")
}

fn parse<T: DeserializeOwned + Default>(phase: WorkflowPhase, value: &serde_json::Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| OrchestratorError::BadResult {
        phase,
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs delivery workflows phase by phase through the job queue.
///
/// One workflow runs its phases sequentially; any number of workflows may
/// run concurrently, each owning its own [`WorkflowState`] in the registry.
pub struct Orchestrator {
    dispatch: QueueDispatch,
    agents: AgentService,
    context: Arc<ContextStore>,
    registry: Arc<WorkflowRegistry>,
    recovery: Arc<dyn FailureRecovery>,
    bus: EventBus,
    default_max_retries: u32,
}

impl Orchestrator {
    pub fn new(
        dispatch: QueueDispatch,
        agents: AgentService,
        context: Arc<ContextStore>,
        registry: Arc<WorkflowRegistry>,
        recovery: Arc<dyn FailureRecovery>,
        cfg: &WorkflowConfig,
    ) -> Self {
        Self {
            dispatch,
            agents,
            context,
            bus: registry.bus().clone(),
            registry,
            recovery,
            default_max_retries: cfg.max_retries,
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    // -- Public operations --------------------------------------------------

    /// Run `task` to completion. Workflow-level failures (QA never green,
    /// failed smoke tests, exhausted jobs) come back as a `failed` outcome;
    /// only an invalid task is an `Err`.
    pub async fn execute_task(&self, task: DeliveryTask) -> Result<WorkflowOutcome> {
        task.validate()?;
        let max_retries = task.max_retries.unwrap_or(self.default_max_retries);
        let state = WorkflowState::new(&task, max_retries);
        let id = state.id;
        self.registry.insert_held(state);
        info!(workflow_id = %id, task_id = %task.id, tenant_id = %task.tenant_id, kind = %task.kind, max_retries, "workflow started");
        self.bus.emit(EventKind::WorkflowStarted {
            workflow_id: id,
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            kind: task.kind.to_string(),
        });

        let flow = match task.kind {
            TaskKind::ImplementFeature => self.implement_feature(id, &task).await,
            TaskKind::FixBug => self.delivery_loop(id, &task, actions::FIX_BUG, None).await,
            TaskKind::Deploy => self.deploy(id, &task, task.input.clone()).await,
            TaskKind::FullLifecycle => self.full_lifecycle(id, &task).await,
            TaskKind::Custom => self.custom(id, &task).await,
        };
        self.finish(id, flow);
        let state = self.registry.get(id);
        self.registry.release(id);
        let state = state.ok_or(OrchestratorError::UnknownWorkflow(id))?;
        self.release_sessions(&state).await;
        Ok(WorkflowOutcome::from(state))
    }

    pub fn get_workflow_status(&self, id: Uuid) -> Option<WorkflowState> {
        self.registry.get(id)
    }

    pub fn get_active_workflows(&self, tenant_id: &str) -> Vec<WorkflowState> {
        self.registry.active(Some(tenant_id))
    }

    /// Terminate the workflow's current agents and mark it failed. Agent
    /// calls already in flight are not interrupted.
    pub async fn cancel_workflow(&self, id: Uuid) -> CancelOutcome {
        let Some(state) = self.registry.get(id) else {
            return CancelOutcome {
                cancelled: false,
                terminated_agents: Vec::new(),
                reason: Some("workflow not found".into()),
            };
        };
        if state.is_terminal() {
            return CancelOutcome {
                cancelled: false,
                terminated_agents: Vec::new(),
                reason: Some(format!("workflow already {}", state.phase)),
            };
        }

        self.registry.cancel(id, "cancelled by user");
        let mut terminated = Vec::new();
        for agent_id in state.agents.values() {
            match self.agents.terminate(*agent_id, &state.tenant_id).await {
                Ok(agent) if agent.status == AgentStatus::Terminated => terminated.push(*agent_id),
                Ok(agent) => debug!(agent_id = %agent_id, status = ?agent.status, "agent already finished"),
                Err(e) => warn!(workflow_id = %id, agent_id = %agent_id, error = %e, "could not terminate agent"),
            }
        }
        self.registry.fail(id, "workflow cancelled");
        self.release_sessions(&state).await;
        info!(workflow_id = %id, terminated = terminated.len(), "workflow cancelled");
        CancelOutcome {
            cancelled: true,
            terminated_agents: terminated,
            reason: None,
        }
    }

    /// Let a paused workflow continue. Returns `false` if it was not paused.
    pub fn resume_workflow(&self, id: Uuid) -> bool {
        self.registry.resume(id)
    }

    // -- Workflows ----------------------------------------------------------

    async fn implement_feature(&self, id: Uuid, task: &DeliveryTask) -> Result<Flow> {
        let plan = self
            .step(
                id,
                task,
                WorkflowPhase::Planning,
                AgentType::Planner,
                actions::CREATE_PLAN,
                json!({ "title": task.title, "input": task.input }),
            )
            .await?;
        self.delivery_loop(id, task, actions::IMPLEMENT_STORY, Some(plan))
            .await
    }

    async fn full_lifecycle(&self, id: Uuid, task: &DeliveryTask) -> Result<Flow> {
        if let Flow::Failed(reason) = self.implement_feature(id, task).await? {
            return Ok(Flow::Failed(reason));
        }
        let results = self
            .registry
            .get(id)
            .map(|w| w.phase_results)
            .unwrap_or_default();
        let config = json!({
            "input": task.input,
            "implementation": results.get(WorkflowPhase::Implementation.as_str()),
            "qa": results.get(WorkflowPhase::Qa.as_str()),
        });
        self.deploy(id, task, config).await
    }

    /// Implementation -> QA, repeated until QA is green or the retry budget
    /// is spent.
    async fn delivery_loop(
        &self,
        id: Uuid,
        task: &DeliveryTask,
        action: &str,
        plan: Option<serde_json::Value>,
    ) -> Result<Flow> {
        let dev_session = session_id(id, WorkflowPhase::Implementation);
        let mut feedback: Option<TestReport> = None;
        let mut previous_dev: Option<Uuid> = None;

        loop {
            let previous_context = match previous_dev {
                Some(agent_id) => self.prior_context(agent_id, &task.tenant_id).await,
                None => None,
            };
            let dev_input = json!({
                "title": task.title,
                "input": task.input,
                "plan": plan,
                "qa_feedback": feedback,
                "previous_context": previous_context,
            });
            let (dev_agent, dev_result) = self
                .step_with_agent(id, task, WorkflowPhase::Implementation, AgentType::Dev, action, dev_input)
                .await?;
            let implementation: ImplementationResult =
                parse(WorkflowPhase::Implementation, &dev_result)?;
            let refreshed = self
                .report_implementation(id, task, dev_agent, &implementation)
                .await;

            let qa_input = json!({ "input": task.input, "implementation": dev_result });
            let qa_result = self
                .step(id, task, WorkflowPhase::Qa, AgentType::Qa, actions::RUN_TESTS, qa_input)
                .await?;
            let report: TestReport = parse(WorkflowPhase::Qa, &qa_result)?;
            self.recovery.on_test_run(&dev_session, report.is_green()).await;

            if report.is_green() {
                info!(workflow_id = %id, passed = report.passed, "QA passed");
                return Ok(Flow::Completed);
            }

            let (retry_count, max_retries) = self
                .registry
                .get(id)
                .map(|w| (w.retry_count, w.max_retries))
                .ok_or(OrchestratorError::UnknownWorkflow(id))?;
            if retry_count >= max_retries {
                return Ok(Flow::Failed(format!(
                    "QA still failing after {retry_count} retries (max {max_retries}): {} failed test(s)",
                    report.failed
                )));
            }
            self.registry.update(id, |w| w.retry_count += 1);
            warn!(workflow_id = %id, failed = report.failed, retry = retry_count + 1, max_retries, "QA failed, retrying implementation");
            feedback = Some(report);
            previous_dev = Some(refreshed.unwrap_or(dev_agent));
        }
    }

    async fn deploy(&self, id: Uuid, task: &DeliveryTask, config: serde_json::Value) -> Result<Flow> {
        let mut agent = self
            .enter(id, task, WorkflowPhase::Deployment, AgentType::Devops, config)
            .await?;
        let deployed = match self
            .run_on(&mut agent, actions::DEPLOY, json!({ "input": task.input }))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.finish_agent(&agent, false).await;
                return Err(e);
            }
        };
        self.record_result(&agent, actions::DEPLOY, &deployed).await;
        let deployment: DeploymentResult = parse(WorkflowPhase::Deployment, &deployed)?;

        if deployment.smoke_tests_passed {
            self.finish_agent(&agent, true).await;
            return Ok(Flow::Completed);
        }

        warn!(workflow_id = %id, agent_id = %agent.agent_id, "smoke tests failed, rolling back");
        let rollback = self
            .run_on(&mut agent, actions::ROLLBACK, json!({ "deployment": deployed }))
            .await;
        let reason = match rollback {
            Ok(result) => {
                self.registry
                    .update(id, |w| w.set_result("rollback", result.clone()));
                self.finish_agent(&agent, true).await;
                "deployment smoke tests failed; deployment rolled back".to_string()
            }
            Err(e) => {
                error!(workflow_id = %id, error = %e, "rollback failed");
                self.registry.update(id, |w| {
                    w.set_result("rollback", json!({ "rolled_back": false, "error": e.to_string() }))
                });
                self.finish_agent(&agent, false).await;
                format!("deployment smoke tests failed; rollback failed: {e}")
            }
        };
        Ok(Flow::Failed(reason))
    }

    async fn custom(&self, id: Uuid, task: &DeliveryTask) -> Result<Flow> {
        let mut previous = serde_json::Value::Null;
        for step in &task.steps {
            let input = json!({
                "input": task.input,
                "step": step.input,
                "previous": previous,
            });
            previous = self
                .step(id, task, step.phase, step.agent_type, &step.action, input)
                .await?;
        }
        Ok(Flow::Completed)
    }

    // -- Steps --------------------------------------------------------------

    async fn step(
        &self,
        id: Uuid,
        task: &DeliveryTask,
        phase: WorkflowPhase,
        agent_type: AgentType,
        action: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let (_, result) = self
            .step_with_agent(id, task, phase, agent_type, action, input)
            .await?;
        Ok(result)
    }

    /// Enter `phase`, spawn an agent, run one action on it and retire it.
    async fn step_with_agent(
        &self,
        id: Uuid,
        task: &DeliveryTask,
        phase: WorkflowPhase,
        agent_type: AgentType,
        action: &str,
        input: serde_json::Value,
    ) -> Result<(Uuid, serde_json::Value)> {
        let config = json!({ "workflow_id": id, "phase": phase, "action": action });
        let mut agent = self.enter(id, task, phase, agent_type, config).await?;
        match self.run_on(&mut agent, action, input).await {
            Ok(result) => {
                self.record_result(&agent, action, &result).await;
                self.finish_agent(&agent, true).await;
                Ok((agent.agent_id, result))
            }
            Err(e) => {
                self.finish_agent(&agent, false).await;
                Err(e)
            }
        }
    }

    /// Phase boundary: honour pause/cancel, advance the phase, announce an
    /// approval gate and spawn the phase's agent.
    async fn enter(
        &self,
        id: Uuid,
        task: &DeliveryTask,
        phase: WorkflowPhase,
        agent_type: AgentType,
        config: serde_json::Value,
    ) -> Result<StepAgent> {
        self.registry.boundary(id).await?;
        let attempt = self
            .registry
            .update(id, |w| w.advance(phase).map(|()| w.retry_count + 1))
            .ok_or(OrchestratorError::UnknownWorkflow(id))??;

        if task.autonomy.is_gate(phase) {
            warn!(workflow_id = %id, %phase, "approval gate reached, proceeding without sign-off");
            self.bus.emit(EventKind::ApprovalGateReached {
                workflow_id: id,
                phase,
            });
        }
        info!(workflow_id = %id, %phase, attempt, "phase started");
        self.bus.emit(EventKind::PhaseStarted {
            workflow_id: id,
            phase,
            attempt,
        });

        let link = PipelineLink {
            workflow_id: id,
            phase,
        };
        let agent_id = self
            .dispatch
            .spawn(link, agent_type, &task.tenant_id, config)
            .await?;
        self.registry
            .update(id, |w| w.record_agent(phase, agent_id, agent_type, None));
        self.bus.emit(EventKind::AgentSpawned {
            workflow_id: id,
            phase,
            agent_id,
            agent_type,
        });

        let agent = StepAgent {
            workflow_id: id,
            phase,
            agent_id,
            agent_type,
            tenant_id: task.tenant_id.clone(),
        };
        self.recovery
            .register_session(SessionInfo {
                session_id: agent.session_id(),
                agent_id,
                agent_type,
                tenant_id: task.tenant_id.clone(),
                workflow_id: Some(id),
                task_id: Some(task.id),
                phase: Some(phase),
            })
            .await;
        Ok(agent)
    }

    /// Execute `action` on the phase's agent. A failed job is handed to
    /// failure recovery: a replacement agent reruns the action, an
    /// escalation waits for the operator. If recovery replaced the agent
    /// while the call was in flight (a stall or a timeout), the call's
    /// outcome is discarded and the action reruns on the replacement.
    async fn run_on(
        &self,
        agent: &mut StepAgent,
        action: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let task = AgentTask::new(action, input);
        loop {
            self.adopt_replacement(agent).await;
            let executed = self
                .dispatch
                .execute(agent.link(), agent.agent_id, agent.agent_type, &agent.tenant_id, &task)
                .await;
            let called = agent.agent_id;
            if self.adopt_replacement(agent).await {
                warn!(workflow_id = %agent.workflow_id, phase = %agent.phase, replaced = %called, %action, "agent replaced mid-call, discarding its outcome");
                continue;
            }

            let err = match executed {
                Ok(result) => return Ok(result),
                Err(err @ OrchestratorError::JobFailed { .. }) => err,
                Err(err) => return Err(err),
            };

            let Some(outcome) = self
                .recovery
                .on_process_exit(&agent.session_id(), None, None)
                .await
            else {
                return Err(err);
            };
            if outcome.success && outcome.replacement.is_some() {
                info!(workflow_id = %agent.workflow_id, phase = %agent.phase, failed = %agent.agent_id, "rerunning on replacement agent");
                continue;
            }

            let paused = matches!(
                self.registry.control(agent.workflow_id),
                Some(Control::Paused(_))
            );
            if outcome.escalated() && paused {
                warn!(workflow_id = %agent.workflow_id, phase = %agent.phase, "escalated, waiting for operator");
                self.registry.boundary(agent.workflow_id).await?;
                continue;
            }
            return Err(err);
        }
    }

    /// Switch `agent` to whichever agent now serves its session. Returns
    /// `true` when recovery had put a different agent there.
    async fn adopt_replacement(&self, agent: &mut StepAgent) -> bool {
        let Some(current) = self.recovery.current_agent(&agent.session_id()).await else {
            return false;
        };
        if current.agent_id == agent.agent_id {
            return false;
        }
        let replaced = agent.agent_id;
        agent.agent_id = current.agent_id;
        agent.agent_type = current.agent_type;
        self.registry.update(agent.workflow_id, |w| {
            w.record_agent(agent.phase, agent.agent_id, agent.agent_type, Some(replaced))
        });
        self.bus.emit(EventKind::AgentSpawned {
            workflow_id: agent.workflow_id,
            phase: agent.phase,
            agent_id: agent.agent_id,
            agent_type: agent.agent_type,
        });
        info!(workflow_id = %agent.workflow_id, phase = %agent.phase, %replaced, replacement = %agent.agent_id, "adopted replacement agent");
        true
    }

    // -- Bookkeeping --------------------------------------------------------

    async fn record_result(&self, agent: &StepAgent, action: &str, result: &serde_json::Value) {
        self.registry.update(agent.workflow_id, |w| {
            w.set_result(agent.phase.as_str(), result.clone())
        });
        let snapshot = json!({
            "workflow_id": agent.workflow_id,
            "phase": agent.phase,
            "action": action,
            "result": result,
        });
        if let Err(e) = self
            .context
            .save_context(agent.agent_id, &agent.tenant_id, &snapshot)
            .await
        {
            warn!(workflow_id = %agent.workflow_id, agent_id = %agent.agent_id, error = %e, "context save failed");
        }
    }

    async fn finish_agent(&self, agent: &StepAgent, ok: bool) {
        let done = if ok {
            self.agents.complete(agent.agent_id, &agent.tenant_id).await
        } else {
            self.agents.fail(agent.agent_id, &agent.tenant_id).await
        };
        if let Err(e) = done {
            warn!(agent_id = %agent.agent_id, error = %e, "could not retire agent");
        }
        if ok {
            self.bus.emit(EventKind::AgentCompleted {
                workflow_id: agent.workflow_id,
                phase: agent.phase,
                agent_id: agent.agent_id,
            });
        }
    }

    async fn report_implementation(
        &self,
        id: Uuid,
        task: &DeliveryTask,
        agent_id: Uuid,
        result: &ImplementationResult,
    ) -> Option<Uuid> {
        let session = session_id(id, WorkflowPhase::Implementation);
        let mut refreshed = None;
        for path in &result.files_changed {
            let Some(outcome) = self.recovery.on_file_modified(&session, path).await else {
                continue;
            };
            warn!(workflow_id = %id, strategy = %outcome.strategy, success = outcome.success, "edit loop detected");
            let Some(replacement) = outcome.replacement.filter(|_| outcome.success) else {
                continue;
            };
            self.registry.update(id, |w| {
                w.record_agent(
                    WorkflowPhase::Implementation,
                    replacement.agent_id,
                    replacement.agent_type,
                    Some(agent_id),
                )
            });
            // The replacement only carries the refreshed context into the
            // next implementation attempt.
            if let Err(e) = self.agents.terminate(replacement.agent_id, &task.tenant_id).await {
                warn!(agent_id = %replacement.agent_id, error = %e, "could not retire refreshed agent");
            }
            refreshed = Some(replacement.agent_id);
        }
        if result.commit_sha.is_some() || !result.files_changed.is_empty() {
            self.recovery
                .record_checkpoint(Checkpoint {
                    revision: result.commit_sha.clone(),
                    branch: result.branch.clone(),
                    files: result.files_changed.clone(),
                    ..Checkpoint::new(&SessionInfo {
                        session_id: session,
                        agent_id,
                        agent_type: AgentType::Dev,
                        tenant_id: task.tenant_id.clone(),
                        workflow_id: Some(id),
                        task_id: Some(task.id),
                        phase: Some(WorkflowPhase::Implementation),
                    })
                })
                .await;
        }
        refreshed
    }

    async fn prior_context(&self, agent_id: Uuid, tenant_id: &str) -> Option<serde_json::Value> {
        match self.context.recover_context(agent_id, tenant_id).await {
            Ok(found) => found.map(|c| c.context),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "could not recover previous context");
                None
            }
        }
    }

    /// Move the workflow to its terminal phase.
    fn finish(&self, id: Uuid, flow: Result<Flow>) {
        let phase = self.registry.get(id).map(|w| w.phase);
        let failure = match flow {
            Ok(Flow::Completed) => {
                let completed = self
                    .registry
                    .update(id, |w| w.advance(WorkflowPhase::Completed))
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                if completed {
                    info!(workflow_id = %id, "workflow completed");
                    self.bus.emit(EventKind::WorkflowCompleted { workflow_id: id });
                }
                None
            }
            Ok(Flow::Failed(reason)) => Some(reason),
            Err(OrchestratorError::Cancelled(_)) => Some("workflow cancelled".to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let (Some(error), Some(phase)) = (failure, phase) {
            if !phase.is_terminal() {
                self.bus.emit(EventKind::PhaseFailed {
                    workflow_id: id,
                    phase,
                    error: error.clone(),
                });
            }
            self.registry.fail(id, &error);
        }
    }

    /// Stop monitoring the workflow's sessions. A replacement that recovery
    /// started after its phase had already finished is never adopted, so it
    /// is terminated here.
    async fn release_sessions(&self, state: &WorkflowState) {
        for phase in state.agents.keys() {
            let session = session_id(state.id, *phase);
            if let Some(current) = self.recovery.current_agent(&session).await {
                let known = state
                    .agent_history
                    .iter()
                    .any(|r| r.agent_id == current.agent_id);
                if !known {
                    warn!(workflow_id = %state.id, %phase, agent_id = %current.agent_id, "terminating unadopted replacement agent");
                    if let Err(e) = self.agents.terminate(current.agent_id, &current.tenant_id).await {
                        warn!(agent_id = %current.agent_id, error = %e, "could not terminate replacement agent");
                    }
                }
            }
            self.recovery.unregister_session(&session).await;
        }
    }
}
