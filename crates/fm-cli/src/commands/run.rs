use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;
use fm_core::config::Config;
use fm_orchestrator::{DeliveryTask, Foreman, TaskKind, WorkflowStatus};
use fm_telemetry::metrics::MetricsCollector;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Task definition as a JSON file. Flags below are ignored when set.
    #[arg(long, conflicts_with_all = ["kind", "tenant"])]
    pub task_file: Option<PathBuf>,

    /// implement-feature, fix-bug, deploy, full-lifecycle or custom.
    #[arg(long, required_unless_present = "task_file")]
    pub kind: Option<String>,

    #[arg(long, required_unless_present = "task_file")]
    pub tenant: Option<String>,

    #[arg(long)]
    pub title: Option<String>,

    /// Inline JSON input handed to every agent.
    #[arg(long)]
    pub input: Option<String>,

    /// QA retry budget (default: workflow.max_retries).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Print Prometheus metrics for the run to stderr.
    #[arg(long)]
    pub metrics: bool,

    /// Also write the outcome JSON to this file.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

impl RunArgs {
    pub fn task(&self) -> anyhow::Result<DeliveryTask> {
        if let Some(path) = &self.task_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("{} is not a valid task", path.display()));
        }

        let (Some(kind), Some(tenant)) = (&self.kind, &self.tenant) else {
            bail!("--kind and --tenant are required without --task-file");
        };
        let kind: TaskKind = serde_json::from_value(serde_json::Value::String(kind.clone()))
            .with_context(|| format!("unknown task kind {kind:?}"))?;
        let mut task = DeliveryTask::new(tenant.clone(), kind);
        if let Some(title) = &self.title {
            task = task.with_title(title.clone());
        }
        if let Some(input) = &self.input {
            task = task.with_input(serde_json::from_str(input).context("--input is not JSON")?);
        }
        if let Some(max_retries) = self.max_retries {
            task = task.with_max_retries(max_retries);
        }
        Ok(task)
    }
}

pub async fn run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let task = args.task()?;
    let tenant = task.tenant_id.clone();

    let foreman = Foreman::open(config)
        .await
        .context("failed to open foreman storage")?;
    let events = foreman.event_bus().subscribe();
    let handles = foreman.start();

    let shutdown = foreman.shutdown_handle();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                shutdown.trigger();
            }
        }
    });

    let mut stop = shutdown.subscribe();
    let orchestrator = foreman.orchestrator().clone();
    let outcome = tokio::select! {
        outcome = orchestrator.execute_task(task) => Some(outcome),
        _ = stop.wait() => None,
    };

    let outcome = match outcome {
        Some(outcome) => outcome?,
        None => {
            for workflow in orchestrator.get_active_workflows(&tenant) {
                let cancelled = orchestrator.cancel_workflow(workflow.id).await;
                info!(workflow_id = %workflow.id, terminated = cancelled.terminated_agents.len(), "workflow cancelled on shutdown");
            }
            foreman.shutdown(handles).await;
            bail!("interrupted before the workflow finished");
        }
    };
    foreman.shutdown(handles).await;

    if args.metrics {
        let metrics = MetricsCollector::new();
        for event in events.drain() {
            metrics.record_event(&event);
        }
        eprint!("{}", metrics.export_prometheus());
    }

    let rendered = serde_json::to_string_pretty(&outcome)?;
    if let Some(path) = &args.out {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    println!("{rendered}");

    match outcome.status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Failed => bail!(
            "workflow {} failed: {}",
            outcome.workflow.id,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            task_file: None,
            kind: Some("deploy".into()),
            tenant: Some("acme".into()),
            title: Some("ship it".into()),
            input: Some(r#"{"environment":"staging"}"#.into()),
            max_retries: None,
            metrics: false,
            out: None,
        }
    }

    #[test]
    fn builds_task_from_flags() {
        let task = args().task().unwrap();
        assert_eq!(task.kind, TaskKind::Deploy);
        assert_eq!(task.title, "ship it");
        assert_eq!(task.input["environment"], "staging");
        assert_eq!(task.max_retries, None);
    }

    #[test]
    fn rejects_unknown_kind_and_bad_input() {
        let bad_kind = RunArgs {
            kind: Some("refactor".into()),
            ..args()
        };
        assert!(bad_kind.task().is_err());

        let bad_input = RunArgs {
            input: Some("{not json".into()),
            ..args()
        };
        assert!(bad_input.task().is_err());
    }

    #[test]
    fn reads_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.json");
        std::fs::write(
            &path,
            r#"{"tenantId":"acme","kind":"full-lifecycle","maxRetries":1}"#,
        )
        .unwrap();
        let task = RunArgs {
            task_file: Some(path),
            kind: None,
            tenant: None,
            ..args()
        }
        .task()
        .unwrap();
        assert_eq!(task.kind, TaskKind::FullLifecycle);
        assert_eq!(task.max_retries, Some(1));
    }
}
