use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AgentType
// ---------------------------------------------------------------------------

/// The kind of agent implementation a unit of work is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Planner,
    Dev,
    Qa,
    Devops,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::Planner,
        AgentType::Dev,
        AgentType::Qa,
        AgentType::Devops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Planner => "planner",
            AgentType::Dev => "dev",
            AgentType::Qa => "qa",
            AgentType::Devops => "devops",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown agent type: {0}")]
pub struct UnknownAgentType(pub String);

impl FromStr for AgentType {
    type Err = UnknownAgentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planner" => Ok(AgentType::Planner),
            "dev" | "developer" => Ok(AgentType::Dev),
            "qa" => Ok(AgentType::Qa),
            "devops" => Ok(AgentType::Devops),
            other => Err(UnknownAgentType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowPhase
// ---------------------------------------------------------------------------

/// Phase of an orchestrated delivery workflow.
///
/// Phases advance monotonically (Planning -> Implementation -> QA ->
/// Deployment -> Completed) except for the bounded Implementation <-> QA
/// retry loop. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Planning,
    Implementation,
    Qa,
    Deployment,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Planning => "planning",
            WorkflowPhase::Implementation => "implementation",
            WorkflowPhase::Qa => "qa",
            WorkflowPhase::Deployment => "deployment",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }

    /// Returns `true` when moving from `self` to `next` is allowed.
    pub fn can_advance_to(&self, next: WorkflowPhase) -> bool {
        use WorkflowPhase::*;
        matches!(
            (self, next),
            (Planning, Implementation)
                | (Planning, Deployment)
                | (Implementation, Qa)
                | (Qa, Implementation)
                | (Qa, Deployment)
                | (Qa, Completed)
                | (Implementation, Completed)
                | (Deployment, Completed)
                | (Planning, Completed)
        ) || (!self.is_terminal() && next == Failed)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FailureType
// ---------------------------------------------------------------------------

/// Classification of an agent failure raised by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Process exited non-zero or was killed by a signal.
    Crash,
    /// An external activity monitor reported a stall.
    Stuck,
    /// Too many file modifications without a passing test run.
    Loop,
    /// Session outlived its maximum duration.
    Timeout,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureType::Crash => "crash",
            FailureType::Stuck => "stuck",
            FailureType::Loop => "loop",
            FailureType::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Typed agent results
// ---------------------------------------------------------------------------

/// Output of a planner's `create-plan` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub stories: Vec<String>,
}

/// Output of a developer's `implement-story` / `fix-bug` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "filesChanged")]
    pub files_changed: Vec<String>,
    #[serde(default, alias = "commitSha")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Output of a QA agent's `run-tests` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl TestReport {
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }
}

/// Output of a DevOps agent's `deploy` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    #[serde(default)]
    pub deployed: bool,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default, alias = "smokeTestsPassed")]
    pub smoke_tests_passed: bool,
    #[serde(default)]
    pub url: Option<String>,
}

/// Output of a DevOps agent's `rollback` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    #[serde(default, alias = "rolledBack")]
    pub rolled_back: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Task actions
// ---------------------------------------------------------------------------

/// Well-known task actions understood by the built-in workflows.
pub mod actions {
    pub const CREATE_PLAN: &str = "create-plan";
    pub const IMPLEMENT_STORY: &str = "implement-story";
    pub const FIX_BUG: &str = "fix-bug";
    pub const RUN_TESTS: &str = "run-tests";
    pub const DEPLOY: &str = "deploy";
    pub const ROLLBACK: &str = "rollback";
}
