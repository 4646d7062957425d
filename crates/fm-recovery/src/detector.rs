use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fm_core::config::FailureConfig;
use fm_core::event_bus::EventBus;
use fm_core::events::EventKind;
use fm_core::types::FailureType;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{AgentFailure, SessionInfo};

#[derive(Debug, Clone)]
struct SessionState {
    info: SessionInfo,
    started_at: DateTime<Utc>,
    /// File modifications since the last passing test run.
    modifications: u32,
    timed_out: bool,
}

/// Turns activity signals from an external monitor into typed failures.
///
/// Sessions must be registered before their signals count; signals for
/// unknown sessions are logged and dropped. The active-failure set is owned
/// here and only ever handed out as copies.
pub struct FailureDetector {
    sessions: DashMap<String, SessionState>,
    active: DashMap<Uuid, AgentFailure>,
    loop_threshold: u32,
    max_session: Duration,
    bus: EventBus,
}

impl FailureDetector {
    pub fn new(cfg: &FailureConfig, bus: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            active: DashMap::new(),
            loop_threshold: cfg.loop_threshold.max(1),
            max_session: cfg.max_session(),
            bus,
        }
    }

    // -- Sessions -----------------------------------------------------------

    /// Start monitoring a session. Registering a known session again swaps
    /// in the new agent and restarts its clock, but keeps the modification
    /// count so loops are caught across retries.
    pub fn register_session(&self, info: SessionInfo) {
        info!(session_id = %info.session_id, agent_id = %info.agent_id, agent_type = %info.agent_type, "session registered");
        let modifications = self
            .sessions
            .get(&info.session_id)
            .map(|s| s.modifications)
            .unwrap_or(0);
        self.sessions.insert(
            info.session_id.clone(),
            SessionState {
                info,
                started_at: Utc::now(),
                modifications,
                timed_out: false,
            },
        );
    }

    /// Stop monitoring a session and drop its unresolved failures. Returns
    /// `false` if it was not registered.
    pub fn unregister_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        let before = self.active.len();
        self.active.retain(|_, f| f.session_id != session_id);
        let dropped = before.saturating_sub(self.active.len());
        if removed {
            debug!(session_id, dropped_failures = dropped, "session unregistered");
        }
        removed
    }

    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| s.info.clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info.clone()).collect()
    }

    /// Point a session at the agent that replaced the failed one. The
    /// session clock restarts with it.
    pub fn replace_agent(&self, session_id: &str, agent: SessionInfo) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.info.agent_id = agent.agent_id;
            state.info.agent_type = agent.agent_type;
            state.started_at = Utc::now();
            state.modifications = 0;
            state.timed_out = false;
        }
    }

    // -- Signals ------------------------------------------------------------

    /// A process exited. Exit code 0 without a signal is not a failure.
    pub fn on_process_exit(
        &self,
        session_id: &str,
        exit_code: Option<i32>,
        signal: Option<&str>,
    ) -> Option<AgentFailure> {
        if exit_code == Some(0) && signal.is_none() {
            debug!(session_id, "process exited cleanly");
            return None;
        }
        let details = match (exit_code, signal) {
            (_, Some(sig)) => format!("process killed by signal {sig}"),
            (Some(code), None) => format!("process exited with code {code}"),
            (None, None) => "process exited abnormally".to_string(),
        };
        self.raise(session_id, FailureType::Crash, details)
    }

    pub fn on_stall(&self, session_id: &str, reason: &str) -> Option<AgentFailure> {
        self.raise(session_id, FailureType::Stuck, format!("stalled: {reason}"))
    }

    /// Count a file modification; crossing the loop threshold without a
    /// passing test raises a loop failure and restarts the count.
    pub fn on_file_modified(&self, session_id: &str, path: &str) -> Option<AgentFailure> {
        let count = {
            let Some(mut state) = self.sessions.get_mut(session_id) else {
                warn!(session_id, path, "file modification for unknown session");
                return None;
            };
            state.modifications += 1;
            if state.modifications < self.loop_threshold {
                return None;
            }
            std::mem::take(&mut state.modifications)
        };
        self.raise(
            session_id,
            FailureType::Loop,
            format!("{count} file modifications without a passing test run"),
        )
    }

    pub fn on_test_run(&self, session_id: &str, passed: bool) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            if passed {
                state.modifications = 0;
            }
            debug!(session_id, passed, "test run observed");
        }
    }

    /// Raise a timeout for every session older than the configured maximum.
    /// Each session times out at most once per agent.
    pub fn check_timeouts(&self) -> Vec<AgentFailure> {
        self.session_ids()
            .iter()
            .filter_map(|session_id| self.check_timeout(session_id))
            .collect()
    }

    /// Raise a timeout if `session_id` has outlived the configured maximum
    /// and has not already timed out under its current agent.
    pub fn check_timeout(&self, session_id: &str) -> Option<AgentFailure> {
        let secs = {
            let mut state = self.sessions.get_mut(session_id)?;
            let elapsed = Utc::now()
                .signed_duration_since(state.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if state.timed_out || elapsed <= self.max_session {
                return None;
            }
            state.timed_out = true;
            elapsed.as_secs()
        };
        self.raise(
            session_id,
            FailureType::Timeout,
            format!("session running for {secs}s"),
        )
    }

    fn raise(
        &self,
        session_id: &str,
        failure_type: FailureType,
        details: String,
    ) -> Option<AgentFailure> {
        let Some(info) = self.session(session_id) else {
            warn!(session_id, %failure_type, "failure signal for unknown session");
            return None;
        };
        let failure = AgentFailure::new(failure_type, &info, details);
        warn!(
            failure_id = %failure.id,
            session_id,
            agent_id = %failure.agent_id,
            %failure_type,
            details = %failure.details,
            "agent failure detected"
        );
        self.active.insert(failure.id, failure.clone());
        self.bus.emit(EventKind::FailureDetected {
            failure_id: failure.id,
            failure_type,
            session_id: session_id.to_string(),
            agent_id: failure.agent_id,
        });
        Some(failure)
    }

    // -- Active failures ----------------------------------------------------

    /// Mark a failure resolved and drop it from the active set.
    pub fn resolve(&self, failure_id: Uuid) -> Option<AgentFailure> {
        let (_, mut failure) = self.active.remove(&failure_id)?;
        failure.resolved = true;
        info!(failure_id = %failure_id, session_id = %failure.session_id, "failure resolved");
        Some(failure)
    }

    pub fn get_failure(&self, failure_id: Uuid) -> Option<AgentFailure> {
        self.active.get(&failure_id).map(|f| f.clone())
    }

    /// Unresolved failures, oldest first, optionally for one session.
    pub fn get_active_failures(&self, session_id: Option<&str>) -> Vec<AgentFailure> {
        let mut failures: Vec<AgentFailure> = self
            .active
            .iter()
            .filter(|f| session_id.map_or(true, |s| f.session_id == s))
            .map(|f| f.clone())
            .collect();
        failures.sort_by_key(|f| f.detected_at);
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::AgentType;

    fn detector(loop_threshold: u32, max_session_secs: u64) -> FailureDetector {
        let cfg = FailureConfig {
            loop_threshold,
            max_session_secs,
            ..FailureConfig::default()
        };
        FailureDetector::new(&cfg, EventBus::new())
    }

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: id.to_string(),
            agent_id: Uuid::new_v4(),
            agent_type: AgentType::Dev,
            tenant_id: "t1".into(),
            workflow_id: None,
            task_id: None,
            phase: None,
        }
    }

    #[test]
    fn clean_exit_is_not_a_crash() {
        let d = detector(20, 3600);
        d.register_session(session("s"));
        assert!(d.on_process_exit("s", Some(0), None).is_none());
        let crash = d.on_process_exit("s", Some(137), None).unwrap();
        assert_eq!(crash.failure_type, FailureType::Crash);
        let signalled = d.on_process_exit("s", Some(0), Some("SIGKILL")).unwrap();
        assert!(signalled.details.contains("SIGKILL"));
        assert_eq!(d.get_active_failures(Some("s")).len(), 2);
    }

    #[test]
    fn loop_needs_threshold_without_passing_test() {
        let d = detector(3, 3600);
        d.register_session(session("s"));
        assert!(d.on_file_modified("s", "a.rs").is_none());
        assert!(d.on_file_modified("s", "a.rs").is_none());
        d.on_test_run("s", true);
        assert!(d.on_file_modified("s", "a.rs").is_none());
        assert!(d.on_file_modified("s", "a.rs").is_none());
        d.on_test_run("s", false);
        let failure = d.on_file_modified("s", "a.rs").unwrap();
        assert_eq!(failure.failure_type, FailureType::Loop);
        // The count restarts after a loop is raised.
        assert!(d.on_file_modified("s", "a.rs").is_none());
    }

    #[test]
    fn signals_for_unknown_sessions_are_dropped() {
        let d = detector(1, 3600);
        assert!(d.on_stall("ghost", "no output").is_none());
        assert!(d.on_file_modified("ghost", "x").is_none());
        assert!(d.get_active_failures(None).is_empty());
    }

    #[test]
    fn timeout_fires_once_per_session() {
        let d = detector(20, 0);
        d.register_session(session("s"));
        std::thread::sleep(Duration::from_millis(5));
        let first = d.check_timeouts();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].failure_type, FailureType::Timeout);
        assert!(d.check_timeouts().is_empty());
    }

    #[test]
    fn resolve_removes_from_active_set() {
        let d = detector(20, 3600);
        d.register_session(session("s"));
        let failure = d.on_stall("s", "idle").unwrap();
        let resolved = d.resolve(failure.id).unwrap();
        assert!(resolved.resolved);
        assert!(d.get_active_failures(None).is_empty());
        assert!(d.resolve(failure.id).is_none());
    }

    #[test]
    fn unregistering_drops_the_session_failures() {
        let d = detector(20, 3600);
        d.register_session(session("a"));
        d.register_session(session("b"));
        d.on_stall("a", "idle").unwrap();
        d.on_process_exit("a", Some(1), None).unwrap();
        let kept = d.on_stall("b", "idle").unwrap();

        assert!(d.unregister_session("a"));
        let left = d.get_active_failures(None);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, kept.id);
        assert!(!d.unregister_session("a"));
    }
}
