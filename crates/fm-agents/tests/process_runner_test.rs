#![cfg(unix)]

use std::time::Duration;

use fm_agents::{Agent, AgentError, AgentRunner, AgentTask, ProcessRunner};
use fm_core::types::AgentType;
use serde_json::json;

fn sh(script: &str, timeout: Duration) -> ProcessRunner {
    ProcessRunner::new("sh", vec!["-c".into(), script.into()], timeout)
}

#[tokio::test]
async fn parses_result_and_receives_task_on_stdin() {
    // Echo the task action back inside the result object.
    let runner = sh(
        r#"read input; action=$(echo "$input" | sed 's/.*"action":"\([^"]*\)".*/\1/'); echo "working"; echo "{\"action\":\"$action\",\"failed\":0}""#,
        Duration::from_secs(10),
    );
    let agent = Agent::new("acme", AgentType::Qa);
    let result = runner
        .execute(&agent, &AgentTask::new("run-tests", json!({})))
        .await
        .unwrap();
    assert_eq!(result, json!({"action": "run-tests", "failed": 0}));
}

#[tokio::test]
async fn non_zero_exit_is_an_execution_error() {
    let runner = sh("echo boom >&2; exit 3", Duration::from_secs(10));
    let agent = Agent::new("acme", AgentType::Dev);
    let err = runner
        .execute(&agent, &AgentTask::new("fix-bug", json!({})))
        .await
        .unwrap_err();
    match err {
        AgentError::Execution(msg) => assert!(msg.contains("boom"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn slow_process_times_out() {
    let runner = sh("sleep 5", Duration::from_millis(100));
    let agent = Agent::new("acme", AgentType::Devops);
    let err = runner
        .execute(&agent, &AgentTask::new("deploy", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Timeout(_)));
}
