use mediator_core::model::{ActionRequest, ActionType, CiaaAxis};
use mediator_runtime::{MediatorConfig, Runtime};
use std::collections::BTreeMap;

fn config_with_policies(dir: &std::path::Path, yaml: &str) -> MediatorConfig {
    let policy_path = dir.join("policies.yaml");
    std::fs::write(&policy_path, yaml).unwrap();
    MediatorConfig {
        audit_log_dir: dir.display().to_string(),
        policy_file_path: Some(policy_path.display().to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn deny_external_http_and_allow_internal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_policies(
        dir.path(),
        r#"
policies:
  - id: deny_external_http
    applies_to: [tool_call, api_call, network_request]
    condition: { target: { pattern: "^https://example\\.com" } }
    decision: DENY
    reason: Block external HTTP calls
    priority: 10
"#,
    );
    let runtime = Runtime::new(config).unwrap();

    let mut params = BTreeMap::new();
    params.insert("data".to_string(), serde_json::json!("x"));
    let action = ActionRequest::new("a1", ActionType::ToolCall, "https://example.com/x")
        .with_parameters(params)
        .with_declared_goal("g");
    let decision = runtime.intercept(action);
    assert!(!decision.allow);
    assert_eq!(decision.policy_id, "deny_external_http");

    let action = ActionRequest::new("a1", ActionType::ToolCall, "http://localhost/x");
    let decision = runtime.intercept(action);
    assert!(decision.allow);
}

#[tokio::test]
async fn ciaa_integrity_violation_without_any_policy() {
    let dir = tempfile::tempdir().unwrap();
    let config = MediatorConfig { audit_log_dir: dir.path().display().to_string(), ..Default::default() };
    let runtime = Runtime::new(config).unwrap();

    let action = ActionRequest::new("a1", ActionType::FileWrite, "/etc/passwd");
    let decision = runtime.intercept(action);
    assert!(!decision.allow);
    assert!(decision.ciaa_violations.contains_key(&CiaaAxis::Integrity));
}

#[tokio::test]
async fn audit_chain_survives_tampering_detection() {
    let dir = tempfile::tempdir().unwrap();
    let config = MediatorConfig { audit_log_dir: dir.path().display().to_string(), ..Default::default() };
    let runtime = Runtime::new(config).unwrap();

    for i in 0..3 {
        let action = ActionRequest::new("a1", ActionType::ToolCall, format!("t{i}"));
        runtime.intercept(action);
    }
    assert!(runtime.verify_audit_chain());

    let log_path = dir.path().join(format!(
        "audit_{}.log",
        {
            let days = mediator_core::ids::now_ms() / 86_400_000;
            let _ = days;
            std::fs::read_dir(dir.path())
                .unwrap()
                .find_map(|e| {
                    let e = e.unwrap();
                    let name = e.file_name().into_string().unwrap();
                    name.strip_prefix("audit_").map(|s| s.strip_suffix(".log").unwrap().to_string())
                })
                .unwrap()
        }
    ));
    let contents = std::fs::read_to_string(&log_path).unwrap();
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let mut second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    second["action_request"]["target"] = serde_json::json!("tampered");
    lines[1] = serde_json::to_string(&second).unwrap();
    std::fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    assert!(!runtime.verify_audit_chain());
}

#[tokio::test]
async fn learner_round_trip_produces_a_deny_suggestion() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_policies(
        dir.path(),
        r#"
policies:
  - id: deny_external_http
    applies_to: [tool_call]
    condition: { target: { pattern: "https?://.*" } }
    decision: DENY
    reason: blocked
    priority: 10
"#,
    );
    let runtime = Runtime::new(config).unwrap();

    for _ in 0..10 {
        let mut params = BTreeMap::new();
        params.insert("url".to_string(), serde_json::json!("https://evil"));
        let action = ActionRequest::new("agent-m", ActionType::ToolCall, "http_request").with_parameters(params);
        runtime.intercept(action);
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let suggestions = runtime.learner_suggestions(0.5);
    assert!(!suggestions.is_empty(), "expected at least one learned suggestion after 10 identical blocks");
}
