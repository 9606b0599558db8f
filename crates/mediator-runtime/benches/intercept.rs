use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mediator_core::model::{ActionRequest, ActionType};
use mediator_runtime::{MediatorConfig, Runtime};

fn bench_intercept(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policies.yaml");
    std::fs::write(
        &policy_path,
        r#"
policies:
  - id: deny_external_http
    applies_to: [tool_call, api_call, network_request]
    condition: { target: { pattern: "https?://.*" } }
    decision: DENY
    reason: Block external HTTP calls
    priority: 10
"#,
    )
    .unwrap();
    let mut config = MediatorConfig { audit_log_dir: dir.path().display().to_string(), ..Default::default() };
    config.policy_file_path = Some(policy_path.display().to_string());
    let runtime = rt.block_on(async { Runtime::new(config).unwrap() });

    let mut group = c.benchmark_group("intercept");
    group.bench_function("allow_internal", |b| {
        b.iter(|| {
            let action = ActionRequest::new("agent-bench", ActionType::ToolCall, "http://localhost/x");
            let _ = black_box(runtime.intercept(action));
        })
    });
    group.bench_function("deny_policy", |b| {
        b.iter(|| {
            let action = ActionRequest::new("agent-bench", ActionType::ToolCall, "https://example.com/x");
            let _ = black_box(runtime.intercept(action));
        })
    });
    group.finish();
}

criterion_group!(intercept, bench_intercept);
criterion_main!(intercept);
