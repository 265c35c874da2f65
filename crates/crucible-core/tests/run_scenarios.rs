mod common;

use common::{config, service, store};
use crucible_core::errors::{ConfigurationError, EngineError};
use crucible_core::model::{ResultStatus, RunStatus};
use crucible_core::providers::target::fake::FakeInvoker;
use crucible_core::providers::target::InvokerRegistry;
use crucible_core::TenantContext;
use std::sync::Arc;

fn prompts(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{:.2} case-{i}", 0.5 + 0.05 * i as f64)).collect()
}

#[tokio::test]
async fn all_units_succeed_run_completes_with_mean() {
    let svc = service(store(), Arc::new(FakeInvoker::echo()), 2);
    let tenant = TenantContext::new("acme", "alice");
    let cfg = config("scenario-a", "parallel", &prompts(10));

    let run_id = svc.run_configuration(&cfg, &tenant).await.unwrap();
    let run = svc.wait_for_run(&run_id, &tenant).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_tests, 10);
    assert_eq!(run.failed_tasks, 0);
    assert_eq!(run.completed_tests + run.failed_tasks, run.total_tests);

    let expected: f64 = (0..10).map(|i| 0.5 + 0.05 * i as f64).sum::<f64>() / 10.0;
    let mean = run.attributes.aggregated_metrics["quality"];
    assert!((mean - expected).abs() < 1e-6, "mean {mean} != {expected}");

    let results = svc.results(&run_id, &tenant).unwrap();
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.status == ResultStatus::Pass));
}

#[tokio::test]
async fn units_failing_every_attempt_make_run_partial() {
    let p = prompts(10);
    let fake = FakeInvoker::echo()
        .with_failure(p[1].clone())
        .with_failure(p[4].clone())
        .with_failure(p[7].clone());
    let svc = service(store(), Arc::new(fake), 2);
    let tenant = TenantContext::new("acme", "alice");

    let run_id = svc
        .run_configuration(&config("scenario-b", "parallel", &p), &tenant)
        .await
        .unwrap();
    let run = svc.wait_for_run(&run_id, &tenant).await.unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.failed_tasks, 3);
    assert_eq!(run.completed_tests, 7);
    assert_eq!(run.completed_tests + run.failed_tasks, run.total_tests);

    let results = svc.results(&run_id, &tenant).unwrap();
    let failed: Vec<_> = results.iter().filter(|r| r.status == ResultStatus::Error).collect();
    assert_eq!(failed.len(), 3);
    for r in failed {
        assert_eq!(r.attempts.len(), 2, "{} should have used both attempts", r.test_case_id);
        assert!(r.error.as_deref().unwrap().starts_with("execution_error"));
    }
}

#[tokio::test]
async fn all_units_failing_fails_the_run() {
    let p = prompts(10);
    let fake = p.iter().fold(FakeInvoker::echo(), |f, prompt| f.with_failure(prompt.clone()));
    let svc = service(store(), Arc::new(fake), 1);
    let tenant = TenantContext::new("acme", "alice");

    let run_id = svc
        .run_configuration(&config("scenario-c", "parallel", &p), &tenant)
        .await
        .unwrap();
    let run = svc.wait_for_run(&run_id, &tenant).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_tasks, 10);
    assert!(run.attributes.aggregated_metrics.is_empty());
    assert!(run.last_error.is_some());
}

#[tokio::test]
async fn empty_configuration_is_rejected_before_a_run_exists() {
    let svc = service(store(), Arc::new(FakeInvoker::echo()), 1);
    let tenant = TenantContext::new("acme", "alice");
    let cfg = config("scenario-d", "parallel", &[]);

    let err = svc.run_configuration(&cfg, &tenant).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::EmptyTestSet { .. })
    ));
    assert!(svc.list_runs(&tenant, 10).unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_target_kind_is_rejected_before_a_run_exists() {
    let fake = Arc::new(FakeInvoker::echo());
    let registry = InvokerRegistry::new().with(fake.clone());
    let svc = service(store(), Arc::new(registry), 1);
    let tenant = TenantContext::new("acme", "alice");
    let mut cfg = config("grpc-target", "parallel", &prompts(2));
    if let Some(target) = cfg.target.as_mut() {
        target.kind = "grpc".into();
    }

    let err = svc.run_configuration(&cfg, &tenant).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::UnresolvableTarget { .. })
    ));
    assert!(svc.list_runs(&tenant, 10).unwrap().is_empty());
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn unreachable_metric_backend_is_isolated() {
    let raw = r#"
id: scenario-e
target: {name: echo}
metrics:
  quality: {class: leading_number, backend: local, threshold: 0.5}
  faithfulness: {class: faithfulness, backend: remote}
tests:
  - {id: only, prompt: "0.9 grounded answer", metrics: [quality, faithfulness]}
"#;
    let cfg = crucible_core::config::parse_config(raw, "inline").unwrap();
    let svc = service(store(), Arc::new(FakeInvoker::echo()), 1);
    let tenant = TenantContext::new("acme", "alice");

    let run_id = svc.run_configuration(&cfg, &tenant).await.unwrap();
    let run = svc.wait_for_run(&run_id, &tenant).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let results = svc.results(&run_id, &tenant).unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];

    let broken = &r.metrics["faithfulness"];
    assert!(!broken.is_successful);
    assert!(broken.evaluation_failed);
    assert!(broken.reason.contains("connection refused"));

    let valid = &r.metrics["quality"];
    assert!(valid.is_successful);
    assert!((valid.score - 0.9).abs() < 1e-9);

    // status comes from the metric that scored
    assert_eq!(r.status, ResultStatus::Pass);
    assert_eq!(run.attributes.aggregated_metrics.len(), 1);
}

#[tokio::test]
async fn low_scores_fail_the_case_but_complete_the_unit() {
    let p = vec!["0.2 weak".to_string(), "0.8 strong".to_string()];
    let svc = service(store(), Arc::new(FakeInvoker::echo()), 1);
    let tenant = TenantContext::new("acme", "alice");

    let run_id = svc
        .run_configuration(&config("thresholds", "sequential", &p), &tenant)
        .await
        .unwrap();
    let run = svc.wait_for_run(&run_id, &tenant).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let summary = svc.summary(&run_id, &tenant).unwrap();
    assert_eq!(summary.pass, 1);
    assert_eq!(summary.fail, 1);
    assert!((summary.aggregated_metrics["quality"] - 0.5).abs() < 1e-9);
}
