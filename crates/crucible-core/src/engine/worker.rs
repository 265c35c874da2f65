use super::retry::RetryPolicy;
use crate::errors::{ErrorKind, ExecutionError};
use crate::evaluation::{MetricEngine, MetricPlan};
use crate::executor::{ExecutionOutcome, ExecutionRequest, ExecutorSelector};
use crate::metrics_api::ScoringInput;
use crate::model::{
    AttemptOutcome, AttemptRow, ExecutionUnit, MetricResult, ResultStatus, TargetRef, TestCase,
    TestConfiguration, TestResult, UnitOutcome, UnitProgress, UnitResolution,
};
use crate::storage::Repository;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::Instrument;

/// Per-run state shared read-only by every unit of that run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub config: Arc<TestConfiguration>,
    pub target: TargetRef,
    pub plan: Arc<MetricPlan>,
    pub policy: RetryPolicy,
}

/// Runs one unit end to end: execute with retries, score, persist, count.
///
/// Never returns an error. Whatever happens, the caller gets exactly one
/// [`UnitResolution`] back.
#[derive(Clone)]
pub struct UnitWorker {
    repo: Arc<dyn Repository>,
    selector: ExecutorSelector,
    metrics: MetricEngine,
}

#[derive(Default)]
struct AttemptLog {
    rows: Vec<AttemptRow>,
    in_flight: Option<(u32, Instant)>,
}

impl AttemptLog {
    fn begin(&mut self, attempt_no: u32) {
        self.in_flight = Some((attempt_no, Instant::now()));
    }

    fn finish(&mut self, outcome: AttemptOutcome, message: Option<String>) {
        if let Some((attempt_no, started)) = self.in_flight.take() {
            self.rows.push(AttemptRow {
                attempt_no,
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
                message,
            });
        }
    }
}

impl UnitWorker {
    pub fn new(repo: Arc<dyn Repository>, selector: ExecutorSelector, metrics: MetricEngine) -> Self {
        Self {
            repo,
            selector,
            metrics,
        }
    }

    pub async fn run_unit(&self, ctx: &RunContext, unit: ExecutionUnit) -> UnitResolution {
        let tenant = unit.tenant();
        let span = tracing::info_span!(
            "unit",
            run_id = %unit.run_id(),
            test_case_id = %unit.test_case_id(),
            org_id = %tenant.org_id(),
            user_id = %tenant.user_id(),
            correlation_id = %tenant.correlation_id(),
        );
        self.resolve(ctx, &unit).instrument(span).await
    }

    /// Resolution for a unit that never started because its run was stopped.
    pub fn skip_unit(&self, unit: &ExecutionUnit) -> UnitResolution {
        tracing::info!(
            run_id = %unit.run_id(),
            test_case_id = %unit.test_case_id(),
            org_id = %unit.tenant().org_id(),
            "run stopped; unit skipped"
        );
        self.count(unit, UnitProgress::Skipped);
        UnitResolution::Skipped {
            test_case_id: unit.test_case_id().to_string(),
        }
    }

    async fn resolve(&self, ctx: &RunContext, unit: &ExecutionUnit) -> UnitResolution {
        let started = Instant::now();
        let Some(tc) = ctx.config.test_case(unit.test_case_id()) else {
            let err = ExecutionError::UnknownTestCase(unit.test_case_id().to_string());
            return self.fail(unit, err, Vec::new(), started);
        };

        let log = Mutex::new(AttemptLog::default());
        let limit = ctx.policy.hard_time_limit;
        let result = match tokio::time::timeout(limit, self.execute_and_score(ctx, tc, unit, &log)).await {
            Ok(r) => r,
            Err(_) => Err(ExecutionError::HardTimeLimit {
                limit_secs: limit.as_secs(),
            }),
        };

        let mut log = log.into_inner().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = &result {
            // an attempt cut off by the hard limit never recorded itself
            log.finish(AttemptOutcome::TimedOut, Some(e.to_string()));
        }

        match result {
            Ok((outcome, metrics)) => self.succeed(unit, tc, outcome, metrics, log.rows),
            Err(e) => self.fail(unit, e, log.rows, started),
        }
    }

    async fn execute_and_score(
        &self,
        ctx: &RunContext,
        tc: &TestCase,
        unit: &ExecutionUnit,
        log: &Mutex<AttemptLog>,
    ) -> Result<(ExecutionOutcome, BTreeMap<String, MetricResult>), ExecutionError> {
        let outcome = self.execute_with_retries(ctx, tc, unit, log).await?;

        let (runnable, mut metrics) = ctx.plan.for_test_case(tc);
        let input = ScoringInput {
            input: tc.prompt.clone(),
            output: outcome.output.clone(),
            expected_output: tc.expected_output.clone(),
            context: tc.context.clone(),
        };
        metrics.extend(self.metrics.evaluate(&input, &runnable).await);
        Ok((outcome, metrics))
    }

    async fn execute_with_retries(
        &self,
        ctx: &RunContext,
        tc: &TestCase,
        unit: &ExecutionUnit,
        log: &Mutex<AttemptLog>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let executor = self.selector.select(tc);
        let soft = ctx.policy.soft_time_limit;
        let mut current = unit.clone();

        loop {
            current = current.next_attempt();
            let attempt = current.attempt_count();
            log.lock().unwrap().begin(attempt);

            let req = ExecutionRequest {
                unit: &current,
                test_case: tc,
                target: &ctx.target,
            };
            let res = match tokio::time::timeout(soft, executor.execute(req)).await {
                Ok(r) => r,
                Err(_) => Err(ExecutionError::SoftTimeLimit {
                    limit_secs: soft.as_secs(),
                }),
            };

            match res {
                Ok(outcome) => {
                    log.lock().unwrap().finish(AttemptOutcome::Ok, None);
                    tracing::debug!(attempt, modality = executor.modality().as_str(), "attempt succeeded");
                    return Ok(outcome);
                }
                Err(e) => {
                    let kind = if e.is_timeout() {
                        AttemptOutcome::TimedOut
                    } else {
                        AttemptOutcome::Error
                    };
                    log.lock().unwrap().finish(kind, Some(e.to_string()));

                    if !ctx.policy.should_retry(attempt, &e) {
                        return Err(e);
                    }
                    let delay = ctx.policy.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn succeed(
        &self,
        unit: &ExecutionUnit,
        tc: &TestCase,
        outcome: ExecutionOutcome,
        metrics: BTreeMap<String, MetricResult>,
        attempts: Vec<AttemptRow>,
    ) -> UnitResolution {
        let status = ResultStatus::from_metrics(&metrics);
        let result = TestResult {
            run_id: unit.run_id().to_string(),
            test_case_id: tc.id.clone(),
            output: Some(outcome.output),
            metrics: metrics.clone(),
            status,
            execution_time_ms: Some(outcome.execution_time_ms),
            attempts,
            transcript: outcome.transcript,
            error: None,
            created_at: Utc::now(),
        };
        self.persist(unit, &result);
        self.count(unit, UnitProgress::Succeeded);
        tracing::info!(status = status.as_str(), execution_time_ms = outcome.execution_time_ms, "unit resolved");

        UnitResolution::Succeeded(UnitOutcome {
            test_case_id: tc.id.clone(),
            status,
            execution_time_ms: outcome.execution_time_ms,
            metrics,
        })
    }

    fn fail(
        &self,
        unit: &ExecutionUnit,
        err: ExecutionError,
        attempts: Vec<AttemptRow>,
        started: Instant,
    ) -> UnitResolution {
        tracing::warn!(
            error = %err,
            kind = err.kind(),
            attempts = attempts.len(),
            "unit failed"
        );
        let result = TestResult {
            run_id: unit.run_id().to_string(),
            test_case_id: unit.test_case_id().to_string(),
            output: None,
            metrics: BTreeMap::new(),
            status: ResultStatus::Error,
            execution_time_ms: Some(started.elapsed().as_millis() as u64),
            attempts,
            transcript: Vec::new(),
            error: Some(format!("{}: {}", err.kind(), err)),
            created_at: Utc::now(),
        };
        self.persist(unit, &result);
        self.count(unit, UnitProgress::Failed);

        UnitResolution::Failed {
            test_case_id: unit.test_case_id().to_string(),
            reason: err.to_string(),
        }
    }

    fn persist(&self, unit: &ExecutionUnit, result: &TestResult) {
        match self.repo.save_result(unit.tenant(), result) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("result not recorded; duplicate or run no longer in progress"),
            Err(e) => self.storage_failure(unit, "save result", &e),
        }
    }

    fn count(&self, unit: &ExecutionUnit, progress: UnitProgress) {
        match self.repo.record_progress(unit.tenant(), unit.run_id(), progress) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(?progress, "progress not recorded; run is no longer in progress"),
            Err(e) => self.storage_failure(unit, "record progress", &e),
        }
    }

    fn storage_failure(&self, unit: &ExecutionUnit, op: &str, e: &crate::errors::StorageError) {
        tracing::error!(error = %e, kind = e.kind(), op, "storage failure");
        let msg = format!("{}: failed to {} for '{}': {}", e.kind(), op, unit.test_case_id(), e);
        if let Err(e2) = self.repo.record_run_error(unit.tenant(), unit.run_id(), &msg) {
            tracing::error!(error = %e2, "failed to record run error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_api::BackendRegistry;
    use crate::model::{RunStatus, TestRun};
    use crate::providers::agent::ScriptedAgent;
    use crate::providers::target::fake::FakeInvoker;
    use crate::providers::target::{TargetInput, TargetInvoker, TargetResponse};
    use crate::storage::Store;
    use crate::tenant::TenantContext;
    use async_trait::async_trait;
    use std::time::Duration;

    fn config(prompts: &[&str]) -> TestConfiguration {
        let yaml = format!(
            "id: w\ntarget: {{name: echo}}\ntests:\n{}",
            prompts
                .iter()
                .enumerate()
                .map(|(i, p)| format!("  - {{id: t{i}, prompt: \"{p}\"}}\n"))
                .collect::<String>()
        );
        crate::config::parse_config(&yaml, "inline").unwrap()
    }

    struct Fixture {
        store: Arc<Store>,
        worker: UnitWorker,
        ctx: RunContext,
        tenant: TenantContext,
    }

    fn fixture(invoker: Arc<dyn TargetInvoker>, cfg: TestConfiguration, policy: RetryPolicy) -> Fixture {
        let store = Arc::new(Store::memory().unwrap());
        store.init_schema().unwrap();
        let tenant = TenantContext::with_correlation_id("org", "user", "corr-1");
        let run = TestRun::new(&cfg, tenant.clone());
        store.insert_run(&run).unwrap();

        let selector = ExecutorSelector::new(invoker, Arc::new(ScriptedAgent));
        let worker = UnitWorker::new(store.clone(), selector, MetricEngine::new(BackendRegistry::new()));
        let plan = MetricPlan::build(&cfg, &BackendRegistry::new());
        let ctx = RunContext {
            run_id: run.id.clone(),
            target: cfg.target.clone().unwrap(),
            config: Arc::new(cfg),
            plan: Arc::new(plan),
            policy,
        };
        Fixture {
            store,
            worker,
            ctx,
            tenant,
        }
    }

    #[tokio::test]
    async fn retries_then_fails_with_one_result_row() {
        let fake = Arc::new(FakeInvoker::echo().with_failure("down"));
        let f = fixture(fake.clone(), config(&["down"]), RetryPolicy::immediate(2));
        let unit = ExecutionUnit::new(&f.ctx.run_id, "t0", f.tenant.clone());

        let res = f.worker.run_unit(&f.ctx, unit).await;
        assert!(matches!(res, UnitResolution::Failed { .. }), "{res:?}");

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].attempt, 1);
        assert_eq!(calls[1].attempt, 2);
        for c in &calls {
            assert_eq!(c.tenant.as_ref(), Some(&f.tenant));
        }

        let rows = f.store.list_results(&f.tenant, &f.ctx.run_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ResultStatus::Error);
        assert_eq!(rows[0].attempts.len(), 2);
        assert!(rows[0].error.as_deref().unwrap().starts_with("execution_error"));

        let run = f.store.get_run(&f.tenant, &f.ctx.run_id).unwrap().unwrap();
        assert_eq!(run.failed_tasks, 1);
        assert_eq!(run.status, RunStatus::Progress);
    }

    #[tokio::test]
    async fn zero_metrics_resolve_with_error_status() {
        let f = fixture(Arc::new(FakeInvoker::echo()), config(&["hello"]), RetryPolicy::immediate(1));
        let unit = ExecutionUnit::new(&f.ctx.run_id, "t0", f.tenant.clone());
        let res = f.worker.run_unit(&f.ctx, unit).await;
        let outcome = res.outcome().unwrap();
        assert_eq!(outcome.status, ResultStatus::Error);
        assert!(outcome.metrics.is_empty());

        let run = f.store.get_run(&f.tenant, &f.ctx.run_id).unwrap().unwrap();
        assert_eq!(run.completed_tests, 1);
    }

    struct Slow;

    #[async_trait]
    impl TargetInvoker for Slow {
        async fn invoke(&self, _t: &TargetRef, _i: &TargetInput) -> anyhow::Result<TargetResponse> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(TargetResponse::text("late"))
        }

        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_abandons_without_retry() {
        let policy = RetryPolicy {
            soft_time_limit: Duration::from_secs(5),
            hard_time_limit: Duration::from_secs(60),
            ..RetryPolicy::immediate(3)
        };
        let f = fixture(Arc::new(Slow), config(&["hello"]), policy);
        let unit = ExecutionUnit::new(&f.ctx.run_id, "t0", f.tenant.clone());
        let res = f.worker.run_unit(&f.ctx, unit).await;
        match res {
            UnitResolution::Failed { reason, .. } => assert!(reason.contains("soft time limit"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        let rows = f.store.list_results(&f.tenant, &f.ctx.run_id).unwrap();
        assert_eq!(rows[0].attempts.len(), 1);
        assert_eq!(rows[0].attempts[0].outcome, AttemptOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_limit_bounds_the_whole_unit() {
        let policy = RetryPolicy {
            soft_time_limit: Duration::from_secs(30),
            hard_time_limit: Duration::from_secs(10),
            ..RetryPolicy::immediate(2)
        };
        let f = fixture(Arc::new(Slow), config(&["hello"]), policy);
        let unit = ExecutionUnit::new(&f.ctx.run_id, "t0", f.tenant.clone());
        let res = f.worker.run_unit(&f.ctx, unit).await;
        match res {
            UnitResolution::Failed { reason, .. } => assert!(reason.contains("hard time limit"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        let rows = f.store.list_results(&f.tenant, &f.ctx.run_id).unwrap();
        assert_eq!(rows[0].attempts.len(), 1);
        assert!(rows[0].error.as_deref().unwrap().starts_with("hard_time_limit"));
    }

    #[tokio::test]
    async fn unknown_test_case_fails_without_attempts() {
        let f = fixture(Arc::new(FakeInvoker::echo()), config(&["hello"]), RetryPolicy::immediate(2));
        let unit = ExecutionUnit::new(&f.ctx.run_id, "ghost", f.tenant.clone());
        let res = f.worker.run_unit(&f.ctx, unit).await;
        assert_eq!(res.test_case_id(), "ghost");
        assert!(matches!(res, UnitResolution::Failed { .. }));
    }
}
