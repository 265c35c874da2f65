use super::aggregator::ResultAggregator;
use super::controller::RunController;
use super::dispatcher::{Dispatcher, StopSignal};
use super::queue::{LocalTaskQueue, DEFAULT_QUEUE_WORKERS};
use super::retry::RetryPolicy;
use super::worker::{RunContext, UnitWorker};
use crate::errors::{ConfigurationError, EngineError, ErrorKind};
use crate::evaluation::{MetricEngine, MetricPlan, DEFAULT_METRIC_WORKERS};
use crate::executor::ExecutorSelector;
use crate::metrics_api::BackendRegistry;
use crate::model::{RunStatusView, TestConfiguration, TestResult, TestRun};
use crate::providers::agent::{ConversationAgent, ScriptedAgent};
use crate::providers::target::TargetInvoker;
use crate::report::progress::ProgressSink;
use crate::report::summary::RunSummary;
use crate::storage::Repository;
use crate::tenant::TenantContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

struct ActiveRun {
    stop: StopSignal,
    done: watch::Receiver<Option<TestRun>>,
}

/// Entry point for callers: start runs, poll them, stop them, read results.
#[derive(Clone)]
pub struct RunService {
    repo: Arc<dyn Repository>,
    controller: RunController,
    aggregator: ResultAggregator,
    invoker: Arc<dyn TargetInvoker>,
    agent: Arc<dyn ConversationAgent>,
    backends: BackendRegistry,
    progress: Option<ProgressSink>,
    queue_workers: Option<usize>,
    retry_policy: Option<RetryPolicy>,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl RunService {
    pub fn new(repo: Arc<dyn Repository>, invoker: Arc<dyn TargetInvoker>, backends: BackendRegistry) -> Self {
        let controller = RunController::new(repo.clone()).with_invoker(invoker.clone());
        Self {
            aggregator: ResultAggregator::new(controller.clone()),
            controller,
            repo,
            invoker,
            agent: Arc::new(ScriptedAgent),
            backends,
            progress: None,
            queue_workers: None,
            retry_policy: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn ConversationAgent>) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Overrides `settings.queue_workers` of every configuration.
    pub fn with_queue_workers(mut self, workers: usize) -> Self {
        self.queue_workers = Some(workers.max(1));
        self
    }

    /// Overrides `settings.retry` of every configuration.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn save_configuration(&self, tenant: &TenantContext, cfg: &TestConfiguration) -> Result<(), EngineError> {
        tenant.validate()?;
        self.repo.save_configuration(tenant, cfg)?;
        Ok(())
    }

    /// Creates a run for the stored configuration and dispatches it. Returns
    /// as soon as the units are submitted.
    pub async fn start_run(&self, config_id: &str, tenant: &TenantContext) -> Result<String, EngineError> {
        tenant.validate()?;
        let cfg = self
            .repo
            .get_configuration(tenant, config_id)?
            .ok_or_else(|| ConfigurationError::NotFound {
                id: config_id.to_string(),
            })?;
        self.launch(cfg, tenant)
    }

    /// Stores `cfg` and starts a run of it.
    pub async fn run_configuration(
        &self,
        cfg: &TestConfiguration,
        tenant: &TenantContext,
    ) -> Result<String, EngineError> {
        self.save_configuration(tenant, cfg)?;
        self.start_run(&cfg.id, tenant).await
    }

    fn launch(&self, cfg: TestConfiguration, tenant: &TenantContext) -> Result<String, EngineError> {
        let plan = MetricPlan::build(&cfg, &self.backends);
        let run = self.controller.create_run(&cfg, tenant, plan.rejection_reasons())?;
        let target = cfg
            .target
            .clone()
            .ok_or_else(|| ConfigurationError::UnresolvableTarget {
                id: cfg.id.clone(),
                detail: "no target configured".into(),
            })?;

        let policy = self
            .retry_policy
            .clone()
            .unwrap_or_else(|| RetryPolicy::from(&cfg.settings.retry));
        let queue_workers = self
            .queue_workers
            .or(cfg.settings.queue_workers)
            .unwrap_or(DEFAULT_QUEUE_WORKERS);
        let metric_workers = cfg.settings.metric_workers.unwrap_or(DEFAULT_METRIC_WORKERS);

        let worker = UnitWorker::new(
            self.repo.clone(),
            ExecutorSelector::new(self.invoker.clone(), self.agent.clone()),
            MetricEngine::new(self.backends.clone()).with_workers(metric_workers),
        );
        let dispatcher = Dispatcher::new(Arc::new(LocalTaskQueue::new(queue_workers)), Arc::new(worker))
            .with_progress(self.progress.clone());
        let ctx = RunContext {
            run_id: run.id.clone(),
            config: Arc::new(cfg),
            target,
            plan: Arc::new(plan),
            policy,
        };

        let stop = StopSignal::default();
        let (tx, rx) = watch::channel(None);
        self.active.lock().unwrap().insert(
            run.id.clone(),
            ActiveRun {
                stop: stop.clone(),
                done: rx,
            },
        );

        let handle = dispatcher.dispatch_with_stop(&run, ctx, stop);
        let aggregator = self.aggregator.clone();
        let controller = self.controller.clone();
        let active = self.active.clone();
        let pending = run.clone();
        handle.on_complete(move |outcomes| async move {
            let finished = match aggregator.on_all_complete(&pending, &outcomes) {
                Ok(run) => Some(run),
                Err(e) => {
                    tracing::error!(run_id = %pending.id, error = %e, kind = e.kind(), "failed to finalize run");
                    if let Err(e2) = controller.fail_run(&pending, &e.to_string()) {
                        tracing::error!(run_id = %pending.id, error = %e2, "failed to mark run failed");
                    }
                    controller.load(&pending.tenant, &pending.id).ok()
                }
            };
            let _ = tx.send(finished);
            active.lock().unwrap().remove(&pending.id);
        });

        Ok(run.id)
    }

    /// Snapshot of the run; safe to call at any point of its life.
    pub fn get_run_status(&self, run_id: &str, tenant: &TenantContext) -> Result<RunStatusView, EngineError> {
        let run = self.controller.load(tenant, run_id)?;
        Ok(RunStatusView::from(&run))
    }

    pub fn get_run(&self, run_id: &str, tenant: &TenantContext) -> Result<TestRun, EngineError> {
        self.controller.load(tenant, run_id)
    }

    /// Waits until the run is finalized and returns it. Runs started by
    /// another process are returned as currently stored.
    pub async fn wait_for_run(&self, run_id: &str, tenant: &TenantContext) -> Result<TestRun, EngineError> {
        // visibility check before waiting on another tenant's run
        self.controller.load(tenant, run_id)?;
        let rx = self
            .active
            .lock()
            .unwrap()
            .get(run_id)
            .map(|a| a.done.clone());
        if let Some(mut rx) = rx {
            // a closed channel means the fan-in task is gone; the stored row is all we have
            let _ = rx.wait_for(|r| r.is_some()).await;
        }
        self.controller.load(tenant, run_id)
    }

    /// Prevents units that have not started from starting; they resolve as
    /// skipped. Returns false if the run is not active in this service.
    pub fn stop_run(&self, run_id: &str, tenant: &TenantContext) -> Result<bool, EngineError> {
        let run = self.controller.load(tenant, run_id)?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        let active = self.active.lock().unwrap();
        match active.get(run_id) {
            Some(a) => {
                a.stop.stop();
                tracing::info!(run_id, org_id = %tenant.org_id(), "stop requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Finalizes a run left in progress by a dispatcher that no longer exists,
    /// such as one owned by a process that exited. Runs active in this
    /// service are stopped instead. Returns the finalized run, or None when
    /// there was nothing to abandon.
    pub fn abandon_run(&self, run_id: &str, tenant: &TenantContext) -> Result<Option<TestRun>, EngineError> {
        let run = self.controller.load(tenant, run_id)?;
        if run.status.is_terminal() {
            return Ok(None);
        }
        if self.active.lock().unwrap().contains_key(run_id) {
            self.stop_run(run_id, tenant)?;
            return Ok(None);
        }
        let results = self.repo.list_results(tenant, run_id)?;
        let run = self
            .aggregator
            .on_abandoned(&run, &results, "run abandoned: no active dispatcher")?;
        Ok(Some(run))
    }

    pub fn results(&self, run_id: &str, tenant: &TenantContext) -> Result<Vec<TestResult>, EngineError> {
        self.controller.load(tenant, run_id)?;
        Ok(self.repo.list_results(tenant, run_id)?)
    }

    pub fn summary(&self, run_id: &str, tenant: &TenantContext) -> Result<RunSummary, EngineError> {
        let run = self.controller.load(tenant, run_id)?;
        let results = self.repo.list_results(tenant, run_id)?;
        Ok(RunSummary::new(&run, &results))
    }

    pub fn list_runs(&self, tenant: &TenantContext, limit: u32) -> Result<Vec<TestRun>, EngineError> {
        Ok(self.repo.list_runs(tenant, limit)?)
    }

    pub fn retire_run(&self, run_id: &str, tenant: &TenantContext) -> Result<bool, EngineError> {
        self.controller.load(tenant, run_id)?;
        Ok(self.repo.soft_retire_run(tenant, run_id)?)
    }
}
