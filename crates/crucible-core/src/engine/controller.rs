use crate::config;
use crate::errors::{ConfigurationError, EngineError, StorageError};
use crate::model::{RunAttributes, RunStatus, TestConfiguration, TestRun};
use crate::providers::target::TargetInvoker;
use crate::storage::{Repository, RunFinalization};
use crate::tenant::TenantContext;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Owns the run state machine. Creation and the terminal transition go
/// through here; progress counters are bumped by the workers directly.
#[derive(Clone)]
pub struct RunController {
    repo: Arc<dyn Repository>,
    invoker: Option<Arc<dyn TargetInvoker>>,
}

impl RunController {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo, invoker: None }
    }

    /// Rejects runs whose target kind `invoker` cannot reach.
    pub fn with_invoker(mut self, invoker: Arc<dyn TargetInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Validates the configuration and persists a fresh run in `Progress`.
    /// Nothing is written when validation fails.
    pub fn create_run(
        &self,
        cfg: &TestConfiguration,
        tenant: &TenantContext,
        metric_warnings: BTreeMap<String, String>,
    ) -> Result<TestRun, EngineError> {
        tenant.validate()?;
        config::validate(cfg)?;
        if let (Some(invoker), Some(target)) = (&self.invoker, &cfg.target) {
            if !invoker.supports(&target.kind) {
                return Err(ConfigurationError::UnresolvableTarget {
                    id: cfg.id.clone(),
                    detail: format!("no invoker registered for target kind '{}'", target.kind),
                }
                .into());
            }
        }

        let mut run = TestRun::new(cfg, tenant.clone());
        run.attributes.metric_warnings = metric_warnings;
        self.repo.insert_run(&run)?;
        tracing::info!(
            run_id = %run.id,
            configuration_id = %cfg.id,
            org_id = %tenant.org_id(),
            total_tests = run.total_tests,
            mode = cfg.mode.as_str(),
            "run created"
        );
        Ok(run)
    }

    /// Moves `run` out of `Progress`. Returns false, with a warning, when the
    /// transition is not allowed or the run was already finalized.
    pub fn transition(&self, run: &TestRun, fin: &RunFinalization) -> Result<bool, StorageError> {
        if !RunStatus::Progress.can_transition_to(fin.status) {
            tracing::warn!(run_id = %run.id, to = fin.status.as_str(), "illegal run transition ignored");
            return Ok(false);
        }
        let won = self.repo.finalize_run(&run.tenant, &run.id, fin)?;
        if won {
            tracing::info!(
                run_id = %run.id,
                status = fin.status.as_str(),
                completed = fin.completed_tests,
                failed = fin.failed_tasks,
                skipped = fin.skipped_tests,
                "run finalized"
            );
        } else {
            tracing::warn!(
                run_id = %run.id,
                to = fin.status.as_str(),
                "run already terminal; transition ignored"
            );
        }
        Ok(won)
    }

    /// Finalizes `run` as `Failed` with `reason`, keeping its recorded counters.
    pub fn fail_run(&self, run: &TestRun, reason: &str) -> Result<bool, StorageError> {
        let current = self.repo.get_run(&run.tenant, &run.id)?.unwrap_or_else(|| run.clone());
        self.transition(
            run,
            &RunFinalization {
                status: RunStatus::Failed,
                completed_tests: current.completed_tests,
                failed_tasks: current.failed_tasks,
                skipped_tests: current.skipped_tests,
                attributes: RunAttributes {
                    metric_warnings: current.attributes.metric_warnings,
                    ..RunAttributes::default()
                },
                last_error: Some(reason.to_string()),
            },
        )
    }

    pub fn load(&self, tenant: &TenantContext, run_id: &str) -> Result<TestRun, EngineError> {
        self.repo
            .get_run(tenant, run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }
}
