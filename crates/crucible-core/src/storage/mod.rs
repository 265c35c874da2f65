//! Persistence for configurations, runs and results.
//!
//! Every call is scoped by the caller's [`TenantContext`]; a run or result is
//! only visible to the organization that created it.

pub mod schema;
pub mod store;

pub use store::Store;

use crate::errors::StorageError;
use crate::model::{RunAttributes, RunStatus, TestConfiguration, TestResult, TestRun, UnitProgress};
use crate::tenant::TenantContext;

/// Terminal write for a run. Counters are absolute, not increments.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub completed_tests: u32,
    pub failed_tasks: u32,
    pub skipped_tests: u32,
    pub attributes: RunAttributes,
    pub last_error: Option<String>,
}

pub trait Repository: Send + Sync {
    fn save_configuration(&self, tenant: &TenantContext, cfg: &TestConfiguration) -> Result<(), StorageError>;

    fn get_configuration(
        &self,
        tenant: &TenantContext,
        id: &str,
    ) -> Result<Option<TestConfiguration>, StorageError>;

    fn insert_run(&self, run: &TestRun) -> Result<(), StorageError>;

    fn get_run(&self, tenant: &TenantContext, run_id: &str) -> Result<Option<TestRun>, StorageError>;

    /// Most recent first; retired runs excluded.
    fn list_runs(&self, tenant: &TenantContext, limit: u32) -> Result<Vec<TestRun>, StorageError>;

    /// Bumps one counter while the run is in progress and not yet full.
    /// Returns false when the guard rejected the update.
    fn record_progress(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        progress: UnitProgress,
    ) -> Result<bool, StorageError>;

    /// Compare-and-swap out of `progress`. Returns false if the run was
    /// already terminal.
    fn finalize_run(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        fin: &RunFinalization,
    ) -> Result<bool, StorageError>;

    fn record_run_error(&self, tenant: &TenantContext, run_id: &str, message: &str) -> Result<(), StorageError>;

    /// Insert-once per (run, test case). Returns false for a duplicate.
    fn save_result(&self, tenant: &TenantContext, result: &TestResult) -> Result<bool, StorageError>;

    fn list_results(&self, tenant: &TenantContext, run_id: &str) -> Result<Vec<TestResult>, StorageError>;

    fn soft_retire_run(&self, tenant: &TenantContext, run_id: &str) -> Result<bool, StorageError>;
}
