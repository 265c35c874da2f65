use super::{schema, Repository, RunFinalization};
use crate::errors::StorageError;
use crate::model::{
    RunAttributes, RunStatus, ResultStatus, TestConfiguration, TestResult, TestRun, UnitProgress,
};
use crate::tenant::TenantContext;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RUN_COLUMNS: &str = "id, org_id, user_id, correlation_id, configuration_id, config_digest, \
     status, total_tests, completed_tests, failed_tasks, skipped_tests, attributes_json, \
     started_at, completed_at, last_error, retired";

const RESULT_COLUMNS: &str = "run_id, test_case_id, status, output, metrics_json, \
     execution_time_ms, attempts_json, transcript_json, error, created_at";

#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(schema::DDL)
            .context("failed to apply schema")?;
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            detail: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn ms_to_sql(ms: Option<u64>) -> Option<i64> {
    ms.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

/// Raw `runs` row; decoded into a [`TestRun`] outside the rusqlite closure
/// so that bad enum or timestamp values surface as [`StorageError::Corrupt`].
struct RunRecord {
    id: String,
    org_id: String,
    user_id: String,
    correlation_id: String,
    configuration_id: String,
    config_digest: String,
    status: String,
    total_tests: u32,
    completed_tests: u32,
    failed_tasks: u32,
    skipped_tests: u32,
    attributes_json: String,
    started_at: String,
    completed_at: Option<String>,
    last_error: Option<String>,
    retired: bool,
}

impl RunRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            user_id: row.get(2)?,
            correlation_id: row.get(3)?,
            configuration_id: row.get(4)?,
            config_digest: row.get(5)?,
            status: row.get(6)?,
            total_tests: row.get(7)?,
            completed_tests: row.get(8)?,
            failed_tasks: row.get(9)?,
            skipped_tests: row.get(10)?,
            attributes_json: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            last_error: row.get(14)?,
            retired: row.get(15)?,
        })
    }

    fn into_run(self) -> Result<TestRun, StorageError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| StorageError::Corrupt {
            table: "runs",
            detail: format!("unknown status '{}' for run {}", self.status, self.id),
        })?;
        let attributes: RunAttributes = serde_json::from_str(&self.attributes_json)?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|s| parse_time("runs", s))
            .transpose()?;
        Ok(TestRun {
            id: self.id,
            configuration_id: self.configuration_id,
            config_digest: self.config_digest,
            tenant: TenantContext::with_correlation_id(self.org_id, self.user_id, self.correlation_id),
            status,
            total_tests: self.total_tests,
            completed_tests: self.completed_tests,
            failed_tasks: self.failed_tasks,
            skipped_tests: self.skipped_tests,
            attributes,
            started_at: parse_time("runs", &self.started_at)?,
            completed_at,
            last_error: self.last_error,
            retired: self.retired,
        })
    }
}

struct ResultRecord {
    run_id: String,
    test_case_id: String,
    status: String,
    output: Option<String>,
    metrics_json: String,
    execution_time_ms: Option<i64>,
    attempts_json: Option<String>,
    transcript_json: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl ResultRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            test_case_id: row.get(1)?,
            status: row.get(2)?,
            output: row.get(3)?,
            metrics_json: row.get(4)?,
            execution_time_ms: row.get(5)?,
            attempts_json: row.get(6)?,
            transcript_json: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_result(self) -> Result<TestResult, StorageError> {
        let attempts = match self.attempts_json.filter(|s| !s.trim().is_empty()) {
            Some(s) => serde_json::from_str(&s)?,
            None => Vec::new(),
        };
        let transcript = match self.transcript_json.filter(|s| !s.trim().is_empty()) {
            Some(s) => serde_json::from_str(&s)?,
            None => Vec::new(),
        };
        Ok(TestResult {
            run_id: self.run_id,
            test_case_id: self.test_case_id,
            output: self.output,
            metrics: serde_json::from_str(&self.metrics_json)?,
            status: ResultStatus::parse(&self.status),
            execution_time_ms: self.execution_time_ms.map(|v| v.max(0) as u64),
            attempts,
            transcript,
            error: self.error,
            created_at: parse_time("results", &self.created_at)?,
        })
    }
}

impl Repository for Store {
    fn save_configuration(&self, tenant: &TenantContext, cfg: &TestConfiguration) -> Result<(), StorageError> {
        let json = serde_json::to_string(cfg)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO configurations(org_id, id, digest, config_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(org_id, id) DO UPDATE SET
               digest = excluded.digest,
               config_json = excluded.config_json,
               updated_at = excluded.updated_at",
            params![tenant.org_id(), cfg.id, cfg.digest(), json, now()],
        )?;
        Ok(())
    }

    fn get_configuration(
        &self,
        tenant: &TenantContext,
        id: &str,
    ) -> Result<Option<TestConfiguration>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT config_json FROM configurations WHERE org_id = ?1 AND id = ?2",
                params![tenant.org_id(), id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn insert_run(&self, run: &TestRun) -> Result<(), StorageError> {
        let attributes = serde_json::to_string(&run.attributes)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO runs({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                run.id,
                run.tenant.org_id(),
                run.tenant.user_id(),
                run.tenant.correlation_id(),
                run.configuration_id,
                run.config_digest,
                run.status.as_str(),
                run.total_tests,
                run.completed_tests,
                run.failed_tasks,
                run.skipped_tests,
                attributes,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.last_error,
                run.retired,
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, tenant: &TenantContext, run_id: &str) -> Result<Option<TestRun>, StorageError> {
        let record = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1 AND org_id = ?2"),
                params![run_id, tenant.org_id()],
                RunRecord::from_row,
            )
            .optional()?
        };
        record.map(RunRecord::into_run).transpose()
    }

    fn list_runs(&self, tenant: &TenantContext, limit: u32) -> Result<Vec<TestRun>, StorageError> {
        let records = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE org_id = ?1 AND retired = 0
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![tenant.org_id(), limit], RunRecord::from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };
        records.into_iter().map(RunRecord::into_run).collect()
    }

    fn record_progress(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        progress: UnitProgress,
    ) -> Result<bool, StorageError> {
        let column = match progress {
            UnitProgress::Succeeded => "completed_tests",
            UnitProgress::Failed => "failed_tasks",
            UnitProgress::Skipped => "skipped_tests",
        };
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE runs SET {column} = {column} + 1
                 WHERE id = ?1 AND org_id = ?2 AND status = 'progress'
                   AND completed_tests + failed_tasks + skipped_tests < total_tests"
            ),
            params![run_id, tenant.org_id()],
        )?;
        Ok(n == 1)
    }

    fn finalize_run(
        &self,
        tenant: &TenantContext,
        run_id: &str,
        fin: &RunFinalization,
    ) -> Result<bool, StorageError> {
        if !fin.status.is_terminal() {
            return Ok(false);
        }
        let attributes = serde_json::to_string(&fin.attributes)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE runs SET
               status = ?3,
               completed_tests = ?4,
               failed_tasks = ?5,
               skipped_tests = ?6,
               attributes_json = ?7,
               completed_at = ?8,
               last_error = COALESCE(?9, last_error)
             WHERE id = ?1 AND org_id = ?2 AND status = 'progress'",
            params![
                run_id,
                tenant.org_id(),
                fin.status.as_str(),
                fin.completed_tests,
                fin.failed_tasks,
                fin.skipped_tests,
                attributes,
                now(),
                fin.last_error,
            ],
        )?;
        Ok(n == 1)
    }

    fn record_run_error(&self, tenant: &TenantContext, run_id: &str, message: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET last_error = ?3 WHERE id = ?1 AND org_id = ?2",
            params![run_id, tenant.org_id(), message],
        )?;
        Ok(())
    }

    fn save_result(&self, tenant: &TenantContext, result: &TestResult) -> Result<bool, StorageError> {
        let metrics = serde_json::to_string(&result.metrics)?;
        let attempts = serde_json::to_string(&result.attempts)?;
        let transcript = if result.transcript.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&result.transcript)?)
        };
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "INSERT OR IGNORE INTO results(
               run_id, org_id, test_case_id, status, output, metrics_json,
               execution_time_ms, attempts_json, transcript_json, error, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
             WHERE EXISTS (
               SELECT 1 FROM runs WHERE id = ?1 AND org_id = ?2 AND status = 'progress')",
            params![
                result.run_id,
                tenant.org_id(),
                result.test_case_id,
                result.status.as_str(),
                result.output,
                metrics,
                ms_to_sql(result.execution_time_ms),
                attempts,
                transcript,
                result.error,
                result.created_at.to_rfc3339(),
            ],
        )?;
        Ok(n == 1)
    }

    fn list_results(&self, tenant: &TenantContext, run_id: &str) -> Result<Vec<TestResult>, StorageError> {
        let records = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESULT_COLUMNS} FROM results
                 WHERE org_id = ?1 AND run_id = ?2
                 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![tenant.org_id(), run_id], ResultRecord::from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };
        records.into_iter().map(ResultRecord::into_result).collect()
    }

    fn soft_retire_run(&self, tenant: &TenantContext, run_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE runs SET retired = 1 WHERE id = ?1 AND org_id = ?2 AND retired = 0",
            params![run_id, tenant.org_id()],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricResult, ScoreType, TargetRef, TestCase};
    use std::collections::BTreeMap;

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    fn tenant(org: &str) -> TenantContext {
        TenantContext::with_correlation_id(org, "user", "corr")
    }

    fn config(n: usize) -> TestConfiguration {
        TestConfiguration {
            version: 1,
            id: "cfg".into(),
            name: None,
            mode: Default::default(),
            target: Some(TargetRef {
                name: "echo".into(),
                kind: "fake".into(),
                endpoint: None,
                response_pointer: None,
                headers: Default::default(),
            }),
            metrics: BTreeMap::new(),
            settings: Default::default(),
            tests: (0..n)
                .map(|i| TestCase {
                    id: format!("t{i}"),
                    prompt: "p".into(),
                    context: vec![],
                    expected_output: None,
                    metrics: vec![],
                    modality: None,
                    conversation: None,
                    tags: vec![],
                })
                .collect(),
        }
    }

    fn result(run_id: &str, tc: &str) -> TestResult {
        let mut metrics = BTreeMap::new();
        metrics.insert("m".to_string(), MetricResult::failed(ScoreType::Numeric, "down"));
        TestResult {
            run_id: run_id.into(),
            test_case_id: tc.into(),
            output: Some("out".into()),
            metrics,
            status: ResultStatus::Error,
            execution_time_ms: Some(12),
            attempts: vec![],
            transcript: vec![],
            error: None,
            created_at: Utc::now(),
        }
    }

    fn finalization(status: RunStatus, completed: u32) -> RunFinalization {
        RunFinalization {
            status,
            completed_tests: completed,
            failed_tasks: 0,
            skipped_tests: 0,
            attributes: RunAttributes::default(),
            last_error: None,
        }
    }

    #[test]
    fn configuration_roundtrips_per_org() {
        let s = store();
        let cfg = config(2);
        s.save_configuration(&tenant("a"), &cfg).unwrap();
        assert_eq!(s.get_configuration(&tenant("a"), "cfg").unwrap(), Some(cfg));
        assert_eq!(s.get_configuration(&tenant("b"), "cfg").unwrap(), None);
    }

    #[test]
    fn run_is_invisible_to_other_orgs() {
        let s = store();
        let run = TestRun::new(&config(1), tenant("a"));
        s.insert_run(&run).unwrap();
        let loaded = s.get_run(&tenant("a"), &run.id).unwrap().unwrap();
        assert_eq!(loaded.tenant, run.tenant);
        assert_eq!(loaded.status, RunStatus::Progress);
        assert!(s.get_run(&tenant("b"), &run.id).unwrap().is_none());
        assert!(!s.record_progress(&tenant("b"), &run.id, UnitProgress::Succeeded).unwrap());
    }

    #[test]
    fn progress_never_exceeds_total() {
        let s = store();
        let run = TestRun::new(&config(2), tenant("a"));
        s.insert_run(&run).unwrap();
        let t = tenant("a");
        assert!(s.record_progress(&t, &run.id, UnitProgress::Succeeded).unwrap());
        assert!(s.record_progress(&t, &run.id, UnitProgress::Skipped).unwrap());
        assert!(!s.record_progress(&t, &run.id, UnitProgress::Failed).unwrap());

        let loaded = s.get_run(&t, &run.id).unwrap().unwrap();
        assert_eq!(loaded.completed_tests, 1);
        assert_eq!(loaded.skipped_tests, 1);
        assert_eq!(loaded.failed_tasks, 0);
    }

    #[test]
    fn finalize_is_compare_and_swap() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        s.insert_run(&run).unwrap();

        assert!(s.finalize_run(&t, &run.id, &finalization(RunStatus::Completed, 1)).unwrap());
        assert!(!s.finalize_run(&t, &run.id, &finalization(RunStatus::Failed, 0)).unwrap());
        assert!(!s.record_progress(&t, &run.id, UnitProgress::Succeeded).unwrap());

        let loaded = s.get_run(&t, &run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.completed_tests, 1);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn results_are_insert_once() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        s.insert_run(&run).unwrap();

        assert!(s.save_result(&t, &result(&run.id, "t0")).unwrap());
        assert!(!s.save_result(&t, &result(&run.id, "t0")).unwrap());
        assert!(!s.save_result(&tenant("b"), &result(&run.id, "t1")).unwrap());

        let rows = s.list_results(&t, &run.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].metrics["m"].evaluation_failed);
        assert_eq!(rows[0].execution_time_ms, Some(12));
        assert!(s.list_results(&tenant("b"), &run.id).unwrap().is_empty());
    }

    #[test]
    fn results_after_finalize_are_refused() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(2), t.clone());
        s.insert_run(&run).unwrap();
        assert!(s.save_result(&t, &result(&run.id, "t0")).unwrap());
        assert!(s.finalize_run(&t, &run.id, &finalization(RunStatus::Partial, 1)).unwrap());

        assert!(!s.save_result(&t, &result(&run.id, "t1")).unwrap());
        let ids: Vec<String> = s
            .list_results(&t, &run.id)
            .unwrap()
            .into_iter()
            .map(|r| r.test_case_id)
            .collect();
        assert_eq!(ids, vec!["t0".to_string()]);
    }

    #[test]
    fn retired_runs_are_kept_but_unlisted() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        s.insert_run(&run).unwrap();
        assert_eq!(s.list_runs(&t, 10).unwrap().len(), 1);

        assert!(s.soft_retire_run(&t, &run.id).unwrap());
        assert!(!s.soft_retire_run(&t, &run.id).unwrap());
        assert!(s.list_runs(&t, 10).unwrap().is_empty());
        assert!(s.get_run(&t, &run.id).unwrap().unwrap().retired);
    }

    #[test]
    fn deleting_a_run_row_cascades_to_results() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        s.insert_run(&run).unwrap();
        s.save_result(&t, &result(&run.id, "t0")).unwrap();

        s.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM runs WHERE id = ?1", params![run.id])
            .unwrap();
        assert!(s.list_results(&t, &run.id).unwrap().is_empty());
    }

    #[test]
    fn corrupt_status_is_reported() {
        let s = store();
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        s.insert_run(&run).unwrap();
        s.conn
            .lock()
            .unwrap()
            .execute("UPDATE runs SET status = 'exploded'", [])
            .unwrap();
        let err = s.get_run(&t, &run.id).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { table: "runs", .. }), "{err}");
    }

    #[test]
    fn file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crucible.db");
        let t = tenant("a");
        let run = TestRun::new(&config(1), t.clone());
        {
            let s = Store::open(&path).unwrap();
            s.init_schema().unwrap();
            s.insert_run(&run).unwrap();
        }
        let s = Store::open(&path).unwrap();
        s.init_schema().unwrap();
        assert!(s.get_run(&t, &run.id).unwrap().is_some());
    }
}
