use crate::model::{ResultStatus, RunStatus, TestResult, TestRun};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLine {
    pub test_case_id: String,
    pub status: ResultStatus,
    pub execution_time_ms: Option<u64>,
    pub attempts: usize,
    /// metric name -> pass/fail; metrics that failed to score are omitted.
    pub metrics: BTreeMap<String, bool>,
    pub detail: Option<String>,
}

/// Everything a caller needs to report on one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub configuration_id: String,
    pub config_digest: String,
    pub status: RunStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub aggregated_metrics: BTreeMap<String, f64>,
    pub mean_execution_time_ms: Option<f64>,
    pub metric_warnings: BTreeMap<String, String>,
    pub last_error: Option<String>,
    pub cases: Vec<CaseLine>,
}

impl RunSummary {
    pub fn new(run: &TestRun, results: &[TestResult]) -> Self {
        let mut cases: Vec<CaseLine> = results
            .iter()
            .map(|r| CaseLine {
                test_case_id: r.test_case_id.clone(),
                status: r.status,
                execution_time_ms: r.execution_time_ms,
                attempts: r.attempts.len(),
                metrics: r
                    .metrics
                    .iter()
                    .filter(|(_, m)| !m.evaluation_failed)
                    .map(|(k, m)| (k.clone(), m.is_successful))
                    .collect(),
                detail: r.error.clone().or_else(|| {
                    let failed: Vec<&str> = r
                        .metrics
                        .iter()
                        .filter(|(_, m)| m.evaluation_failed)
                        .map(|(k, _)| k.as_str())
                        .collect();
                    (!failed.is_empty()).then(|| format!("not scored: {}", failed.join(", ")))
                }),
            })
            .collect();
        cases.sort_by(|a, b| a.test_case_id.cmp(&b.test_case_id));

        let count = |s: ResultStatus| results.iter().filter(|r| r.status == s).count();
        Self {
            run_id: run.id.clone(),
            configuration_id: run.configuration_id.clone(),
            config_digest: run.config_digest.clone(),
            status: run.status,
            total: run.total_tests,
            completed: run.completed_tests,
            failed: run.failed_tasks,
            skipped: run.skipped_tests,
            pass: count(ResultStatus::Pass),
            fail: count(ResultStatus::Fail),
            error: count(ResultStatus::Error),
            aggregated_metrics: run.attributes.aggregated_metrics.clone(),
            mean_execution_time_ms: run.attributes.mean_execution_time_ms,
            metric_warnings: run.attributes.metric_warnings.clone(),
            last_error: run.last_error.clone(),
            cases,
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable report, one line per test case.
    pub fn render_console(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Run {} ({}) -> {}\n",
            self.run_id,
            self.configuration_id,
            self.status.as_str()
        ));
        for c in &self.cases {
            let icon = match c.status {
                ResultStatus::Pass => "✅",
                ResultStatus::Fail => "❌",
                ResultStatus::Error => "⚠️",
            };
            let time = c
                .execution_time_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_default();
            out.push_str(&format!("{} {:<24} {:>7}", icon, c.test_case_id, time));
            if c.attempts > 1 {
                out.push_str(&format!("  ({} attempts)", c.attempts));
            }
            out.push('\n');
            if let Some(detail) = &c.detail {
                out.push_str(&format!("      {}\n", detail));
            }
        }
        for (name, mean) in &self.aggregated_metrics {
            out.push_str(&format!("  {:<22} mean={:.3}\n", name, mean));
        }
        for (name, reason) in &self.metric_warnings {
            out.push_str(&format!("  warning: metric '{}' skipped: {}\n", name, reason));
        }
        if let Some(e) = &self.last_error {
            out.push_str(&format!("  last error: {}\n", e));
        }
        out.push_str(&format!(
            "Summary: {} total, {} completed, {} failed, {} skipped | pass={} fail={} error={}\n",
            self.total, self.completed, self.failed, self.skipped, self.pass, self.fail, self.error
        ));
        out
    }
}
