//! Fan-in: folds unit resolutions into the run's terminal state.

use super::controller::RunController;
use crate::errors::{AggregationConsistencyError, EngineError};
use crate::model::{RunAttributes, RunStatus, TestResult, TestRun, UnitResolution};
use crate::storage::RunFinalization;
use std::collections::{BTreeMap, HashSet};

/// Counts and means over one set of unit resolutions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Aggregate {
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub mean_execution_time_ms: Option<f64>,
    pub metric_means: BTreeMap<String, f64>,
    /// First failure by test case id.
    pub first_failure: Option<String>,
}

impl Aggregate {
    pub fn from_outcomes(outcomes: &[UnitResolution]) -> Self {
        let mut agg = Aggregate::default();
        let mut time_sum = 0.0;
        let mut sums: BTreeMap<&str, (f64, u32)> = BTreeMap::new();
        let mut failures: Vec<(&str, &str)> = Vec::new();

        for res in outcomes {
            match res {
                UnitResolution::Succeeded(o) => {
                    agg.completed += 1;
                    time_sum += o.execution_time_ms as f64;
                    for (name, m) in &o.metrics {
                        if m.counts_toward_aggregate() {
                            let e = sums.entry(name.as_str()).or_insert((0.0, 0));
                            e.0 += m.score;
                            e.1 += 1;
                        }
                    }
                }
                UnitResolution::Failed { test_case_id, reason } => {
                    agg.failed += 1;
                    failures.push((test_case_id, reason));
                }
                UnitResolution::Skipped { .. } => agg.skipped += 1,
            }
        }

        if agg.completed > 0 {
            agg.mean_execution_time_ms = Some(time_sum / f64::from(agg.completed));
        }
        agg.metric_means = sums
            .into_iter()
            .map(|(name, (sum, n))| (name.to_string(), sum / f64::from(n)))
            .collect();
        failures.sort();
        agg.first_failure = failures
            .first()
            .map(|(id, reason)| format!("test case '{}' failed: {}", id, reason));
        agg
    }
}

#[derive(Clone)]
pub struct ResultAggregator {
    controller: RunController,
}

impl ResultAggregator {
    pub fn new(controller: RunController) -> Self {
        Self { controller }
    }

    /// Finalizes `run` from its resolutions and returns the stored run.
    ///
    /// Safe to call repeatedly: only the first call for a run writes, later
    /// calls return the state the first one left.
    pub fn on_all_complete(&self, run: &TestRun, outcomes: &[UnitResolution]) -> Result<TestRun, EngineError> {
        let agg = Aggregate::from_outcomes(outcomes);
        let mut attributes = RunAttributes {
            aggregated_metrics: agg.metric_means.clone(),
            mean_execution_time_ms: agg.mean_execution_time_ms,
            metric_warnings: run.attributes.metric_warnings.clone(),
        };

        let mut counts = (agg.completed, agg.failed, agg.skipped);
        let (status, last_error) = match check_consistency(run, outcomes) {
            Ok(()) => (RunStatus::verdict(agg.completed, run.total_tests), agg.first_failure.clone()),
            Err(e) => {
                counts = reconciled_counts(run, outcomes);
                tracing::error!(
                    run_id = %run.id,
                    expected = e.expected,
                    received = e.received,
                    "fan-in outcome count mismatch; failing run"
                );
                attributes.aggregated_metrics.clear();
                attributes.mean_execution_time_ms = None;
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        self.controller.transition(
            run,
            &RunFinalization {
                status,
                completed_tests: counts.0,
                failed_tasks: counts.1,
                skipped_tests: counts.2,
                attributes,
                last_error,
            },
        )?;
        self.controller.load(&run.tenant, &run.id)
    }

    /// Finalizes a run whose dispatcher is gone, from the results it left
    /// behind. Test cases without a stored result count as skipped.
    pub fn on_abandoned(&self, run: &TestRun, results: &[TestResult], reason: &str) -> Result<TestRun, EngineError> {
        let outcomes: Vec<UnitResolution> = results.iter().map(UnitResolution::from).collect();
        let agg = Aggregate::from_outcomes(&outcomes);
        let skipped = run.total_tests.saturating_sub(agg.completed + agg.failed);
        tracing::warn!(
            run_id = %run.id,
            stored = results.len(),
            skipped,
            reason,
            "finalizing abandoned run"
        );

        self.controller.transition(
            run,
            &RunFinalization {
                status: RunStatus::verdict(agg.completed, run.total_tests),
                completed_tests: agg.completed,
                failed_tasks: agg.failed,
                skipped_tests: skipped,
                attributes: RunAttributes {
                    aggregated_metrics: agg.metric_means,
                    mean_execution_time_ms: agg.mean_execution_time_ms,
                    metric_warnings: run.attributes.metric_warnings.clone(),
                },
                last_error: Some(reason.to_string()),
            },
        )?;
        self.controller.load(&run.tenant, &run.id)
    }
}

/// Exactly one resolution per test case of the run.
fn check_consistency(run: &TestRun, outcomes: &[UnitResolution]) -> Result<(), AggregationConsistencyError> {
    let distinct: HashSet<&str> = outcomes.iter().map(UnitResolution::test_case_id).collect();
    if outcomes.len() != run.total_tests as usize || distinct.len() != outcomes.len() {
        return Err(AggregationConsistencyError {
            run_id: run.id.clone(),
            expected: run.total_tests,
            received: outcomes.len(),
        });
    }
    Ok(())
}

/// Counters for a fan-in that did not line up. The first resolution of each
/// test case counts, up to `total_tests` of them; every unit left without one
/// counts as failed.
fn reconciled_counts(run: &TestRun, outcomes: &[UnitResolution]) -> (u32, u32, u32) {
    let mut seen = HashSet::new();
    let (mut completed, mut failed, mut skipped) = (0u32, 0u32, 0u32);
    for res in outcomes
        .iter()
        .filter(|res| seen.insert(res.test_case_id()))
        .take(run.total_tests as usize)
    {
        match res {
            UnitResolution::Succeeded(_) => completed += 1,
            UnitResolution::Failed { .. } => failed += 1,
            UnitResolution::Skipped { .. } => skipped += 1,
        }
    }
    let missing = run.total_tests.saturating_sub(completed + failed + skipped);
    (completed, failed + missing, skipped)
}
