//! Metric evaluation engine.
//!
//! Scores one execution against a list of metrics on a bounded pool of
//! tokio tasks. A metric that errors or panics yields a failed
//! [`MetricResult`] and never affects its siblings.

use crate::errors::similarity::with_suggestion;
use crate::errors::MetricEvaluationError;
use crate::metrics_api::{BackendRegistry, ResolvedMetric, Score, Scored, ScoringInput};
use crate::model::{MetricResult, ScoreType, TestCase, TestConfiguration};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_METRIC_WORKERS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMetric {
    pub reason: String,
    pub score_type: ScoreType,
}

/// Metric configs of one configuration, resolved once and shared by every
/// test case of the run.
#[derive(Debug, Clone, Default)]
pub struct MetricPlan {
    resolved: BTreeMap<String, ResolvedMetric>,
    rejected: BTreeMap<String, RejectedMetric>,
}

impl MetricPlan {
    pub fn build(cfg: &TestConfiguration, registry: &BackendRegistry) -> Self {
        let mut plan = MetricPlan::default();

        for (name, metric_cfg) in &cfg.metrics {
            match ResolvedMetric::resolve(name, metric_cfg, registry) {
                Ok(m) => {
                    plan.resolved.insert(name.clone(), m);
                }
                Err(MetricEvaluationError { metric, reason }) => {
                    tracing::warn!(configuration_id = %cfg.id, %metric, %reason, "metric rejected");
                    plan.rejected.insert(
                        metric,
                        RejectedMetric {
                            reason,
                            score_type: metric_cfg.score_type,
                        },
                    );
                }
            }
        }

        for tc in &cfg.tests {
            for name in &tc.metrics {
                if cfg.metrics.contains_key(name) || plan.rejected.contains_key(name) {
                    continue;
                }
                let reason = with_suggestion(
                    format!("metric '{}' is not defined in the configuration", name),
                    name,
                    cfg.metrics.keys(),
                );
                tracing::warn!(configuration_id = %cfg.id, metric = %name, %reason, "metric rejected");
                plan.rejected.insert(
                    name.clone(),
                    RejectedMetric {
                        reason,
                        score_type: ScoreType::Numeric,
                    },
                );
            }
        }

        plan
    }

    pub fn rejected(&self) -> &BTreeMap<String, RejectedMetric> {
        &self.rejected
    }

    pub fn rejection_reasons(&self) -> BTreeMap<String, String> {
        self.rejected
            .iter()
            .map(|(k, v)| (k.clone(), v.reason.clone()))
            .collect()
    }

    /// Metrics to score for `tc`, plus pre-filled failed entries for the ones
    /// that were rejected so the result says why they were skipped.
    pub fn for_test_case(&self, tc: &TestCase) -> (Vec<ResolvedMetric>, BTreeMap<String, MetricResult>) {
        let mut runnable = Vec::new();
        let mut skipped = BTreeMap::new();
        for name in &tc.metrics {
            if let Some(m) = self.resolved.get(name) {
                runnable.push(m.clone());
            } else if let Some(r) = self.rejected.get(name) {
                skipped.insert(
                    name.clone(),
                    MetricResult::failed(r.score_type, format!("skipped: {}", r.reason)),
                );
            }
        }
        (runnable, skipped)
    }
}

#[derive(Clone)]
pub struct MetricEngine {
    registry: BackendRegistry,
    workers: usize,
}

impl MetricEngine {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            workers: DEFAULT_METRIC_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Scores `input` with every metric. An empty metric list yields an empty
    /// map; dropping the returned future aborts outstanding scoring tasks.
    pub async fn evaluate(
        &self,
        input: &ScoringInput,
        metrics: &[ResolvedMetric],
    ) -> BTreeMap<String, MetricResult> {
        let mut out = BTreeMap::new();
        if metrics.is_empty() {
            return out;
        }

        let sem = Arc::new(Semaphore::new(self.workers));
        let input = Arc::new(input.clone());
        let mut join_set = JoinSet::new();
        let mut by_task = HashMap::new();

        for metric in metrics {
            let backend = self.registry.get(&metric.backend);
            let sem = sem.clone();
            let input = input.clone();
            let m = metric.clone();
            let handle = join_set.spawn(async move {
                let _permit = sem.acquire_owned().await?;
                let backend = backend
                    .ok_or_else(|| anyhow::anyhow!("backend '{}' is not registered", m.backend))?;
                backend.score(&m, &input).await
            });
            by_task.insert(handle.id(), metric);
        }

        while let Some(res) = join_set.join_next_with_id().await {
            let (id, result) = match res {
                Ok((id, Ok(scored))) => (id, Ok(scored)),
                Ok((id, Err(e))) => (id, Err(format!("{e:#}"))),
                Err(join_err) => (join_err.id(), Err(format!("scoring task aborted: {join_err}"))),
            };
            let Some(metric) = by_task.get(&id) else {
                continue;
            };
            let result = match result {
                Ok(scored) => judge(metric, scored),
                Err(reason) => {
                    let err = MetricEvaluationError {
                        metric: metric.name.clone(),
                        reason,
                    };
                    tracing::warn!(metric = %metric.name, backend = %metric.backend, error = %err, "metric evaluation failed");
                    MetricResult::failed(metric.score_type, err.to_string())
                }
            };
            out.insert(metric.name.clone(), result);
        }

        out
    }
}

/// Applies the metric's pass rule to a backend score.
pub fn judge(metric: &ResolvedMetric, scored: Scored) -> MetricResult {
    match (metric.score_type, scored.score) {
        (ScoreType::Numeric, Score::Numeric(score)) => {
            if !score.is_finite() {
                return MetricResult::failed(
                    ScoreType::Numeric,
                    format!("backend returned non-finite score {}", score),
                );
            }
            MetricResult {
                score,
                is_successful: metric.threshold_operator.compare(score, metric.threshold),
                reason: scored.reason,
                threshold_used: Some(metric.threshold),
                score_type: ScoreType::Numeric,
                category: None,
                evaluation_failed: false,
            }
        }
        (ScoreType::Categorical, Score::Category(category)) => {
            let wanted = category.trim();
            let passed = metric
                .passing_categories
                .iter()
                .any(|c| c.trim().eq_ignore_ascii_case(wanted));
            MetricResult {
                score: if passed { 1.0 } else { 0.0 },
                is_successful: passed,
                reason: scored.reason,
                threshold_used: None,
                score_type: ScoreType::Categorical,
                category: Some(category),
                evaluation_failed: false,
            }
        }
        (ScoreType::Numeric, Score::Category(c)) => MetricResult::failed(
            ScoreType::Numeric,
            format!("backend returned category '{}' for a numeric metric", c),
        ),
        (ScoreType::Categorical, Score::Numeric(s)) => MetricResult::failed(
            ScoreType::Categorical,
            format!("backend returned numeric score {} for a categorical metric", s),
        ),
    }
}
