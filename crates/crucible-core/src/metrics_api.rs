use crate::errors::similarity::with_suggestion;
use crate::errors::MetricEvaluationError;
use crate::model::{MetricConfig, ScoreType, ThresholdOperator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Numeric threshold applied when a metric config omits one.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub enum Score {
    Numeric(f64),
    Category(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub score: Score,
    pub reason: String,
}

impl Scored {
    pub fn numeric(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score: Score::Numeric(score),
            reason: reason.into(),
        }
    }

    pub fn category(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            score: Score::Category(category.into()),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringInput {
    pub input: String,
    pub output: String,
    pub expected_output: Option<String>,
    pub context: Vec<String>,
}

/// A metric config with every required field present and its backend known.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub name: String,
    pub class: String,
    pub backend: String,
    pub score_type: ScoreType,
    pub threshold: f64,
    pub threshold_operator: ThresholdOperator,
    pub passing_categories: Vec<String>,
    pub params: serde_json::Value,
}

impl ResolvedMetric {
    /// Validates `cfg` against the registered backends. The error reason is
    /// meant for operators ("why was this metric skipped").
    pub fn resolve(
        name: &str,
        cfg: &MetricConfig,
        registry: &BackendRegistry,
    ) -> Result<Self, MetricEvaluationError> {
        let reject = |reason: String| MetricEvaluationError {
            metric: name.to_string(),
            reason,
        };

        let class = cfg
            .class
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| reject("missing required field 'class'".into()))?;
        let backend_id = cfg
            .backend
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| reject("missing required field 'backend'".into()))?;

        let backend = registry.get(backend_id).ok_or_else(|| {
            let ids = registry.ids();
            reject(with_suggestion(
                format!("backend '{}' is not registered", backend_id),
                backend_id,
                ids.iter(),
            ))
        })?;
        if !backend.supports(class) {
            return Err(reject(format!(
                "backend '{}' does not provide class '{}'",
                backend_id, class
            )));
        }

        if cfg.score_type == ScoreType::Categorical && cfg.passing_categories.is_empty() {
            return Err(reject(
                "categorical metric needs at least one entry in 'passing_categories'".into(),
            ));
        }
        if let Some(t) = cfg.threshold {
            if !t.is_finite() {
                return Err(reject(format!("threshold {} is not a finite number", t)));
            }
        }

        Ok(Self {
            name: name.to_string(),
            class: class.to_string(),
            backend: backend_id.to_string(),
            score_type: cfg.score_type,
            threshold: cfg.threshold.unwrap_or(DEFAULT_THRESHOLD),
            threshold_operator: cfg.threshold_operator,
            passing_categories: cfg.passing_categories.clone(),
            params: cfg.params.clone(),
        })
    }
}

#[async_trait]
pub trait MetricBackend: Send + Sync {
    fn id(&self) -> &'static str;

    fn supports(&self, class: &str) -> bool;

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored>;
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn MetricBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn MetricBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: Arc<dyn MetricBackend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn MetricBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }
}
