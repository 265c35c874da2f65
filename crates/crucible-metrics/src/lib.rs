//! Built-in metric backend (`builtin`) for crucible.
//!
//! Each metric class lives in its own module and implements [`BuiltinMetric`];
//! [`BuiltinBackend`] routes a resolved metric to the class it names.

use async_trait::async_trait;
use crucible_core::metrics_api::{BackendRegistry, MetricBackend, ResolvedMetric, Scored, ScoringInput};
use std::sync::Arc;

pub mod contains;
pub mod exact_match;
pub mod json_schema;
pub mod refusal;
pub mod regex_match;
pub mod similarity;

pub const BUILTIN_BACKEND_ID: &str = "builtin";

/// One metric class of the builtin backend.
#[async_trait]
pub trait BuiltinMetric: Send + Sync {
    fn class(&self) -> &'static str;

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored>;
}

pub fn default_metrics() -> Vec<Arc<dyn BuiltinMetric>> {
    vec![
        Arc::new(contains::ContainsMetric),
        Arc::new(exact_match::ExactMatchMetric),
        Arc::new(regex_match::RegexMetric),
        Arc::new(similarity::StringSimilarityMetric),
        Arc::new(json_schema::JsonSchemaMetric),
        Arc::new(refusal::RefusalMetric),
    ]
}

pub struct BuiltinBackend {
    metrics: Vec<Arc<dyn BuiltinMetric>>,
}

impl BuiltinBackend {
    pub fn new(metrics: Vec<Arc<dyn BuiltinMetric>>) -> Self {
        Self { metrics }
    }

    pub fn classes(&self) -> Vec<&'static str> {
        self.metrics.iter().map(|m| m.class()).collect()
    }

    fn find(&self, class: &str) -> Option<&Arc<dyn BuiltinMetric>> {
        self.metrics.iter().find(|m| m.class() == class)
    }
}

impl Default for BuiltinBackend {
    fn default() -> Self {
        Self::new(default_metrics())
    }
}

#[async_trait]
impl MetricBackend for BuiltinBackend {
    fn id(&self) -> &'static str {
        BUILTIN_BACKEND_ID
    }

    fn supports(&self, class: &str) -> bool {
        self.find(class).is_some()
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let m = self
            .find(&metric.class)
            .ok_or_else(|| anyhow::anyhow!("builtin backend has no class '{}'", metric.class))?;
        tracing::debug!(metric = %metric.name, class = m.class(), "scoring with builtin backend");
        m.score(metric, input).await
    }
}

/// Registry holding every backend shipped with crucible.
pub fn default_backends() -> BackendRegistry {
    BackendRegistry::new().with(Arc::new(BuiltinBackend::default()))
}

pub(crate) fn param_str<'a>(metric: &'a ResolvedMetric, key: &str) -> Option<&'a str> {
    metric.params.get(key).and_then(|v| v.as_str())
}

pub(crate) fn param_bool(metric: &ResolvedMetric, key: &str, default: bool) -> bool {
    metric
        .params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

/// Reference answer for metrics that compare against one.
pub(crate) fn expected_output<'a>(metric: &ResolvedMetric, input: &'a ScoringInput) -> anyhow::Result<&'a str> {
    input.expected_output.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "config error: metric '{}' ({}) needs 'expected_output' on the test case",
            metric.name,
            metric.class
        )
    })
}
