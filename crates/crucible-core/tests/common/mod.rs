#![allow(dead_code)]

use async_trait::async_trait;
use crucible_core::engine::retry::RetryPolicy;
use crucible_core::metrics_api::{BackendRegistry, MetricBackend, ResolvedMetric, Scored, ScoringInput};
use crucible_core::model::TestConfiguration;
use crucible_core::providers::target::TargetInvoker;
use crucible_core::storage::Store;
use crucible_core::RunService;
use std::sync::Arc;

/// Reads the score from the first token of the output ("0.75 ..." -> 0.75).
pub struct LeadingNumber;

#[async_trait]
impl MetricBackend for LeadingNumber {
    fn id(&self) -> &'static str {
        "local"
    }

    fn supports(&self, class: &str) -> bool {
        class == "leading_number"
    }

    async fn score(&self, _m: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let token = input.output.split_whitespace().next().unwrap_or_default();
        let score: f64 = token.parse()?;
        Ok(Scored::numeric(score, format!("parsed {token}")))
    }
}

/// A registered backend whose endpoint never answers.
pub struct Unreachable;

#[async_trait]
impl MetricBackend for Unreachable {
    fn id(&self) -> &'static str {
        "remote"
    }

    fn supports(&self, _class: &str) -> bool {
        true
    }

    async fn score(&self, _m: &ResolvedMetric, _i: &ScoringInput) -> anyhow::Result<Scored> {
        anyhow::bail!("connection refused: remote scoring service")
    }
}

pub fn backends() -> BackendRegistry {
    BackendRegistry::new()
        .with(Arc::new(LeadingNumber))
        .with(Arc::new(Unreachable))
}

pub fn store() -> Arc<Store> {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    Arc::new(store)
}

pub fn service(store: Arc<Store>, invoker: Arc<dyn TargetInvoker>, attempts: u32) -> RunService {
    RunService::new(store, invoker, backends()).with_retry_policy(RetryPolicy::immediate(attempts))
}

/// Configuration whose test case i sends `prompts[i]` and is scored by `quality`.
pub fn config(id: &str, mode: &str, prompts: &[String]) -> TestConfiguration {
    let tests: String = if prompts.is_empty() {
        " []\n".to_string()
    } else {
        prompts
            .iter()
            .enumerate()
            .map(|(i, p)| format!("\n  - {{id: t{i}, prompt: \"{p}\", metrics: [quality]}}"))
            .collect::<String>()
            + "\n"
    };
    let raw = format!(
        "id: {id}\nmode: {mode}\ntarget: {{name: echo}}\nmetrics:\n  quality: {{class: leading_number, backend: local, threshold: 0.5}}\ntests:{tests}"
    );
    crucible_core::config::parse_config(&raw, "inline").unwrap()
}
