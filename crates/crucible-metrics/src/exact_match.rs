use crate::{expected_output, param_bool, BuiltinMetric};
use async_trait::async_trait;
use crucible_core::metrics_api::{ResolvedMetric, Scored, ScoringInput};

/// 1.0 when the trimmed output equals the expected output, else 0.0.
pub struct ExactMatchMetric;

#[async_trait]
impl BuiltinMetric for ExactMatchMetric {
    fn class(&self) -> &'static str {
        "exact_match"
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let expected = expected_output(metric, input)?.trim();
        let actual = input.output.trim();
        let equal = if param_bool(metric, "case_sensitive", true) {
            actual == expected
        } else {
            actual.eq_ignore_ascii_case(expected)
        };
        if equal {
            Ok(Scored::numeric(1.0, "output matches expected"))
        } else {
            Ok(Scored::numeric(0.0, format!("expected '{}', got '{}'", expected, actual)))
        }
    }
}
