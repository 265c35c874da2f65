use crate::{expected_output, param_bool, BuiltinMetric};
use async_trait::async_trait;
use crucible_core::metrics_api::{ResolvedMetric, Scored, ScoringInput};

/// Normalized Levenshtein similarity between output and expected output.
pub struct StringSimilarityMetric;

#[async_trait]
impl BuiltinMetric for StringSimilarityMetric {
    fn class(&self) -> &'static str {
        "string_similarity"
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let expected = expected_output(metric, input)?;
        let (a, b) = if param_bool(metric, "case_sensitive", false) {
            (input.output.trim().to_string(), expected.trim().to_string())
        } else {
            (input.output.trim().to_lowercase(), expected.trim().to_lowercase())
        };
        let score = strsim::normalized_levenshtein(&a, &b);
        Ok(Scored::numeric(score, format!("similarity {:.3}", score)))
    }
}
