use crate::{param_bool, param_str, BuiltinMetric};
use async_trait::async_trait;
use crucible_core::metrics_api::{ResolvedMetric, Scored, ScoringInput};
use regex::RegexBuilder;

/// Scores 1.0 when `params.pattern` matches the output.
pub struct RegexMetric;

#[async_trait]
impl BuiltinMetric for RegexMetric {
    fn class(&self) -> &'static str {
        "regex"
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let pattern = param_str(metric, "pattern")
            .ok_or_else(|| anyhow::anyhow!("config error: regex metric '{}' needs 'params.pattern'", metric.name))?;
        let re = RegexBuilder::new(pattern)
            .case_insensitive(param_bool(metric, "case_insensitive", false))
            .build()
            .map_err(|e| anyhow::anyhow!("config error: invalid pattern '{}': {}", pattern, e))?;

        // `negate: true` turns the metric into a "must not match" check.
        let negate = param_bool(metric, "negate", false);
        let matched = re.find(&input.output);
        let pass = matched.is_some() != negate;
        let reason = match (matched, negate) {
            (Some(m), false) => format!("matched '{}'", m.as_str()),
            (None, false) => format!("no match for /{}/", pattern),
            (Some(m), true) => format!("forbidden match '{}'", m.as_str()),
            (None, true) => format!("no forbidden match for /{}/", pattern),
        };
        Ok(Scored::numeric(if pass { 1.0 } else { 0.0 }, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{input, metric};
    use crucible_core::metrics_api::Score;
    use serde_json::json;

    #[tokio::test]
    async fn matches_pattern() {
        let m = metric("regex", json!({"pattern": r"\d{4}-\d{2}-\d{2}"}));
        let s = RegexMetric.score(&m, &input("due 2024-05-01", None)).await.unwrap();
        assert_eq!(s.score, Score::Numeric(1.0));
        assert_eq!(s.reason, "matched '2024-05-01'");
    }

    #[tokio::test]
    async fn negated_pattern_passes_without_match() {
        let m = metric("regex", json!({"pattern": "(?i)password", "negate": true}));
        let s = RegexMetric.score(&m, &input("nothing secret", None)).await.unwrap();
        assert_eq!(s.score, Score::Numeric(1.0));
        let s = RegexMetric.score(&m, &input("the Password is", None)).await.unwrap();
        assert_eq!(s.score, Score::Numeric(0.0));
    }

    #[tokio::test]
    async fn bad_pattern_is_an_error() {
        let m = metric("regex", json!({"pattern": "("}));
        assert!(RegexMetric.score(&m, &input("x", None)).await.is_err());
        let m = metric("regex", json!({}));
        let err = RegexMetric.score(&m, &input("x", None)).await.unwrap_err();
        assert!(err.to_string().contains("params.pattern"));
    }
}
