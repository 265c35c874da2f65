use crate::{expected_output, param_bool, BuiltinMetric};
use async_trait::async_trait;
use crucible_core::metrics_api::{ResolvedMetric, Scored, ScoringInput};

/// Fraction of required substrings present in the output.
///
/// Substrings come from `params.substrings`; without it the test case's
/// expected output is the single required substring.
pub struct ContainsMetric;

#[async_trait]
impl BuiltinMetric for ContainsMetric {
    fn class(&self) -> &'static str {
        "contains"
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let needles: Vec<String> = match metric.params.get("substrings") {
            Some(v) => {
                let arr = v
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("config error: 'substrings' must be a list of strings"))?;
                arr.iter()
                    .map(|s| {
                        s.as_str()
                            .map(String::from)
                            .ok_or_else(|| anyhow::anyhow!("config error: 'substrings' must be a list of strings"))
                    })
                    .collect::<anyhow::Result<_>>()?
            }
            None => vec![expected_output(metric, input)?.to_string()],
        };
        if needles.is_empty() {
            anyhow::bail!("config error: 'substrings' is empty");
        }

        let case_sensitive = param_bool(metric, "case_sensitive", true);
        let haystack = if case_sensitive {
            input.output.clone()
        } else {
            input.output.to_lowercase()
        };

        let missing: Vec<&str> = needles
            .iter()
            .filter(|n| {
                let n = if case_sensitive { n.to_string() } else { n.to_lowercase() };
                !haystack.contains(&n)
            })
            .map(String::as_str)
            .collect();

        let found = needles.len() - missing.len();
        let score = found as f64 / needles.len() as f64;
        let reason = if missing.is_empty() {
            format!("all {} substrings present", needles.len())
        } else {
            format!("missing substring: {}", missing.join(", "))
        };
        Ok(Scored::numeric(score, reason))
    }
}
