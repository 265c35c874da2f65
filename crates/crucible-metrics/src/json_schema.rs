use crate::BuiltinMetric;
use async_trait::async_trait;
use crucible_core::metrics_api::{ResolvedMetric, Scored, ScoringInput};
use serde_json::Value;

const MAX_REPORTED_ERRORS: usize = 5;

/// Parses the output as JSON and validates it against `params.schema`.
///
/// Output that is not JSON scores 0.0; a schema that does not compile is a
/// configuration error.
pub struct JsonSchemaMetric;

#[async_trait]
impl BuiltinMetric for JsonSchemaMetric {
    fn class(&self) -> &'static str {
        "json_schema"
    }

    async fn score(&self, metric: &ResolvedMetric, input: &ScoringInput) -> anyhow::Result<Scored> {
        let schema = metric
            .params
            .get("schema")
            .ok_or_else(|| anyhow::anyhow!("config error: json_schema metric '{}' needs 'params.schema'", metric.name))?;
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| anyhow::anyhow!("config error: invalid schema for '{}': {}", metric.name, e))?;

        let instance: Value = match serde_json::from_str(input.output.trim()) {
            Ok(v) => v,
            Err(e) => return Ok(Scored::numeric(0.0, format!("output is not valid JSON: {}", e))),
        };

        if validator.is_valid(&instance) {
            return Ok(Scored::numeric(1.0, "output matches schema"));
        }
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();
        Ok(Scored::numeric(0.0, format!("schema violations: {}", errors.join("; "))))
    }
}
