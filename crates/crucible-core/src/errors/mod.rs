pub mod similarity;

use thiserror::Error;

/// Invalid or empty test configuration. Raised before any dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("failed to read config {path}: {detail}")]
    Read { path: String, detail: String },

    #[error("failed to parse config {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("unsupported config version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("configuration '{id}' has no test cases")]
    EmptyTestSet { id: String },

    #[error("configuration '{id}' has no resolvable target: {detail}")]
    UnresolvableTarget { id: String, detail: String },

    #[error("duplicate test case id '{test_case_id}' in configuration '{id}'")]
    DuplicateTestCase { id: String, test_case_id: String },

    #[error("configuration '{id}' not found")]
    NotFound { id: String },

    #[error("invalid tenant context: {0}")]
    InvalidTenant(String),
}

/// A single unit's execution failed. Retried per policy, never propagated past
/// the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("target invocation failed: {detail}")]
    Invocation { detail: String },

    #[error("target returned an empty response")]
    EmptyResponse,

    #[error("conversation agent failed: {detail}")]
    Agent { detail: String },

    #[error("attempt exceeded soft time limit of {limit_secs}s")]
    SoftTimeLimit { limit_secs: u64 },

    #[error("unit exceeded hard time limit of {limit_secs}s")]
    HardTimeLimit { limit_secs: u64 },

    #[error("test case '{0}' is not part of the configuration")]
    UnknownTestCase(String),
}

impl ExecutionError {
    pub fn invocation(e: &anyhow::Error) -> Self {
        ExecutionError::Invocation {
            detail: format!("{e:#}"),
        }
    }

    /// Time limits and unknown cases abandon the unit instead of retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Invocation { .. }
                | ExecutionError::EmptyResponse
                | ExecutionError::Agent { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecutionError::SoftTimeLimit { .. } | ExecutionError::HardTimeLimit { .. }
        )
    }
}

/// One metric failed to score. Isolated to that metric's result entry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("metric '{metric}' failed: {reason}")]
pub struct MetricEvaluationError {
    pub metric: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Fan-in saw a different number of outcomes than units dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("fan-in for run {run_id} received {received} outcomes, expected {expected}")]
pub struct AggregationConsistencyError {
    pub run_id: String,
    pub expected: u32,
    pub received: usize,
}

/// Errors surfaced by the exposed run service.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("run '{0}' not found")]
    RunNotFound(String),
}

/// Stable snake_case identifiers recorded in result details and summaries.
pub trait ErrorKind {
    fn kind(&self) -> &'static str;
}

impl ErrorKind for ConfigurationError {
    fn kind(&self) -> &'static str {
        "configuration_error"
    }
}

impl ErrorKind for ExecutionError {
    fn kind(&self) -> &'static str {
        match self {
            ExecutionError::SoftTimeLimit { .. } => "soft_time_limit",
            ExecutionError::HardTimeLimit { .. } => "hard_time_limit",
            _ => "execution_error",
        }
    }
}

impl ErrorKind for MetricEvaluationError {
    fn kind(&self) -> &'static str {
        "metric_evaluation_error"
    }
}

impl ErrorKind for StorageError {
    fn kind(&self) -> &'static str {
        "storage_error"
    }
}

impl ErrorKind for AggregationConsistencyError {
    fn kind(&self) -> &'static str {
        "aggregation_consistency_error"
    }
}

impl ErrorKind for EngineError {
    fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(e) => e.kind(),
            EngineError::Storage(e) => e.kind(),
            EngineError::RunNotFound(_) => "run_not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_not_retryable() {
        assert!(!ExecutionError::SoftTimeLimit { limit_secs: 300 }.is_retryable());
        assert!(!ExecutionError::HardTimeLimit { limit_secs: 600 }.is_retryable());
        assert!(ExecutionError::EmptyResponse.is_retryable());
        assert!(ExecutionError::invocation(&anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn invocation_keeps_error_chain() {
        let e = anyhow::anyhow!("connection reset").context("POST /chat");
        let ExecutionError::Invocation { detail } = ExecutionError::invocation(&e) else {
            panic!("expected invocation error");
        };
        assert!(detail.contains("POST /chat"));
        assert!(detail.contains("connection reset"));
    }

    #[test]
    fn engine_error_kind_delegates() {
        let e: EngineError = ConfigurationError::EmptyTestSet { id: "c".into() }.into();
        assert_eq!(e.kind(), "configuration_error");
        assert_eq!(e.to_string(), "configuration 'c' has no test cases");
    }
}
