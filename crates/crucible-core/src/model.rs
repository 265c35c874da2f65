use crate::tenant::TenantContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Sequential => "sequential",
        }
    }
}

/// How a test case talks to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    SingleTurn,
    MultiTurn,
}

impl Modality {
    /// Unknown and legacy tags fall back to single-turn.
    pub fn parse(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return Modality::SingleTurn;
        };
        match tag.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "multi_turn" | "multiturn" | "conversation" | "agentic" => Modality::MultiTurn,
            _ => Modality::SingleTurn,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::SingleTurn => "single_turn",
            Modality::MultiTurn => "multi_turn",
        }
    }
}

fn default_target_kind() -> String {
    "fake".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub name: String,
    #[serde(default = "default_target_kind")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// JSON pointer into the target's response body that holds the output text.
    #[serde(default)]
    pub response_pointer: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl TargetRef {
    /// Reason the target cannot be invoked, if any.
    pub fn unresolvable_reason(&self) -> Option<String> {
        if self.name.trim().is_empty() {
            return Some("target name is empty".into());
        }
        if self.kind == "http"
            && self
                .endpoint
                .as_deref()
                .map_or(true, |e| e.trim().is_empty())
        {
            return Some(format!("http target '{}' has no endpoint", self.name));
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSpec {
    pub goal: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Scripted user turns, sent in order.
    #[serde(default)]
    pub script: Vec<String>,
    /// Text that, once present in a target reply, means the goal was reached.
    #[serde(default)]
    pub success_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Names of entries in the configuration's `metrics` table.
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub conversation: Option<ConversationSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TestCase {
    pub fn modality(&self) -> Modality {
        Modality::parse(self.modality.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    #[default]
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[serde(rename = "=", alias = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "≠", alias = "ne")]
    Ne,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "≤", alias = "le")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[default]
    #[serde(rename = ">=", alias = "≥", alias = "ge")]
    Ge,
}

impl ThresholdOperator {
    const EPSILON: f64 = 1e-9;

    pub fn compare(&self, score: f64, threshold: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        let equal = (score - threshold).abs() <= Self::EPSILON;
        match self {
            ThresholdOperator::Eq => equal,
            ThresholdOperator::Ne => !equal,
            ThresholdOperator::Lt => score < threshold && !equal,
            ThresholdOperator::Le => score < threshold || equal,
            ThresholdOperator::Gt => score > threshold && !equal,
            ThresholdOperator::Ge => score > threshold || equal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOperator::Eq => "=",
            ThresholdOperator::Ne => "!=",
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Le => "<=",
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricConfig {
    #[serde(default, alias = "class_name")]
    pub class: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub score_type: ScoreType,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub threshold_operator: ThresholdOperator,
    #[serde(default)]
    pub passing_categories: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub soft_time_limit_secs: Option<u64>,
    pub hard_time_limit_secs: Option<u64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Units executing at once in parallel mode.
    pub queue_workers: Option<usize>,
    /// Metrics scored at once for one test case.
    pub metric_workers: Option<usize>,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    #[serde(default = "default_version")]
    pub version: u32,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub target: Option<TargetRef>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl TestConfiguration {
    pub fn test_case(&self, id: &str) -> Option<&TestCase> {
        self.tests.iter().find(|tc| tc.id == id)
    }

    /// sha256 over the JSON encoding; identifies exactly what a run executed.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Progress,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Progress)
    }

    /// Progress is the only state with outgoing edges.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        *self == RunStatus::Progress && next.is_terminal()
    }

    /// Terminal verdict for a fully resolved run.
    pub fn verdict(completed: u32, total: u32) -> RunStatus {
        if total == 0 || completed == 0 {
            RunStatus::Failed
        } else if completed >= total {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Progress => "progress",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(RunStatus::Progress),
            "completed" => Some(RunStatus::Completed),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunAttributes {
    /// metric name -> mean numeric score
    #[serde(default)]
    pub aggregated_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub mean_execution_time_ms: Option<f64>,
    /// metric name -> why it was not scored
    #[serde(default)]
    pub metric_warnings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub configuration_id: String,
    pub config_digest: String,
    pub tenant: TenantContext,
    pub status: RunStatus,
    pub total_tests: u32,
    pub completed_tests: u32,
    pub failed_tasks: u32,
    pub skipped_tests: u32,
    pub attributes: RunAttributes,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retired: bool,
}

impl TestRun {
    pub fn new(cfg: &TestConfiguration, tenant: TenantContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            configuration_id: cfg.id.clone(),
            config_digest: cfg.digest(),
            tenant,
            status: RunStatus::Progress,
            total_tests: cfg.tests.len() as u32,
            completed_tests: 0,
            failed_tasks: 0,
            skipped_tests: 0,
            attributes: RunAttributes::default(),
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
            retired: false,
        }
    }

    pub fn resolved_units(&self) -> u32 {
        self.completed_tests + self.failed_tasks + self.skipped_tests
    }
}

/// Snapshot returned to pollers; safe to read mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub status: RunStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub aggregated_metrics: BTreeMap<String, f64>,
    pub last_error: Option<String>,
}

impl From<&TestRun> for RunStatusView {
    fn from(run: &TestRun) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            total: run.total_tests,
            completed: run.completed_tests,
            failed: run.failed_tasks,
            skipped: run.skipped_tests,
            aggregated_metrics: run.attributes.aggregated_metrics.clone(),
            last_error: run.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Units of work
// ---------------------------------------------------------------------------

/// One test case's execution. Lives only inside the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    test_case_id: String,
    run_id: String,
    tenant: TenantContext,
    attempt_count: u32,
}

impl ExecutionUnit {
    pub fn new(run_id: impl Into<String>, test_case_id: impl Into<String>, tenant: TenantContext) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            run_id: run_id.into(),
            tenant,
            attempt_count: 0,
        }
    }

    pub fn test_case_id(&self) -> &str {
        &self.test_case_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Envelope for the next attempt; identity is copied, never re-injected.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Score reported when a metric could not produce one.
pub const SENTINEL_SCORE: f64 = 0.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub score: f64,
    pub is_successful: bool,
    pub reason: String,
    pub threshold_used: Option<f64>,
    pub score_type: ScoreType,
    #[serde(default)]
    pub category: Option<String>,
    /// True when the backend failed and `score` is [`SENTINEL_SCORE`].
    #[serde(default)]
    pub evaluation_failed: bool,
}

impl MetricResult {
    pub fn failed(score_type: ScoreType, reason: impl Into<String>) -> Self {
        Self {
            score: SENTINEL_SCORE,
            is_successful: false,
            reason: reason.into(),
            threshold_used: None,
            score_type,
            category: None,
            evaluation_failed: true,
        }
    }

    pub fn counts_toward_aggregate(&self) -> bool {
        !self.evaluation_failed && self.score_type == ScoreType::Numeric && self.score.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pass,
    Fail,
    Error,
}

impl ResultStatus {
    /// Derived from the metrics that actually scored; nothing scored means Error.
    pub fn from_metrics(metrics: &BTreeMap<String, MetricResult>) -> Self {
        let mut scored = metrics.values().filter(|m| !m.evaluation_failed).peekable();
        if scored.peek().is_none() {
            return ResultStatus::Error;
        }
        if scored.all(|m| m.is_successful) {
            ResultStatus::Pass
        } else {
            ResultStatus::Fail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Fail => "fail",
            ResultStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pass" => ResultStatus::Pass,
            "fail" => ResultStatus::Fail,
            _ => ResultStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Error,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRow {
    pub attempt_no: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: String,
    pub test_case_id: String,
    pub output: Option<String>,
    pub metrics: BTreeMap<String, MetricResult>,
    pub status: ResultStatus,
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub attempts: Vec<AttemptRow>,
    #[serde(default)]
    pub transcript: Vec<ConversationTurn>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a unit reports to the fan-in once it stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub test_case_id: String,
    pub status: ResultStatus,
    pub execution_time_ms: u64,
    pub metrics: BTreeMap<String, MetricResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum UnitResolution {
    Succeeded(UnitOutcome),
    Failed { test_case_id: String, reason: String },
    Skipped { test_case_id: String },
}

impl UnitResolution {
    pub fn test_case_id(&self) -> &str {
        match self {
            UnitResolution::Succeeded(o) => &o.test_case_id,
            UnitResolution::Failed { test_case_id, .. } => test_case_id,
            UnitResolution::Skipped { test_case_id } => test_case_id,
        }
    }

    pub fn outcome(&self) -> Option<&UnitOutcome> {
        match self {
            UnitResolution::Succeeded(o) => Some(o),
            _ => None,
        }
    }

    pub fn progress(&self) -> UnitProgress {
        match self {
            UnitResolution::Succeeded(_) => UnitProgress::Succeeded,
            UnitResolution::Failed { .. } => UnitProgress::Failed,
            UnitResolution::Skipped { .. } => UnitProgress::Skipped,
        }
    }
}

/// Rebuilds a unit's resolution from its stored result. Results written by
/// a failed unit carry an error and no metrics.
impl From<&TestResult> for UnitResolution {
    fn from(r: &TestResult) -> Self {
        match (&r.error, r.metrics.is_empty()) {
            (Some(reason), true) => UnitResolution::Failed {
                test_case_id: r.test_case_id.clone(),
                reason: reason.clone(),
            },
            _ => UnitResolution::Succeeded(UnitOutcome {
                test_case_id: r.test_case_id.clone(),
                status: r.status,
                execution_time_ms: r.execution_time_ms.unwrap_or_default(),
                metrics: r.metrics.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitProgress {
    Succeeded,
    Failed,
    Skipped,
}
