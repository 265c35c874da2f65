pub const DDL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS configurations (
  org_id TEXT NOT NULL,
  id TEXT NOT NULL,
  digest TEXT NOT NULL,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (org_id, id)
);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  correlation_id TEXT NOT NULL,
  configuration_id TEXT NOT NULL,
  config_digest TEXT NOT NULL,
  status TEXT NOT NULL,
  total_tests INTEGER NOT NULL,
  completed_tests INTEGER NOT NULL DEFAULT 0,
  failed_tasks INTEGER NOT NULL DEFAULT 0,
  skipped_tests INTEGER NOT NULL DEFAULT 0,
  attributes_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  last_error TEXT,
  retired INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  org_id TEXT NOT NULL,
  test_case_id TEXT NOT NULL,
  status TEXT NOT NULL,
  output TEXT,
  metrics_json TEXT NOT NULL,
  execution_time_ms INTEGER,
  attempts_json TEXT,
  transcript_json TEXT,
  error TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(run_id, test_case_id)
);

CREATE INDEX IF NOT EXISTS idx_runs_org ON runs(org_id, started_at);
CREATE INDEX IF NOT EXISTS idx_results_run ON results(org_id, run_id);
"#;
