//! Test-run execution engine.
//!
//! A run executes every test case of a [`model::TestConfiguration`] against a
//! target, scores each output with the configured metrics and folds the
//! per-unit outcomes into one terminal verdict. Entry point for callers is
//! [`engine::service::RunService`].

pub mod config;
pub mod engine;
pub mod errors;
pub mod evaluation;
pub mod executor;
pub mod metrics_api;
pub mod model;
pub mod providers;
pub mod report;
pub mod storage;
pub mod tenant;

pub use engine::service::RunService;
pub use tenant::TenantContext;
