use super::args::{Cli, Command, ScopeArgs};
use crucible_core::errors::EngineError;
use crucible_core::providers::target::fake::FakeInvoker;
use crucible_core::providers::target::http::HttpInvoker;
use crucible_core::providers::target::InvokerRegistry;
use crucible_core::storage::Store;
use crucible_core::{RunService, TenantContext};
use std::path::Path;
use std::sync::Arc;

pub mod results;
pub mod run;
pub mod status;
pub mod stop;
pub mod validate;

use crate::exit_codes;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => run::run(args).await,
        Command::Status(args) => status::run(args),
        Command::Results(args) => results::run(args),
        Command::Validate(args) => validate::run(args),
        Command::Stop(args) => stop::run(args),
    }
}

/// Every target transport the CLI knows how to reach.
pub(crate) fn invokers() -> InvokerRegistry {
    InvokerRegistry::new()
        .with(Arc::new(FakeInvoker::echo()))
        .with(Arc::new(HttpInvoker::new()))
}

pub(crate) fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn open_service(scope: &ScopeArgs) -> anyhow::Result<RunService> {
    ensure_parent_dir(&scope.db)?;
    let store = Store::open(&scope.db)?;
    store.init_schema()?;
    Ok(RunService::new(
        Arc::new(store),
        Arc::new(invokers()),
        crucible_metrics::default_backends(),
    ))
}

pub(crate) fn tenant(scope: &ScopeArgs) -> TenantContext {
    TenantContext::new(scope.org.clone(), scope.user.clone())
}

/// Maps the errors a user can act on to exit codes; the rest propagate.
pub(crate) fn engine_exit(err: EngineError) -> anyhow::Result<i32> {
    match err {
        EngineError::Configuration(e) => {
            eprintln!("config error: {e}");
            Ok(exit_codes::CONFIG_ERROR)
        }
        EngineError::RunNotFound(id) => {
            eprintln!("run '{id}' not found");
            Ok(exit_codes::NOT_FOUND)
        }
        other => Err(other.into()),
    }
}
