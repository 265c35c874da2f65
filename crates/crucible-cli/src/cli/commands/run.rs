use crate::cli::args::{OutputFormat, RunArgs};
use crate::exit_codes;
use crucible_core::config::load_config;
use crucible_core::engine::retry::RetryPolicy;
use crucible_core::model::RunStatus;
use crucible_core::report::progress::default_progress_sink;
use crucible_core::report::RunSummary;
use crucible_core::TenantContext;

use super::{engine_exit, open_service};

pub(crate) async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let tenant = match &args.correlation_id {
        Some(id) => TenantContext::with_correlation_id(args.scope.org.clone(), args.scope.user.clone(), id.clone()),
        None => super::tenant(&args.scope),
    };

    let mut svc = open_service(&args.scope)?;
    if let Some(n) = args.queue_workers {
        svc = svc.with_queue_workers(n);
    }
    if let Some(n) = args.max_attempts {
        let mut policy = RetryPolicy::from(&cfg.settings.retry);
        policy.max_attempts = n.max(1);
        svc = svc.with_retry_policy(policy);
    }
    if !args.no_progress {
        if let Some(sink) = default_progress_sink(cfg.tests.len()) {
            svc = svc.with_progress(sink);
        }
    }

    let run_id = match svc.run_configuration(&cfg, &tenant).await {
        Ok(id) => id,
        Err(e) => return engine_exit(e),
    };
    tracing::info!(run_id = %run_id, test_cases = cfg.tests.len(), org_id = %tenant.org_id(), "started run");

    tokio::select! {
        res = svc.wait_for_run(&run_id, &tenant) => { res?; }
        _ = tokio::signal::ctrl_c() => {
            svc.stop_run(&run_id, &tenant)?;
            tracing::warn!(run_id = %run_id, "stop requested; waiting for running test cases to finish");
            svc.wait_for_run(&run_id, &tenant).await?;
        }
    }

    let summary = svc.summary(&run_id, &tenant)?;
    match args.format {
        OutputFormat::Text => print!("{}", summary.render_console()),
        OutputFormat::Json => println!("{}", summary.to_json()?),
    }
    Ok(decide_run_exit(&summary))
}

fn decide_run_exit(summary: &RunSummary) -> i32 {
    if summary.status == RunStatus::Completed && summary.fail == 0 && summary.error == 0 {
        exit_codes::OK
    } else {
        exit_codes::TEST_FAILED
    }
}
