use crate::cli::args::StopArgs;
use crate::exit_codes;

use super::{engine_exit, open_service, tenant};

/// A CLI process only dispatches its own runs, so a run still in progress
/// here belongs to a process that is gone (Ctrl-C during `run` stops a live
/// one). It is finalized from the results it already stored.
pub(crate) fn run(args: StopArgs) -> anyhow::Result<i32> {
    let svc = open_service(&args.scope)?;
    let scope = tenant(&args.scope);
    match svc.abandon_run(&args.run_id, &scope) {
        Ok(Some(run)) => {
            println!(
                "Run {} finalized as {} ({} completed, {} failed, {} skipped)",
                run.id,
                run.status.as_str(),
                run.completed_tests,
                run.failed_tasks,
                run.skipped_tests
            );
            Ok(exit_codes::OK)
        }
        Ok(None) => {
            let status = svc.get_run_status(&args.run_id, &scope)?;
            println!("Run {} is already {}", status.run_id, status.status.as_str());
            Ok(exit_codes::OK)
        }
        Err(e) => engine_exit(e),
    }
}
