use crate::cli::args::{OutputFormat, StatusArgs};
use crate::exit_codes;

use super::{engine_exit, open_service, tenant};

pub(crate) fn run(args: StatusArgs) -> anyhow::Result<i32> {
    let svc = open_service(&args.scope)?;
    let view = match svc.get_run_status(&args.run_id, &tenant(&args.scope)) {
        Ok(v) => v,
        Err(e) => return engine_exit(e),
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => {
            println!("Run {}: {}", view.run_id, view.status.as_str());
            println!(
                "  {}/{} resolved ({} completed, {} failed, {} skipped)",
                view.completed + view.failed + view.skipped,
                view.total,
                view.completed,
                view.failed,
                view.skipped
            );
            for (name, mean) in &view.aggregated_metrics {
                println!("  {:<22} mean={:.3}", name, mean);
            }
            if let Some(e) = &view.last_error {
                println!("  last error: {}", e);
            }
        }
    }
    Ok(exit_codes::OK)
}
