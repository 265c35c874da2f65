use crate::cli::args::{OutputFormat, StatusArgs};
use crate::exit_codes;

use super::{engine_exit, open_service, tenant};

pub(crate) fn run(args: StatusArgs) -> anyhow::Result<i32> {
    let svc = open_service(&args.scope)?;
    let scope = tenant(&args.scope);
    match args.format {
        OutputFormat::Text => match svc.summary(&args.run_id, &scope) {
            Ok(summary) => print!("{}", summary.render_console()),
            Err(e) => return engine_exit(e),
        },
        // full records, attempt history and transcripts included
        OutputFormat::Json => match svc.results(&args.run_id, &scope) {
            Ok(results) => println!("{}", serde_json::to_string_pretty(&results)?),
            Err(e) => return engine_exit(e),
        },
    }
    Ok(exit_codes::OK)
}
