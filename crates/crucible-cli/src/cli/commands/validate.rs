use crucible_core::config::{load_config, validate};
use crucible_core::evaluation::MetricPlan;
use crucible_core::providers::target::TargetInvoker;
use serde_json::json;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::exit_codes;

use super::invokers;

#[derive(Debug, Default)]
struct ValidateReport {
    errors: Vec<String>,
    warnings: Vec<String>,
}

pub(crate) fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    let mut report = ValidateReport::default();

    match load_config(&args.config) {
        Err(e) => report.errors.push(e.to_string()),
        Ok(cfg) => {
            if let Err(e) = validate(&cfg) {
                report.errors.push(e.to_string());
            }
            if let Some(target) = &cfg.target {
                let registry = invokers();
                if !registry.supports(&target.kind) {
                    report.errors.push(format!(
                        "target kind '{}' is not supported (known: {})",
                        target.kind,
                        registry.kinds().join(", ")
                    ));
                }
            }
            // rejected metrics do not block a run; they are skipped and reported
            let plan = MetricPlan::build(&cfg, &crucible_metrics::default_backends());
            for (name, reason) in plan.rejection_reasons() {
                report.warnings.push(format!("metric '{}' will be skipped: {}", name, reason));
            }
        }
    }

    let exit_code = if report.errors.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::CONFIG_ERROR
    };
    print_report(&report, &args, exit_code)?;
    Ok(exit_code)
}

fn print_report(report: &ValidateReport, args: &ValidateArgs, exit_code: i32) -> anyhow::Result<()> {
    match args.format {
        OutputFormat::Json => {
            let out = json!({
                "config": args.config.display().to_string(),
                "valid": report.errors.is_empty(),
                "errors": report.errors,
                "warnings": report.warnings,
                "exit_code": exit_code,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            for e in &report.errors {
                eprintln!("error: {}", e);
            }
            for w in &report.warnings {
                eprintln!("warning: {}", w);
            }
            if report.errors.is_empty() {
                println!("{}: ok", args.config.display());
            }
        }
    }
    Ok(())
}
