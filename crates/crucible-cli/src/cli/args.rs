use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "crucible",
    version,
    about = "Run evaluation suites against LLM-backed targets and score every answer"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a configuration and wait for its verdict
    Run(RunArgs),
    /// Show the state of a run
    Status(StatusArgs),
    /// Print per-test-case results of a run
    Results(StatusArgs),
    /// Check a configuration without running it
    Validate(ValidateArgs),
    /// Finalize a run whose process is gone
    Stop(StopArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Where runs are stored and on whose behalf the command acts.
#[derive(Args, Clone, Debug)]
pub struct ScopeArgs {
    #[arg(long, env = "CRUCIBLE_DB", default_value = ".crucible/crucible.db")]
    pub db: PathBuf,

    /// Organization that owns the runs
    #[arg(long, env = "CRUCIBLE_ORG", default_value = "local")]
    pub org: String,

    #[arg(long, env = "CRUCIBLE_USER", default_value = "cli")]
    pub user: String,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[arg(long, default_value = "eval.yaml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Units executing at once (overrides settings.queue_workers)
    #[arg(long)]
    pub queue_workers: Option<usize>,

    /// Attempts per unit, first one included (overrides settings.retry.max_attempts)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Correlation id stamped on every unit; generated when absent
    #[arg(long)]
    pub correlation_id: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Disable the progress line on stderr
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Clone, Debug)]
pub struct StatusArgs {
    pub run_id: String,

    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    #[arg(long, default_value = "eval.yaml")]
    pub config: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Clone, Debug)]
pub struct StopArgs {
    pub run_id: String,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["crucible", "run", "--org", "acme"]).unwrap();
        let Command::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from("eval.yaml"));
        assert_eq!(args.scope.org, "acme");
        assert_eq!(args.format, OutputFormat::Text);
        assert!(args.max_attempts.is_none());
    }
}
