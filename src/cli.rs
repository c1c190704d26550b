// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `plandag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "plandag",
    version,
    about = "Run a Phase/Milestone/Task/Subtask plan in dependency order with crash-safe progress.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the run config (TOML).
    ///
    /// Default: `Plandag.toml` in the current working directory, if present.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the hierarchy document (JSON).
    #[arg(long, value_name = "PATH", default_value = "tasks.json")]
    pub tasks: PathBuf,

    /// Session directory; overrides `[session].dir`.
    #[arg(long, value_name = "DIR")]
    pub session: Option<PathBuf>,

    /// Resume the stored session instead of starting a fresh one.
    #[arg(long)]
    pub resume: bool,

    /// Treat every error as recoverable.
    #[arg(long)]
    pub continue_on_error: bool,

    /// On resume, retry items left `Failed` or `Blocked`.
    #[arg(long)]
    pub retry_failed: bool,

    /// Maximum number of items executing at once; overrides the config.
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PLANDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Validate the plan and print its execution levels without running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the dependency graph in Graphviz DOT format and exit.
    #[arg(long)]
    pub dot: bool,

    /// Also write the end-of-run report as JSON.
    #[arg(long, value_name = "PATH")]
    pub report_json: Option<PathBuf>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides() {
        let args = CliArgs::try_parse_from([
            "plandag",
            "--tasks",
            "plan.json",
            "--resume",
            "--max-concurrency",
            "8",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.tasks, PathBuf::from("plan.json"));
        assert!(args.resume);
        assert_eq!(args.max_concurrency, Some(8));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(args.config.is_none());
    }
}
