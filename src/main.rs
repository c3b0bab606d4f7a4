//! statechart - Statechart evaluation harness
//!
//! Validates, inspects and runs machine definitions against a stream of events.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::RunOptions;
use config::{Config, OutputFormat};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statechart")]
#[command(about = "Evaluate statechart definitions")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, global = true, env = "STATECHART_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definition and report unreachable rules
    Validate {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,

        /// Fail when the definition has lints
        #[arg(long)]
        strict: bool,
    },

    /// Print states, events and rules of a definition
    Inspect {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,
    },

    /// Start an instance and feed it events, one JSON value per line
    ///
    /// Only the builtin actions (assign, assignEvent) are available, and
    /// guards must be {"expr": ...} expressions. Definitions that name host
    /// guards or actions are rejected; `validate` lists them.
    Run {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,

        /// Events file (defaults to stdin, `-` also reads stdin)
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Initial context JSON, replacing the definition's context
        #[arg(long)]
        context: Option<String>,

        /// Output format
        #[arg(short, long, value_enum)]
        output: Option<OutputFormat>,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }
    if !config.output.color {
        colored::control::set_override(false);
    }

    if let Err(e) = execute(cli.command, &config) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

fn execute(command: Commands, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Validate { definition, strict } => {
            let output = commands::validate(&definition, strict || config.validation.strict)?;
            println!("{}", output);
        }

        Commands::Inspect { definition } => {
            println!("{}", commands::inspect(&definition)?);
        }

        Commands::Run {
            definition,
            events,
            context,
            output,
        } => {
            let context = context
                .map(|c| serde_json::from_str::<Value>(&c))
                .transpose()
                .map_err(|e| format!("invalid --context: {}", e))?;
            let options = RunOptions {
                context,
                format: output.unwrap_or(config.output.format),
                stop_on_error: config.runner.stop_on_error,
            };

            let input = open_events(events.as_deref())?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let summary = commands::run(&definition, input, &options, &mut out)?;

            tracing::info!(
                processed = summary.processed,
                transitions = summary.transitions,
                failed = summary.failed,
                "run finished"
            );
            if summary.failed > 0 {
                return Err(format!("{} event(s) failed", summary.failed).into());
            }
        }
    }
    Ok(())
}

fn open_events(path: Option<&Path>) -> Result<Box<dyn BufRead>, Box<dyn std::error::Error>> {
    match path {
        Some(path) if path != Path::new("-") => {
            let file = std::fs::File::open(path)
                .map_err(|e| format!("failed to open '{}': {}", path.display(), e))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(std::io::stdin()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_help_names_builtins() {
        let mut cmd = Cli::command();
        let run = cmd.find_subcommand_mut("run").unwrap();
        let help = run.render_long_help().to_string();
        assert!(help.contains("assignEvent"));
        assert!(help.contains(r#"{"expr": ...}"#));
    }

    #[test]
    fn test_license_file_matches_manifest() {
        let manifest = include_str!("../Cargo.toml");
        let license = include_str!("../LICENSE");
        assert!(manifest.contains(r#"license = "MIT""#));
        assert!(license.starts_with("MIT License"));
    }
}
