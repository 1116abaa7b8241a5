// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use schemars::schema_for;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use nodeflow_engine::Engine;

use crate::config;
use crate::runner;

pub type LogInitFn =
    fn(
        &config::LogConfig,
    )
        -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "nodeflow.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a graph until Ctrl-C or the given duration
    Run {
        /// Path to a YAML graph file
        graph: PathBuf,
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Checks a graph file and prints a summary as JSON
    Validate {
        /// Path to a YAML graph file
        graph: PathBuf,
    },
    /// Lists the registered node kinds as JSON
    Nodes,
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Generate a default config file and print it to stdout
    Default,
    /// Generate a JSON schema for the config and print it to stdout
    Schema,
}

/// Initialize telemetry (metrics) if enabled in configuration
/// Returns the meter provider that must be kept alive
fn init_telemetry_if_enabled(
    config: &config::Config,
) -> Option<opentelemetry_sdk::metrics::SdkMeterProvider> {
    if !config.telemetry.enable {
        return None;
    }

    match crate::telemetry::init_metrics(&config.telemetry) {
        Ok(provider) => {
            info!("OpenTelemetry metrics enabled");
            Some(provider)
        },
        Err(e) => {
            warn!(error = %e, "Failed to initialize OpenTelemetry metrics");
            None
        },
    }
}

// Allow eprintln before logging is initialized (CLI output)
#[allow(clippy::disallowed_macros)]
fn load_config_or_exit(config_path: &str) -> config::ConfigLoadResult {
    match config::load(config_path) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        },
    }
}

#[allow(clippy::disallowed_macros)]
fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            std::process::exit(1);
        },
    }
}

/// Handle the "run" command
/// Exits the process on error with status code 1
#[allow(clippy::disallowed_macros)]
async fn handle_run_command(
    config_path: &str,
    graph: &Path,
    duration_secs: Option<u64>,
    init_logging: LogInitFn,
) {
    let config_result = load_config_or_exit(config_path);

    let _log_guard = match init_logging(&config_result.config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        },
    };

    let meter_provider = init_telemetry_if_enabled(&config_result.config);

    if let Some(missing_file) = &config_result.file_missing {
        warn!(config_path = %missing_file, "Config file not found, using defaults");
    }

    info!(
        graph = %graph.display(),
        console_level = ?config_result.config.log.console_level,
        file_enable = config_result.config.log.file_enable,
        telemetry = config_result.config.telemetry.enable,
        "Starting nodeflow"
    );

    let engine = Engine::new();
    let duration = duration_secs.map(Duration::from_secs);
    let outcome = runner::run(&engine, &config_result.config.engine, graph, duration).await;

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "Failed to flush metrics on shutdown");
        }
    }

    match outcome {
        Ok(snapshot) => print_json(&snapshot),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Graph run failed");
            std::process::exit(1);
        },
    }
}

/// Handle the "validate" command - print a graph summary to stdout
#[allow(clippy::disallowed_macros)]
fn handle_validate_command(graph: &Path) {
    match runner::validate(&Engine::new(), graph) {
        Ok(summary) => print_json(&summary),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        },
    }
}

/// Handle the "config default" command - print default config to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_default_command() {
    match config::generate_default() {
        Ok(toml_string) => {
            println!("# Default nodeflow configuration file");
            println!("{toml_string}");
        },
        Err(e) => {
            eprintln!("Failed to generate default config: {e}");
            std::process::exit(1);
        },
    }
}

/// Handle the "config schema" command - print JSON schema to stdout
fn handle_config_schema_command() {
    let schema = schema_for!(config::Config);
    print_json(&schema);
}

/// Handle CLI commands
pub async fn handle_command(cli: &Cli, init_logging: LogInitFn) {
    match &cli.command {
        Commands::Run { graph, duration_secs } => {
            handle_run_command(&cli.config, graph, *duration_secs, init_logging).await;
        },
        Commands::Validate { graph } => {
            handle_validate_command(graph);
        },
        Commands::Nodes => {
            print_json(&Engine::new().node_definitions());
        },
        Commands::Config(ConfigCommands::Default) => {
            handle_config_default_command();
        },
        Commands::Config(ConfigCommands::Schema) => {
            handle_config_schema_command();
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_run_with_duration() {
        let cli = Cli::try_parse_from(["nodeflow", "run", "graph.yml", "--duration-secs", "3"])
            .unwrap();
        assert_eq!(cli.config, "nodeflow.toml");
        let Commands::Run { graph, duration_secs } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(graph, PathBuf::from("graph.yml"));
        assert_eq!(duration_secs, Some(3));
    }

    #[test]
    fn test_parses_config_subcommand() {
        let cli = Cli::try_parse_from(["nodeflow", "-c", "other.toml", "config", "schema"])
            .unwrap();
        assert_eq!(cli.config, "other.toml");
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Schema)));
    }

    #[test]
    fn test_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["nodeflow"]).is_err());
    }
}
