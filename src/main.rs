use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gpuwatch::{
    config::ServerConfig,
    otel_tracing::setup_tracing,
    service::{build_fleet_coordinator, build_host_aggregator, Service},
};
use serde::Serialize;
use tracing::{error, info_span, Instrument};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Serve the HTTP API (default).
    Serve,
    /// Poll the local GPUs once and print the per-GPU view.
    Local,
    /// Poll the local GPUs once and print one JSON row per process. This is
    /// the command the fleet poller runs on every remote host.
    Agent,
    /// Poll every configured host once and print the merged snapshot.
    Fleet,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {:?}", err);
            std::process::exit(2);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            None
        }
    };

    let root_span = info_span!("gpuwatch", env = config.env);
    let result = run(cli.command.unwrap_or(Command::Serve), config)
        .instrument(root_span)
        .await;
    if let Err(err) = &result {
        error!("Error running command: {:?}", err);
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }

    if result.is_err() {
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::from_path(&path.to_string_lossy())
            .with_context(|| format!("error reading config file {}", path.display())),
        None => {
            let mut config = ServerConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

async fn run(command: Command, config: ServerConfig) -> Result<()> {
    match command {
        Command::Serve => Service::new(config)?.start().await,
        Command::Local => {
            let view = build_host_aggregator(&config)?.collect().await;
            print_json(&view)
        }
        Command::Agent => {
            let view = build_host_aggregator(&config)?.collect().await;
            print_json(&view.to_fleet_rows())
        }
        Command::Fleet => {
            let snapshot = build_fleet_coordinator(&config).poll().await;
            print_json(&snapshot)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string(value).context("error serializing output")?;
    println!("{}", json);
    Ok(())
}
