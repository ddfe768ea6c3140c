//! ---
//! bw_section: "01-core-functionality"
//! bw_subsection: "binary"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Binary entrypoint for the Bulwark daemon."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bulwark_api::{spawn_api_server, ApiServer, ApiState};
use bulwark_common::config::AppConfig;
use bulwark_common::logging::init_tracing;
use bulwark_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use bulwark_resilience::{ChaosExperimentConfig, ResilienceEngine, ResilienceMetrics};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("Bulwark ", env!("CARGO_PKG_VERSION")),
    about = "Bulwark resilience daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the engine with its API and metrics endpoints")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Run one chaos experiment to completion and print its summary")]
    Chaos {
        #[arg(long, value_name = "FILE", help = "Experiment definition (TOML)")]
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/bulwark.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();

    let daemon_metrics = DaemonMetrics::new(new_registry())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(VERSION);

    init_tracing("bulwarkd", &config.logging)?;
    info!(source = %loaded.source.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, daemon_metrics).await?,
        Commands::CheckConfig => {
            config.validate()?;
            println!("# {} is valid", loaded.source.display());
            print!("{}", config.to_toml()?);
        }
        Commands::Chaos { scenario } => run_scenario(config, scenario).await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, daemon_metrics: DaemonMetrics) -> Result<()> {
    let metrics_registry = daemon_metrics.registry();
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();

    for (setting, value) in [
        ("breaker_overrides", config.breakers.overrides.len() as i64),
        ("retry_policies", config.retry.policies.len() as i64),
        ("history_capacity", config.aggregator.history_capacity as i64),
        ("chaos_enabled", i64::from(config.chaos.enabled)),
    ] {
        daemon_metrics.set_engine_setting(setting, value);
    }

    let resilience_metrics = ResilienceMetrics::new(metrics_registry.clone())?;
    let engine = Arc::new(
        ResilienceEngine::builder(config)
            .metrics(resilience_metrics)
            .build()?,
    );

    let metrics_server = if metrics_settings.enabled {
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry, metrics_settings.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut api_server: Option<ApiServer> = None;
    if api_settings.enabled {
        let state = Arc::new(ApiState::new(engine.clone(), VERSION));
        match spawn_api_server(state, api_settings.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    engine.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    Ok(())
}

async fn run_scenario(mut config: AppConfig, scenario: PathBuf) -> Result<()> {
    let experiment = ChaosExperimentConfig::from_file(&scenario)?;
    if !config.chaos.enabled {
        warn!("chaos disabled in configuration; enabling for this local run");
        config.chaos.enabled = true;
    }
    let engine = ResilienceEngine::from_config(&config)?;
    let id = engine.start_experiment(experiment).await?;
    let summary = tokio::select! {
        summary = engine.chaos().wait_for(id) => summary,
        _ = signal::ctrl_c() => engine.stop_experiment(id).await,
    }
    .with_context(|| format!("experiment {id} vanished before completing"))?;

    let report = serde_json::json!({
        "summary": summary,
        "health": engine.health(),
        "breakers": engine.breaker_snapshots(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown().await;
    Ok(())
}
