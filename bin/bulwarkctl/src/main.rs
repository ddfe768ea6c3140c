//! ---
//! bw_section: "05-networking-external-interfaces"
//! bw_subsection: "binary"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Control CLI for operators of a running Bulwark daemon."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use bulwark_resilience::ChaosExperimentConfig;
use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod client;

use client::{expect_success, ApiClient};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Bulwark administrative control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        env = "BULWARK_API",
        default_value = "http://127.0.0.1:8088",
        help = "Base URL of the daemon API"
    )]
    api: String,

    #[arg(long, default_value_t = 10, help = "Request timeout in seconds")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show engine health; exits non-zero when unhealthy")]
    Health,
    #[command(about = "List every circuit breaker")]
    Breakers,
    #[command(about = "Show one circuit breaker")]
    Breaker { key: String },
    #[command(about = "Force one circuit breaker closed")]
    ResetBreaker { key: String },
    #[command(about = "Force every circuit breaker closed")]
    ResetBreakers,
    #[command(about = "Show aggregated error statistics")]
    Stats,
    #[command(about = "Clear aggregated error statistics")]
    ResetStats,
    #[command(about = "Start a chaos experiment from a TOML definition")]
    ChaosStart {
        #[arg(long, value_name = "FILE")]
        scenario: PathBuf,
    },
    #[command(about = "Stop a chaos experiment")]
    ChaosStop { id: Uuid },
    #[command(about = "List chaos experiments")]
    ChaosList,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BULWARK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api, Duration::from_secs(cli.timeout_secs))?;
    let runtime = Runtime::new()?;
    runtime.block_on(run(&client, cli.command))
}

async fn run(client: &ApiClient, command: Commands) -> Result<()> {
    match command {
        Commands::Health => {
            let (status, body) = client.get("/health").await?;
            print_json(&body)?;
            if status == StatusCode::SERVICE_UNAVAILABLE {
                std::process::exit(2);
            }
            expect_success((status, body))?;
        }
        Commands::Breakers => print_json(&expect_success(client.get("/api/breakers").await?)?)?,
        Commands::Breaker { key } => {
            let path = format!("/api/breakers/{key}");
            print_json(&expect_success(client.get(&path).await?)?)?
        }
        Commands::ResetBreaker { key } => {
            let path = format!("/api/breakers/{key}/reset");
            expect_success(client.post(&path, None::<&()>).await?)?;
            println!("breaker {key} reset");
        }
        Commands::ResetBreakers => {
            let body = expect_success(client.post("/api/breakers/reset", None::<&()>).await?)?;
            println!("{} breakers reset", body["reset"]);
        }
        Commands::Stats => print_json(&expect_success(client.get("/api/errors/stats").await?)?)?,
        Commands::ResetStats => {
            expect_success(client.post("/api/errors/reset", None::<&()>).await?)?;
            println!("error statistics reset");
        }
        Commands::ChaosStart { scenario } => {
            let experiment = ChaosExperimentConfig::from_file(&scenario)?;
            let body = expect_success(
                client
                    .post("/api/chaos/experiments", Some(&experiment))
                    .await?,
            )?;
            println!("experiment {} started", body["id"].as_str().unwrap_or("?"));
        }
        Commands::ChaosStop { id } => {
            let path = format!("/api/chaos/experiments/{id}");
            print_json(&expect_success(client.delete(&path).await?)?)?
        }
        Commands::ChaosList => {
            print_json(&expect_success(client.get("/api/chaos/experiments").await?)?)?
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
