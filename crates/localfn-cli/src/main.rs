use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use localfn_core::{
    ConfigLoader, EngineConfig, LifecycleState, LocalComputeEngine, StaticFunctionProvider,
};
use log::LevelFilter;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "localfn",
    author,
    version = "0.1.0",
    about = "Run serverless functions in local container sandboxes"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = "localfn.yaml",
        help = "Engine configuration file; defaults are used when it does not exist"
    )]
    config: String,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Invoke a configured function once and print its response
    Invoke {
        /// Function name
        function: String,

        #[clap(long, help = "Function version (defaults to $LATEST)")]
        version: Option<String>,

        #[clap(long, short, help = "JSON payload", conflicts_with = "payload_file")]
        payload: Option<String>,

        #[clap(long, help = "Read the JSON payload from a file")]
        payload_file: Option<PathBuf>,

        #[clap(long, help = "Override the function timeout, in seconds")]
        timeout: Option<u64>,

        #[clap(long, help = "Print request id, duration and cold start with the payload")]
        verbose: bool,
    },
    /// Keep the engine running, with reload watching, until interrupted
    Serve,
    /// Check whether the container runtime is reachable
    Probe,
    /// Remove containers left behind by an earlier engine process
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    match cli.command {
        Commands::Invoke {
            function,
            version,
            payload,
            payload_file,
            timeout,
            verbose,
        } => {
            let payload = read_payload(payload, payload_file).await?;
            let deadline = timeout.map(Duration::from_secs);
            invoke(config, &function, version.as_deref(), payload, deadline, verbose).await
        }
        Commands::Serve => serve(config).await,
        Commands::Probe => probe(config).await,
        Commands::Reap => reap(config).await,
    }
}

fn build_engine(config: EngineConfig) -> Result<LocalComputeEngine> {
    let provider = StaticFunctionProvider::new(config.functions.clone());
    let engine = LocalComputeEngine::with_docker(config, Arc::new(provider))?;
    Ok(engine)
}

async fn read_payload(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read payload file {}", path.display()))?,
        (None, None) => return Ok(json!({})),
    };
    serde_json::from_str(&raw).context("Payload is not valid JSON")
}

async fn invoke(
    mut config: EngineConfig,
    function: &str,
    version: Option<&str>,
    payload: Value,
    deadline: Option<Duration>,
    verbose: bool,
) -> Result<()> {
    // One-shot invocations never need the watcher.
    config.watch.enabled = false;
    let engine = build_engine(config)?;

    ensure_ready(&engine.start().await)?;

    let outcome = engine.invoke(function, version, payload, deadline).await;
    engine.stop().await;

    match outcome {
        Ok(result) => {
            if !result.logs.is_empty() {
                eprint!("{}", result.logs);
            }
            let output = if verbose {
                json!({
                    "requestId": result.request_id,
                    "durationMs": result.duration.as_millis() as u64,
                    "coldStart": result.cold_start,
                    "payload": result.payload,
                })
            } else {
                result.payload
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e).context(format!("Invocation of '{}' failed", function))),
    }
}

async fn serve(config: EngineConfig) -> Result<()> {
    let engine = build_engine(config)?;
    match engine.start().await {
        LifecycleState::Ready => log::info!("localfn engine ready"),
        LifecycleState::Degraded { reason } => {
            log::warn!("localfn engine degraded: {}", reason)
        }
        LifecycleState::Stopped => {}
    }

    let functions: Vec<_> = engine
        .config()
        .functions
        .iter()
        .map(|f| format!("{}:{}", f.name, f.version))
        .collect();
    log::info!("Serving {} function(s): {}", functions.len(), functions.join(", "));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Shutting down");
    engine.stop().await;
    Ok(())
}

async fn probe(config: EngineConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let state = engine.start().await;
    println!("{}", serde_json::to_string_pretty(&state)?);
    engine.stop().await;
    ensure_ready(&state)
}

/// A degraded engine is a command failure, reported through `main`'s error
/// so the process exits non-zero after normal cleanup.
fn ensure_ready(state: &LifecycleState) -> Result<()> {
    match state {
        LifecycleState::Degraded { reason } => {
            anyhow::bail!("Container runtime unavailable: {}", reason)
        }
        LifecycleState::Ready | LifecycleState::Stopped => Ok(()),
    }
}

async fn reap(mut config: EngineConfig) -> Result<()> {
    config.watch.enabled = false;
    let engine = build_engine(config)?;
    if !engine.pool().availability_probe().await {
        let reason = engine
            .pool()
            .unavailable_reason()
            .unwrap_or_else(|| "unknown".to_string());
        anyhow::bail!("Container runtime unavailable: {}", reason);
    }
    let removed = engine.pool().reap_stale().await?;
    println!("Removed {} stale sandbox container(s)", removed);
    Ok(())
}
