//! Cell Rule Engine Server
//!
//! Main entry point: loads the configuration, starts the rule engine with
//! the configured local devices and runs until Ctrl-C.

mod transport;

use anyhow::{Context, Result};
use cellrules_config::EngineConfig;
use cellrules_engine::{EngineOptions, RuleEngine, RuleRuntime};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::transport::LoggingTransport;

/// Reload unit holding the devices from the configuration file
const CONFIG_SCRIPT: &str = "config";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "cellrules.yaml")]
    config: PathBuf,
}

/// Filter from `RUST_LOG`, then the config's `log_filter`, then `info`
fn env_filter(config: &EngineConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            config
                .log_filter
                .as_deref()
                .and_then(|filter| EnvFilter::try_new(filter).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Define every configured device inside the `config` reload unit
async fn define_configured_devices(engine: &RuleEngine, config: &EngineConfig) -> Result<()> {
    let devices = config.devices.clone();
    engine
        .load_script(CONFIG_SCRIPT, move |rt: &mut RuleRuntime| {
            for (name, def) in &devices {
                rt.define_virtual_device(name, def)?;
            }
            Ok(())
        })
        .await
        .context("Failed to define configured devices")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        EngineConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        EngineConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config))
        .with_target(true)
        .init();

    if !args.config.exists() {
        warn!(path = %args.config.display(), "Configuration file not found, using defaults");
    }
    info!("Starting cell rule engine");

    let engine = RuleEngine::new(
        Arc::new(LoggingTransport),
        EngineOptions {
            cleanup_on_stop: config.cleanup_on_stop,
        },
    );
    define_configured_devices(&engine, &config).await?;
    engine.start();
    engine.mark_ready().await?;

    info!(devices = config.devices.len(), "Cell rule engine is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    engine.stop().await;

    Ok(())
}
