pub mod aggregate;
pub mod capture;
pub mod commands;
pub mod config;
pub mod encoder;
pub mod error;
pub mod health;
pub mod records;
pub mod report;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod utils;
pub mod vitals;

use anyhow::{Context, Result};
use clap::Parser;

use commands::Cli;
use config::AppConfig;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    log::info!("pulsecam starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(commands::execute(cli, config))
}
