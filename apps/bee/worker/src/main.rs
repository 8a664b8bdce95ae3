//! Bee Worker - Entry Point
//!
//! `bee-worker work` runs the broker until Ctrl-C.
//! `bee-worker send <name> <payload> [--delay-ms N]` publishes one message.

use bee_worker::AppConfig;
use clap::{Parser, Subcommand};
use core_config::FromEnv;
use eyre::{Result, WrapErr};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bee-worker")]
#[command(about = "Run broker workers or publish messages over Redis Streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loops until interrupted
    Work,

    /// Publish a single message
    Send {
        /// Handler name (print, sleep, counter, error, delay)
        name: String,

        /// Payload; sent as JSON if it parses, otherwise as a JSON string
        payload: String,

        /// Deliver no earlier than this many milliseconds from now
        #[arg(short, long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    bee_worker::init();

    let config = AppConfig::from_env().wrap_err("Failed to load configuration")?;

    match cli.command {
        Commands::Work => bee_worker::work(config).await,
        Commands::Send {
            name,
            payload,
            delay_ms,
        } => bee_worker::send(config, &name, &payload, Duration::from_millis(delay_ms)).await,
    }
}
