use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use renogy_ble::{BluestTransportFactory, Gateway, GatewayConfig, JsonLinesBridge, LogBridge, PublishingBridge};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the configured devices until interrupted
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Log results instead of printing them as JSON lines on stdout
        #[arg(long)]
        log_results: bool,
    },
    /// List nearby BLE devices
    Scan {
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run { config, log_results } => run(config, log_results).await,
        Command::Scan { seconds } => scan(Duration::from_secs(seconds)).await,
    }
}

async fn run(path: PathBuf, log_results: bool) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    let factory = BluestTransportFactory::new(config.scan_timeout())
        .await
        .context("opening the Bluetooth adapter")?;
    let bridge: Arc<dyn PublishingBridge> = if log_results { Arc::new(LogBridge) } else { Arc::new(JsonLinesBridge) };

    let gateway = Gateway::start(&config, Arc::new(factory), bridge).await?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Interrupted, shutting down");
    gateway.shutdown().await;
    Ok(())
}

async fn scan(duration: Duration) -> anyhow::Result<()> {
    let factory = BluestTransportFactory::new(duration)
        .await
        .context("opening the Bluetooth adapter")?;
    info!("Scanning for {duration:?}");
    for device in factory.scan(duration).await? {
        let name = device.name.as_deref().unwrap_or("-");
        let rssi = device.rssi.map(|rssi| format!("{rssi} dBm")).unwrap_or_default();
        println!("{:<48} {name:<24} {rssi}", device.id);
    }
    Ok(())
}
