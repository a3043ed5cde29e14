pub mod config;
pub mod ingest;
pub mod mqtt;
pub mod serial;
pub mod worker;

#[cfg(test)]
mod test_support;

use crate::config::BridgeConfig;
use crate::mqtt::config::RetryPolicy;
use crate::serial::port_transport::PortTransport;
use crate::worker::SensorWorker;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Bridges a serial temperature/humidity sensor to an MQTT broker
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    /// Broker URL (tcp://host:port), overrides the config file
    #[arg(short, long)]
    broker: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(broker) = &self.broker {
            config.mqtt.broker_url = broker.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.log_level.as_deref())?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut config = BridgeConfig::load_or_create(&config_path).await?;
    args.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| eyre!("Invalid configuration in {}: {}", config_path.display(), e))?;

    info!(
        "Bridging {} to {}",
        config.serial.port, config.mqtt.broker_url
    );

    let transport = Box::new(PortTransport::new(config.serial.clone()));
    let mqtt_config = config.mqtt.clone();
    let worker = tokio::task::spawn_blocking(move || {
        SensorWorker::connect(transport, &mqtt_config, RetryPolicy::default())
    })
    .await??;

    let mut worker = tokio::task::spawn_blocking(move || {
        let mut worker = worker;
        worker.start();
        worker
    })
    .await?;

    println!("Type 'exit' and press Enter to quit:");
    wait_for_shutdown().await;

    info!("Shutting down the worker...");
    tokio::task::spawn_blocking(move || worker.stop()).await?;

    Ok(())
}

async fn wait_for_shutdown() {
    let exit_command = spawn_exit_listener();
    tokio::select! {
        _ = wait_for_ctrl_c() => info!("Ctrl-C received"),
        Ok(()) = exit_command => info!("Exit command received"),
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await
    }
}

/// Reads stdin on its own thread; the receiver fires when `exit` is typed.
///
/// A blocking stdin read cannot be cancelled, so it stays out of the runtime.
/// If stdin closes the sender is dropped and only Ctrl-C remains.
fn spawn_exit_listener() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("exit") => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    rx
}

fn setup(log_level: Option<&str>) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(log_level);
    Ok(())
}

fn setup_logging_env(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
