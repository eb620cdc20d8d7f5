mod cellular;
mod config;
mod connection;
mod error;
mod executor;
mod gps;
mod https;
mod models;
mod orchestrator;
mod payload;
mod urc;

#[cfg(test)]
mod fake;

use config::Config;
use log::{error, info, warn};
use orchestrator::{run_exclusive, Orchestrator};
use std::process::ExitCode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    info!("Starting GNSS uplink...");

    let config = Config::load();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::from(2);
    }

    let transport = match connection::open(&config.at_config).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    // Abort is only honoured between commands; cleanup still runs
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing current command and powering down...");
            trigger.cancel();
        }
    });

    let orchestrator = Mutex::new(Orchestrator::new(transport, config.uplink));
    match run_exclusive(&orchestrator, &cancel).await {
        Ok(result) => {
            info!("Location delivered (HTTP {})", result.http_status);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("Location not delivered: {}", failure);
            ExitCode::FAILURE
        }
    }
}
