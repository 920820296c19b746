//! fanout-gateway: WebSocket fanout, pub/sub bridge and edit log producer.
//!
//! Usage: `fanout-gateway [config.toml]` (or `FANOUT_CONFIG=config.toml`).

use doc_fanout::config::GatewayConfig;
use doc_fanout::gateway::FanoutGateway;
use doc_fanout::lifecycle::{termination_signal, Shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FANOUT_CONFIG").ok())
        .map(PathBuf::from);

    let config = match GatewayConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        termination_signal().await;
        info!("Termination signal received");
        signal.trigger();
    });

    let gateway = FanoutGateway::new(config);
    match gateway.run(shutdown.subscribe()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed");
            ExitCode::FAILURE
        }
    }
}
