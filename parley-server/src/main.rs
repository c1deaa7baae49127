//! Parley gateway server.
//!
//! Terminates client WebSocket connections at `/ws`, serves the HTTP API and
//! fans events out to other instances through the broker hub.
//!
//! # Usage
//!
//! ```bash
//! # Single instance on 0.0.0.0:9000 with an in-process bus
//! cargo run --bin parley-server -- --issuer-public-key <base64>
//!
//! # One of several instances behind a hub
//! cargo run --bin parley-server -- --bind 0.0.0.0:9001 \
//!     --broker-url ws://127.0.0.1:9100/bus --instance-id gw-1
//! ```

use std::sync::Arc;

use clap::Parser;
use parley_server::config::{ServerCliArgs, ServerConfig};
use parley_server::fanout::{Broker, LocalBus, RemoteBroker};
use parley_server::gateway::{self, Gateway, GatewaySettings};
use parley_server::logging::init_logging;
use parley_server::store::InMemoryMessageStore;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(
        &config.log_level,
        config.log_dir.as_deref(),
        "parley-server.log",
    );

    let verifier = match config.identity_verifier() {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "invalid identity configuration");
            std::process::exit(1);
        }
    };

    let (broker, deliveries) = match &config.broker_url {
        Some(url) => {
            tracing::info!(
                url = %url,
                instance = %config.instance_id,
                "connecting to broker hub"
            );
            let (broker, rx) = RemoteBroker::spawn(
                url.clone(),
                &config.instance_id,
                config.broker_reconnect_delay,
            );
            (Arc::new(broker) as Arc<dyn Broker>, rx)
        }
        None => {
            tracing::info!(
                instance = %config.instance_id,
                "no broker configured, using in-process bus"
            );
            let (broker, rx) = LocalBus::new().attach(&config.instance_id);
            (Arc::new(broker) as Arc<dyn Broker>, rx)
        }
    };

    let gateway = Arc::new(Gateway::new(
        Arc::new(InMemoryMessageStore::new()),
        broker,
        verifier,
        GatewaySettings::from(&config),
    ));

    tracing::info!(addr = %config.bind_addr, "starting parley gateway");

    match gateway::start_server_with_state(&config.bind_addr, gateway, deliveries).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
