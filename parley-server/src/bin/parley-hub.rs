//! Parley broker hub.
//!
//! Gateway instances connect at `/bus` and exchange per-user topic traffic
//! through it.
//!
//! ```bash
//! cargo run --bin parley-hub -- --bind 0.0.0.0:9100
//! ```

use clap::Parser;
use parley_server::config::{HubCliArgs, HubConfig};
use parley_server::hub;
use parley_server::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();

    let config = match HubConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_dir.as_deref(), "parley-hub.log");

    tracing::info!(addr = %config.bind_addr, "starting parley hub");

    match hub::start_hub(&config.bind_addr).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "hub listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "hub server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start hub");
            std::process::exit(1);
        }
    }
}
