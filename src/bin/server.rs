//! votefleet-server
//!
//! Runs the fleet scheduler headlessly and serves its dashboard/API over
//! HTTP.
//!
//! Environment variables:
//! - `WEB_PORT` — server port (default: 8080)
//! - `WEB_AUTH_USER` / `WEB_AUTH_PASS` — basic auth (disabled if unset)
//! - see `votefleet::config::FleetConfig` for the full fleet configuration
//!   surface (`TARGET_URL`, `PROXY_USERNAME`, ...).
//! - `INSTANCE_NAMES` — comma-separated `id:name` pairs seeding instances
//!   with no prior session record (e.g. `1:alpha,2:beta`).

use std::collections::HashMap;
use tracing::{error, info};

use votefleet::config::FleetConfig;
use votefleet::fleet::FleetState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = votefleet::init_logging();

    info!("starting votefleet-server");
    if let Some(dir) = votefleet::log_dir() {
        info!("log files saved to: {}", dir.display());
    }

    let config = match FleetConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let names = parse_instance_names(&std::env::var("INSTANCE_NAMES").unwrap_or_default());

    let port: u16 = std::env::var("WEB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    if std::env::var("WEB_AUTH_PASS").map(|p| !p.is_empty()).unwrap_or(false) {
        let user = std::env::var("WEB_AUTH_USER").unwrap_or_else(|_| "admin".to_string());
        info!("basic auth enabled (user: {})", user);
    } else {
        info!("basic auth disabled (set WEB_AUTH_PASS to enable)");
    }

    let fleet = FleetState::bootstrap(config, &names).await;
    fleet.spawn();

    info!("fleet bootstrapped with {} instances", fleet.instances.len());
    info!("dashboard: http://0.0.0.0:{}", port);

    votefleet::web::start_server(fleet, port).await?;

    Ok(())
}

fn parse_instance_names(raw: &str) -> HashMap<u32, String> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, ':');
            let id: u32 = parts.next()?.trim().parse().ok()?;
            let name = parts.next()?.trim().to_string();
            Some((id, name))
        })
        .collect()
}
