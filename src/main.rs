use std::path::Path;

use tracing::{error, info};

use netlinkd::config::{self, Config};
use netlinkd::hooks::HookBus;
use netlinkd::net::transport::spawn_network;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path, falling
/// back to `netlinkd.toml`.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "netlinkd.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load configuration");
        e
    })?;

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "configuration validation failed");
        }
        anyhow::bail!("configuration validation failed with {} error(s)", errors.len());
    }

    info!(networks = config.networks.len(), "starting netlinkd");

    for (name, net_conf) in config.networks {
        // Subscribers (relay and friends) attach through the registry
        // handle once the loop is up.
        spawn_network(&name, net_conf, config.daemon.clone(), HookBus::new());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
