//! Process entry point: loads configuration, wires an in-memory
//! persistence store, starts the fan-out websocket listener, and runs
//! the tick loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use modbus_poller::config::PollerConfig;
use modbus_poller::fanout::{self, SubscriberRegistry};
use modbus_poller::persistence::InMemoryStore;
use modbus_poller::scheduler::PollerEngine;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "poller", about = "MODBUS telemetry polling engine")]
struct Args {
    /// Path to a YAML engine configuration file.
    #[arg(long, env = "POLLER_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the fan-out websocket bind address.
    #[arg(long, env = "POLLER_BIND")]
    bind: Option<std::net::SocketAddr>,

    /// Tracing filter directive, e.g. "info" or "modbus_poller=debug".
    #[arg(long, env = "POLLER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => PollerConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PollerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    info!(version = modbus_poller::VERSION, bind = %config.bind_addr, "starting poller");

    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(SubscriberRegistry::new());
    let (engine, mut notify_rx) = PollerEngine::new(config.clone(), store, registry.clone());

    tokio::spawn(async move {
        while let Some(intent) = notify_rx.recv().await {
            info!(
                alarm_config_id = intent.alarm_config_id,
                tag_id = intent.tag_id,
                recipients = intent.recipients.len(),
                "alarm notification intent"
            );
        }
    });

    let router = fanout::router(registry);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding websocket listener on {}", config.bind_addr))?;

    tokio::select! {
        result = axum::serve(listener, router) => {
            result.context("websocket listener stopped")?;
        }
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}
