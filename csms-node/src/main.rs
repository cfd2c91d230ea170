//! CSMS Node - charging station management entry point
//!
//! Runs the WebSocket edge for charging stations, the message router and the
//! Configuration module on one in-process bus.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws://0.0.0.0:8080/ocpp/<stationId>)
//! csms-node --tenant t1
//!
//! # Keep booting stations pending, heartbeat every 5 minutes
//! csms-node --tenant t1 --boot-status pending --heartbeat-interval 300
//!
//! # Environment overrides use the CSMS_ prefix
//! CSMS_MAXCACHINGSECONDS=30 CSMS_BREAKER_FAILURETHRESHOLD=10 csms-node
//! ```

mod configuration;
mod edge;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use csms_core::logging::init_logging;
use csms_core::{Cache, ConfigHandle, LocalBus, MemoryCache, SystemConfig};
use csms_dispatch::MessageRouter;
use csms_validator::OcppValidator;

use configuration::{BootSettings, BootStatus};
use edge::{Connections, Edge};

/// OCPP charging station management node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tenant the connected stations belong to
    #[arg(short, long, default_value = "default")]
    tenant: String,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// WebSocket port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Log level or filter directive (overrides CSMS_LOGLEVEL)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Correlation record TTL in seconds
    #[arg(long)]
    max_caching_seconds: Option<u64>,

    /// In-flight call TTL in seconds
    #[arg(long)]
    max_call_length_seconds: Option<u64>,

    /// Status returned to BootNotification
    #[arg(long, value_enum, default_value = "accepted")]
    boot_status: BootStatus,

    /// Heartbeat interval handed to booting stations, seconds
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (mut config, env_errors) = SystemConfig::from_env("CSMS", std::env::vars())?;
    if let Some(level) = &args.log_level {
        config = config.with_log_level(level.clone());
    }
    if args.max_caching_seconds.is_some() || args.max_call_length_seconds.is_some() {
        let caching = args.max_caching_seconds.unwrap_or(config.max_caching_seconds);
        let call = args.max_call_length_seconds.unwrap_or(config.max_call_length_seconds);
        config = config.with_caching(caching, call);
    }
    config.validate()?;

    let log = init_logging(&config.log_level)?;
    for e in &env_errors {
        warn!("Ignoring environment override: {}", e);
    }

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         CSMS Node - Charging Station Management System       ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Tenant:   {:<50} ║", truncate(&args.tenant, 50));
    println!("║  Listen:   {:<50} ║", format!("{}:{}", args.host, args.port));
    println!("║  Boot:     {:<50} ║", args.boot_status.as_str());
    println!("║  Caching:  {:<50} ║", format!("{}s (calls {}s)", config.max_caching_seconds, config.max_call_length_seconds));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = ConfigHandle::new(config, Some(log))?;
    let memory = MemoryCache::shared();
    let cache: Arc<dyn Cache> = memory.clone();
    let bus = LocalBus::new();
    let validator = Arc::new(OcppValidator::bundled()?);
    let connections = Arc::new(Connections::new());

    let router = MessageRouter::new(
        config.clone(),
        cache.clone(),
        validator.clone(),
        Arc::new(bus.sender()),
        Arc::new(bus.handler()),
        connections.clone(),
    )
    .await?;

    let settings = BootSettings {
        status: args.boot_status,
        interval: args.heartbeat_interval,
    };
    let module = configuration::start(
        settings,
        config.clone(),
        cache,
        validator,
        Arc::new(bus.sender()),
        Arc::new(bus.handler()),
    )
    .await?;

    let purger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            memory.purge_expired();
        }
    });

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let edge = Arc::new(Edge::new(args.tenant, router.clone(), connections));

    info!("Starting CSMS node...");
    tokio::select! {
        result = edge.serve(listener) => {
            if let Err(e) = result {
                error!("Edge stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    purger.abort();
    module.shutdown().await;
    router.shutdown().await;
    bus.close();

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
