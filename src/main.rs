//! Reverse-tunnel broker (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                     BROKER                       │
//!   Caller request       │  ┌─────────┐   ┌────────────┐   ┌────────────┐   │
//!   ─────────────────────┼─▶│ gateway │──▶│ dispatcher │──▶│  registry  │   │
//!                        │  └─────────┘   └─────┬──────┘   │ round robin│   │
//!                        │       ▲              │          └─────┬──────┘   │
//!                        │       │              ▼                ▼          │
//!   Caller response      │  ┌─────────┐   ┌─────────────┐  ┌──────────┐     │     ┌───────┐
//!   ◀────────────────────┼──│response │◀──│ correlation │◀─│ session  │◀────┼────▶│ agent │──▶ local
//!                        │  └─────────┘   │    table    │  │ (ws r/w) │     │  ws └───────┘   service
//!                        │                └─────────────┘  └──────────┘     │
//!                        │                                                  │
//!   relay client ws ─────┼──▶ relay table (client_id, session_id) ◀─────────┼──── relay host ws
//!                        └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use tunnel_broker::config::{load_config, validate_config, BrokerConfig, ConfigError};
use tunnel_broker::http::HttpServer;
use tunnel_broker::lifecycle::Shutdown;
use tunnel_broker::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "tunnel-broker")]
#[command(about = "Public broker relaying HTTP requests to tunnel agents", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override dispatch.response_timeout_ms.
    #[arg(long)]
    response_timeout_ms: Option<u64>,
}

fn load(cli: &Cli) -> Result<BrokerConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
    }
    if let Some(timeout) = cli.response_timeout_ms {
        config.dispatch.response_timeout_ms = timeout;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("tunnel-broker v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        agent_path = %config.listener.agent_path,
        response_timeout_ms = config.dispatch.response_timeout_ms,
        agent_queue_capacity = config.dispatch.agent_queue_capacity,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);

    if server.config().admin.enabled {
        let admin_listener = TcpListener::bind(&server.config().admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin listening");
        let admin = server.admin_router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
