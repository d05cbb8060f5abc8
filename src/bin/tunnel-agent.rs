//! Tunnel agent: dials the broker and serves tunneled requests from a local
//! HTTP service.

use clap::Parser;

use tunnel_broker::agent::{self, AgentConfig};
use tunnel_broker::observability::logging;

#[derive(Parser)]
#[command(name = "tunnel-agent")]
#[command(about = "Expose a local HTTP service through a tunnel broker", long_about = None)]
struct Cli {
    /// Identifier announced to the broker.
    #[arg(long, env = "CLIENT_ID", default_value = "machine1")]
    client_id: String,

    /// Broker base URL.
    #[arg(long, env = "CLOUD_URL", default_value = "ws://127.0.0.1:8080")]
    cloud_url: String,

    /// Local service base URL.
    #[arg(long, env = "LOCAL_API", default_value = "http://127.0.0.1:5005")]
    local_api: String,

    /// Broker's agent upgrade path.
    #[arg(long, default_value = "/ws")]
    agent_path: String,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let config = AgentConfig {
        client_id: cli.client_id,
        broker_url: cli.cloud_url,
        agent_path: cli.agent_path,
        local_api: cli.local_api,
        ..AgentConfig::default()
    };

    agent::run(config).await?;
    Ok(())
}
