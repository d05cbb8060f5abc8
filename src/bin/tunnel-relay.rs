//! Relay helpers: carry a TCP service (typically SSH) through the broker's
//! relay endpoints.
//!
//! ```text
//! tunnel-relay host     # on the private machine, next to sshd
//! tunnel-relay forward  # on the user's machine; then `ssh -p 2222 127.0.0.1`
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use tunnel_broker::agent::bridge::{self, RelayConfig};
use tunnel_broker::observability::logging;
use tunnel_broker::tunnel::RelayRole;

#[derive(Parser)]
#[command(name = "tunnel-relay")]
#[command(about = "Carry a TCP service through a tunnel broker relay session", long_about = None)]
struct Cli {
    /// Broker base URL.
    #[arg(long, env = "DOMAIN", default_value = "ws://127.0.0.1:8080")]
    domain: String,

    /// Client id naming the relay session.
    #[arg(long, env = "CLIENT_ID", default_value = "defaultclient")]
    client_id: String,

    /// Session id naming the relay session.
    #[arg(long, env = "SESSION_ID", default_value = "default")]
    session_id: String,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge the host side of the session to a local TCP service
    Host {
        #[arg(long, default_value = "127.0.0.1")]
        ssh_host: String,

        #[arg(long, env = "SSH_PORT", default_value_t = 22)]
        ssh_port: u16,
    },
    /// Listen locally and carry each connection over the client side
    Forward {
        #[arg(long, default_value = "127.0.0.1:2222")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let config = RelayConfig {
        broker_url: cli.domain,
        client_id: cli.client_id,
        session_id: cli.session_id,
    };

    match cli.command {
        Commands::Host { ssh_host, ssh_port } => {
            let url = config.url(RelayRole::Host)?;
            bridge::run_host(url, format!("{ssh_host}:{ssh_port}")).await;
        }
        Commands::Forward { listen } => {
            let url = config.url(RelayRole::Client)?;
            let listener = TcpListener::bind(&listen).await?;
            bridge::forward_local(listener, url).await?;
        }
    }
    Ok(())
}
