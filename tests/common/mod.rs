//! Shared utilities for broker integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use tunnel_broker::config::BrokerConfig;
use tunnel_broker::http::{AppState, HttpServer};
use tunnel_broker::lifecycle::Shutdown;
use tunnel_broker::tunnel::TunnelMessage;

/// An in-process broker on an ephemeral port.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
}

impl TestBroker {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn agent_url(&self, client_id: &str) -> String {
        format!("ws://{}/ws?client_id={}", self.addr, client_id)
    }

    /// Relay URL for one side (`client` or `ssh`) of a session.
    pub fn relay_url(&self, side: &str, client_id: &str, session_id: &str) -> String {
        format!("ws://{}/ws/{}/{}/{}", self.addr, side, client_id, session_id)
    }

    /// Wait until exactly `count` relay sockets are parked.
    pub async fn wait_for_parked(&self, count: usize) {
        let relays = self.state.relays.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while relays.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay sockets did not park in time");
    }

    /// Wait until exactly `count` agents are registered.
    pub async fn wait_for_agents(&self, count: usize) {
        let registry = self.state.dispatcher.registry().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agents did not register in time");
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a broker with `config`, bound to 127.0.0.1 on a free port.
pub async fn start_broker(config: BrokerConfig) -> TestBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config);
    let state = server.state().clone();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestBroker {
        addr,
        state,
        shutdown,
    }
}

/// Broker config with a short reply deadline.
pub fn config_with_timeout(ms: u64) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.dispatch.response_timeout_ms = ms;
    config
}

/// Connect a scripted agent. `respond` maps each request to an optional
/// reply; `None` leaves the request unanswered.
pub async fn spawn_agent<F>(url: String, respond: F) -> JoinHandle<()>
where
    F: Fn(TunnelMessage) -> Option<TunnelMessage> + Send + 'static,
{
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("agent failed to connect");
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            let Message::Text(text) = frame else { continue };
            let request = TunnelMessage::decode(text.as_str()).expect("broker sent malformed frame");
            if let Some(reply) = respond(request) {
                let frame = reply.encode().unwrap();
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Client that never reuses connections.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
