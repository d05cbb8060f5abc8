//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Own the agent registry, correlation table, dispatcher and relay table
//! - Create the public Axum router (agent upgrade endpoint, relay endpoints,
//!   catch-all gateway)
//! - Create the admin router when enabled
//! - Serve until the shutdown signal

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, DefaultBodyLimit},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::admin::setup_admin_router;
use crate::config::BrokerConfig;
use crate::http::gateway::{agent_connect_handler, gateway_handler};
use crate::http::relay::{relay_client_handler, relay_host_handler, RELAY_CLIENT_ROUTE, RELAY_HOST_ROUTE};
use crate::lifecycle::shutdown::wait_for_shutdown;
use crate::tunnel::{AgentRegistry, CorrelationTable, Dispatcher, RelayTable};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub relays: Arc<RelayTable<WebSocket>>,
    pub config: Arc<BrokerConfig>,
}

/// HTTP server for the tunnel broker.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let correlations = Arc::new(CorrelationTable::new());
        let dispatcher = Dispatcher::new(registry, correlations, config.dispatch.response_timeout());

        let state = AppState {
            dispatcher,
            relays: Arc::new(RelayTable::new()),
            config: Arc::new(config),
        };

        let router = Self::build_router(&state);
        Self { router, state }
    }

    /// Build the public router with all middleware layers.
    fn build_router(state: &AppState) -> Router {
        let config = &state.config;
        Router::new()
            .route(&config.listener.agent_path, get(agent_connect_handler))
            .route(RELAY_CLIENT_ROUTE, get(relay_client_handler))
            .route(RELAY_HOST_ROUTE, get(relay_host_handler))
            .fallback(gateway_handler)
            .with_state(state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(config.limits.max_body_size))
                    .layer(DefaultBodyLimit::max(config.limits.max_body_size)),
            )
    }

    /// Public router, for serving or driving in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Admin router (health, status, agents).
    pub fn admin_router(&self) -> Router {
        setup_admin_router(self.state.clone())
    }

    /// Shared state: dispatcher, registry, correlation table, relay table, config.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &BrokerConfig {
        &self.state.config
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Returns once Ctrl+C is received or `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            agent_path = %self.state.config.listener.agent_path,
            response_timeout_ms = self.state.config.dispatch.response_timeout_ms,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
