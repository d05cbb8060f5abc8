use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::server::AppState;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub connected_agents: usize,
    pub pending_exchanges: usize,
    pub relay_waiting: usize,
    pub response_timeout_ms: u64,
}

#[derive(Serialize)]
pub struct AgentStatus {
    pub client_id: String,
    pub connection_id: u64,
    pub connected_secs: u64,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let dispatcher = &state.dispatcher;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        connected_agents: dispatcher.registry().len(),
        pending_exchanges: dispatcher.correlations().len(),
        relay_waiting: state.relays.len(),
        response_timeout_ms: dispatcher.response_timeout().as_millis() as u64,
    })
}

/// Connected agents in rotation order.
pub async fn get_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    let agents = state
        .dispatcher
        .registry()
        .snapshot()
        .into_iter()
        .map(|agent| AgentStatus {
            connection_id: agent.connection_id.as_u64(),
            connected_secs: agent.uptime().as_secs(),
            client_id: agent.client_id,
        })
        .collect();
    Json(agents)
}
