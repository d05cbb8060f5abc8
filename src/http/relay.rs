//! Relay upgrade endpoints.
//!
//! Both sides of a relay session name it by path; which route a socket
//! arrives on decides its role.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};

use crate::http::server::AppState;
use crate::tunnel::{RelayRole, RelaySession, SessionKey};

/// Upgrade route for the client side of a relay session.
pub const RELAY_CLIENT_ROUTE: &str = "/ws/client/{client_id}/{session_id}";

/// Upgrade route for the host side of a relay session.
pub const RELAY_HOST_ROUTE: &str = "/ws/ssh/{client_id}/{session_id}";

pub async fn relay_client_handler(
    State(state): State<AppState>,
    Path((client_id, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKey::new(client_id, session_id), RelayRole::Client, ws)
}

pub async fn relay_host_handler(
    State(state): State<AppState>,
    Path((client_id, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKey::new(client_id, session_id), RelayRole::Host, ws)
}

fn upgrade(state: AppState, key: SessionKey, role: RelayRole, ws: WebSocketUpgrade) -> Response {
    let relays = state.relays.clone();
    ws.on_upgrade(move |socket| async move {
        tracing::info!(session = %key, role = %role, "Relay socket connected");
        RelaySession::new(key, role, relays).run(socket).await;
    })
    .into_response()
}
