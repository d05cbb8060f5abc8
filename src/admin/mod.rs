//! Admin surface, served on its own listener.
//!
//! - `GET /health`: liveness, unauthenticated
//! - `GET /admin/status`: version, agent, exchange and parked relay counts
//! - `GET /admin/agents`: connected agents in rotation order

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/agents", get(get_agents))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .route("/health", get(health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
    };
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::http::HttpServer;
    use crate::tunnel::{AgentHandle, ConnectionId};

    fn server() -> HttpServer {
        let mut config = BrokerConfig::default();
        config.admin.api_key = "secret".into();
        HttpServer::new(config)
    }

    async fn get_json(router: Router, uri: &str, key: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::get(uri);
        if let Some(key) = key {
            req = req.header(AUTHORIZATION, format!("Bearer {key}"));
        }
        let res = router.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let (status, body) = get_json(server().admin_router(), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn admin_routes_require_key() {
        let server = server();
        let (status, _) = get_json(server.admin_router(), "/admin/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get_json(server.admin_router(), "/admin/agents", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn agents_listed_in_rotation_order() {
        let server = server();
        let registry = server.state().dispatcher.registry().clone();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(AgentHandle::new("a", ConnectionId::new(), tx.clone()));
        registry.register(AgentHandle::new("b", ConnectionId::new(), tx));

        let (status, body) = get_json(server.admin_router(), "/admin/agents", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["client_id"], "a");
        assert_eq!(body[1]["client_id"], "b");

        let (_, status_body) = get_json(server.admin_router(), "/admin/status", Some("secret")).await;
        assert_eq!(status_body["connected_agents"], 2);
        assert_eq!(status_body["pending_exchanges"], 0);
        assert_eq!(status_body["relay_waiting"], 0);
    }
}
