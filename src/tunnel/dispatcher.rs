//! Request/reply exchange against one agent.
//!
//! # Flow
//! ```text
//! select agent (round robin)
//!     → assign exchange id (UUID v4)
//!     → park id in correlation table
//!     → queue request on agent channel   ── fail → abandon, AgentSendFailed
//!     → await reply or deadline          ── late → abandon, ResponseTimeout
//! ```
//!
//! No retries happen here; a failed exchange is reported to the caller as is.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use uuid::Uuid;

use crate::observability::metrics;
use crate::tunnel::correlation::CorrelationTable;
use crate::tunnel::error::DispatchError;
use crate::tunnel::message::TunnelMessage;
use crate::tunnel::registry::AgentRegistry;

/// Default reply deadline.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs exchanges against the connected agents.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    correlations: Arc<CorrelationTable>,
    response_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        correlations: Arc<CorrelationTable>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlations,
            response_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn correlations(&self) -> &Arc<CorrelationTable> {
        &self.correlations
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Send `request` to the next agent and wait for its reply.
    ///
    /// Any id already on `request` is replaced by a fresh exchange id.
    pub async fn dispatch(&self, mut request: TunnelMessage) -> Result<TunnelMessage, DispatchError> {
        let agent = self.registry.select_next().inspect_err(|_| {
            metrics::record_exchange_outcome("no_agent");
        })?;

        let id = Uuid::new_v4().simple().to_string();
        let reply = self.correlations.register(&id).inspect_err(|e| {
            tracing::error!(exchange_id = %id, error = %e, "Exchange id collision");
        })?;

        request.id = id.clone();
        tracing::debug!(
            exchange_id = %id,
            client_id = %agent.client_id,
            method = %request.method,
            path = %request.path,
            "Dispatching request to agent"
        );

        if let Err(e) = agent.send(request) {
            self.correlations.abandon(&id);
            metrics::record_exchange_outcome("send_failed");
            return Err(e);
        }

        match time::timeout(self.response_timeout, reply).await {
            Ok(Ok(message)) => {
                metrics::record_exchange_outcome("reply");
                tracing::debug!(
                    exchange_id = %id,
                    client_id = %agent.client_id,
                    status = message.status,
                    "Agent replied"
                );
                Ok(message)
            }
            // The sender only disappears when the entry was removed without a
            // reply, which leaves nothing but the deadline to report.
            Ok(Err(_)) | Err(_) => {
                self.correlations.abandon(&id);
                metrics::record_exchange_outcome("timeout");
                tracing::warn!(
                    exchange_id = %id,
                    client_id = %agent.client_id,
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "Agent response timeout"
                );
                Err(DispatchError::ResponseTimeout {
                    timeout_ms: self.response_timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use super::*;
    use crate::tunnel::registry::{AgentHandle, ConnectionId};

    fn dispatcher(timeout: Duration) -> Dispatcher {
        Dispatcher::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(CorrelationTable::new()),
            timeout,
        )
    }

    fn connect(d: &Dispatcher, id: &str, capacity: usize) -> mpsc::Receiver<TunnelMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        d.registry().register(AgentHandle::new(id, ConnectionId::new(), tx));
        rx
    }

    /// Answer every request on `rx` with `status`, echoing the path as body.
    fn spawn_echo_agent(d: &Dispatcher, mut rx: mpsc::Receiver<TunnelMessage>, status: u16) {
        let table = d.correlations().clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let reply = TunnelMessage::reply(req.id.clone(), status, HashMap::new(), req.path);
                table.deliver(&req.id, reply);
            }
        });
    }

    fn get(path: &str) -> TunnelMessage {
        TunnelMessage::request("GET", path, HashMap::new(), "")
    }

    #[tokio::test]
    async fn no_agent_fails_immediately() {
        let d = dispatcher(DEFAULT_RESPONSE_TIMEOUT);
        assert!(matches!(
            d.dispatch(get("/")).await,
            Err(DispatchError::NoAgentAvailable)
        ));
        assert!(d.correlations().is_empty());
    }

    #[tokio::test]
    async fn reply_is_returned_and_entry_removed() {
        let d = dispatcher(DEFAULT_RESPONSE_TIMEOUT);
        let rx = connect(&d, "a", 8);
        spawn_echo_agent(&d, rx, 200);

        let reply = d.dispatch(get("/status")).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, "/status");
        assert!(d.correlations().is_empty());
    }

    #[tokio::test]
    async fn request_carries_fresh_id() {
        let d = dispatcher(Duration::from_millis(50));
        let mut rx = connect(&d, "a", 8);

        let mut request = get("/");
        request.id = "caller-supplied".into();
        let _ = d.dispatch(request).await;
        let _ = d.dispatch(get("/")).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.has_id());
        assert_ne!(first.id, "caller-supplied");
        assert_ne!(first.id, second.id);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_times_out_and_cleans_up() {
        let d = dispatcher(Duration::from_secs(5));
        let mut rx = connect(&d, "a", 8);

        let result = d.dispatch(get("/slow")).await;
        assert!(matches!(
            result,
            Err(DispatchError::ResponseTimeout { timeout_ms: 5000 })
        ));

        let sent = rx.recv().await.unwrap();
        assert!(!d.correlations().contains(&sent.id));
        assert!(d.correlations().is_empty());

        // A reply arriving after the deadline is silently dropped.
        let late = TunnelMessage::reply(sent.id.clone(), 200, HashMap::new(), "");
        assert!(!d.correlations().deliver(&sent.id, late));
    }

    #[tokio::test]
    async fn full_queue_fails_send_and_cleans_up() {
        let d = dispatcher(Duration::from_millis(20));
        let _rx = connect(&d, "a", 1);

        // First request occupies the only queue slot and times out.
        let _ = d.dispatch(get("/one")).await;
        assert!(matches!(
            d.dispatch(get("/two")).await,
            Err(DispatchError::AgentSendFailed { client_id }) if client_id == "a"
        ));
        assert!(d.correlations().is_empty());
    }

    #[tokio::test]
    async fn closed_agent_fails_send() {
        let d = dispatcher(DEFAULT_RESPONSE_TIMEOUT);
        let rx = connect(&d, "a", 8);
        drop(rx);

        assert!(matches!(
            d.dispatch(get("/")).await,
            Err(DispatchError::AgentSendFailed { .. })
        ));
        assert!(d.correlations().is_empty());
    }

    #[tokio::test]
    async fn requests_alternate_between_two_agents() {
        let d = dispatcher(DEFAULT_RESPONSE_TIMEOUT);
        let rx_a = connect(&d, "a", 8);
        let rx_b = connect(&d, "b", 8);
        spawn_echo_agent(&d, rx_a, 201);
        spawn_echo_agent(&d, rx_b, 202);

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(d.dispatch(get("/")).await.unwrap().status);
        }
        assert_eq!(statuses[0], statuses[2]);
        assert_ne!(statuses[0], statuses[1]);
    }
}
