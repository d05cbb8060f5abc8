//! Correlation of in-flight exchanges with their replies.
//!
//! Each dispatched request parks a one-shot sender here under its exchange
//! id. The agent session delivers the reply through it; the dispatcher
//! removes the entry itself when the send fails or the wait times out.
//! Whichever happens first wins and the entry is gone afterwards.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::observability::metrics;
use crate::tunnel::error::DispatchError;
use crate::tunnel::message::TunnelMessage;

/// Receiving end of a registered exchange.
pub type ReplyHandle = oneshot::Receiver<TunnelMessage>;

/// In-flight exchanges awaiting a reply.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, oneshot::Sender<TunnelMessage>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<TunnelMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a new exchange and return the handle its reply arrives on.
    pub fn register(&self, id: &str) -> Result<ReplyHandle, DispatchError> {
        let mut pending = self.lock();
        if pending.contains_key(id) {
            return Err(DispatchError::DuplicateId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        tracing::trace!(exchange_id = %id, in_flight = pending.len(), "Exchange registered");
        Ok(rx)
    }

    /// Hand a reply to its waiting exchange.
    ///
    /// Replies for unknown ids (late, duplicate, or after a timeout) are
    /// dropped. Returns whether the reply reached a waiter.
    pub fn deliver(&self, id: &str, message: TunnelMessage) -> bool {
        let sender = self.lock().remove(id);
        match sender {
            Some(tx) => {
                // The waiter may have just timed out; the reply is then dropped.
                let delivered = tx.send(message).is_ok();
                tracing::trace!(exchange_id = %id, delivered, "Reply delivered");
                delivered
            }
            None => {
                metrics::record_late_reply();
                tracing::debug!(exchange_id = %id, "Dropping reply with no waiting exchange");
                false
            }
        }
    }

    /// Forget an exchange. Unknown ids are ignored.
    pub fn abandon(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            tracing::trace!(exchange_id = %id, "Exchange abandoned");
        }
    }

    /// Whether `id` is currently in flight.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    fn reply(id: &str, status: u16) -> TunnelMessage {
        TunnelMessage::reply(id, status, HashMap::new(), "")
    }

    #[tokio::test]
    async fn register_and_deliver() {
        let table = CorrelationTable::new();
        let rx = table.register("x1").unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.deliver("x1", reply("x1", 200)));
        assert!(table.is_empty());
        assert_eq!(rx.await.unwrap().status, 200);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = CorrelationTable::new();
        let _rx = table.register("x1").unwrap();
        assert!(matches!(
            table.register("x1"),
            Err(DispatchError::DuplicateId(id)) if id == "x1"
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn only_first_delivery_is_honored() {
        let table = CorrelationTable::new();
        let rx = table.register("x1").unwrap();

        assert!(table.deliver("x1", reply("x1", 200)));
        assert!(!table.deliver("x1", reply("x1", 500)));
        assert_eq!(rx.await.unwrap().status, 200);
    }

    #[test]
    fn delivery_to_unknown_id_is_dropped() {
        let table = CorrelationTable::new();
        assert!(!table.deliver("missing", reply("missing", 200)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn delivery_after_abandon_is_dropped() {
        let table = CorrelationTable::new();
        let rx = table.register("x1").unwrap();
        table.abandon("x1");

        assert!(!table.contains("x1"));
        assert!(!table.deliver("x1", reply("x1", 200)));
        assert!(rx.await.is_err());
    }

    #[test]
    fn delivery_to_dropped_waiter_does_not_panic() {
        let table = CorrelationTable::new();
        drop(table.register("x1").unwrap());
        assert!(!table.deliver("x1", reply("x1", 200)));
        assert!(table.is_empty());
    }

    #[test]
    fn abandon_unknown_id_is_noop() {
        let table = CorrelationTable::new();
        table.abandon("missing");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn id_is_reusable_after_resolution() {
        let table = CorrelationTable::new();
        let _first = table.register("x1").unwrap();
        table.abandon("x1");

        let second = table.register("x1").unwrap();
        table.deliver("x1", reply("x1", 204));
        assert_eq!(second.await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn concurrent_exchanges_resolve_independently() {
        let table = Arc::new(CorrelationTable::new());
        let mut tasks = Vec::new();

        for i in 0..20u16 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("x{i}");
                let rx = table.register(&id).unwrap();
                tokio::task::yield_now().await;
                table.deliver(&id, reply(&id, 200 + i));
                rx.await.unwrap()
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let msg = task.await.unwrap();
            assert_eq!(msg.id, format!("x{i}"));
            assert_eq!(msg.status, 200 + i as u16);
        }
        assert!(table.is_empty());
    }
}
