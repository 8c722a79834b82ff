//! Tracks live browser connections.
//!
//! Each connection is represented by the sending half of its outbound
//! message queue. A connection whose receiving half has gone away is
//! considered closed and is pruned on the next liveness broadcast.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

struct ConnectionEntry {
    sender: Outbound,
    /// Cancelled when the connection is unregistered or the server shuts down.
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

/// Active persistent connections keyed by an opaque id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a connection and returns its fresh id together with the token
    /// that signals its teardown.
    pub fn register(&self, sender: Outbound) -> (Uuid, CancellationToken) {
        let cancel = CancellationToken::new();
        let mut connections = self.connections.lock();
        let mut id = Uuid::new_v4();
        while connections.contains_key(&id) {
            id = Uuid::new_v4();
        }
        connections.insert(
            id,
            ConnectionEntry {
                sender,
                cancel: cancel.clone(),
                connected_at: Utc::now(),
            },
        );
        tracing::info!(connection = %id, active = connections.len(), "connection registered");
        (id, cancel)
    }

    /// Removes a connection and cancels its token. Returns whether it was present.
    pub fn unregister(&self, id: Uuid) -> bool {
        let removed = self.connections.lock().remove(&id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(
                    connection = %id,
                    connected_for_secs = (Utc::now() - entry.connected_at).num_seconds(),
                    "connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Sends a ping to every open connection, dropping the closed ones.
    /// Returns the number of pings delivered to a queue.
    pub fn broadcast_liveness(&self) -> usize {
        let ping = ServerMessage::ping();
        let mut sent = 0;
        let mut connections = self.connections.lock();
        connections.retain(|id, entry| {
            if !entry.sender.is_closed() && entry.sender.send(ping.clone()).is_ok() {
                sent += 1;
                true
            } else {
                tracing::debug!(connection = %id, "pruning closed connection");
                entry.cancel.cancel();
                false
            }
        });
        tracing::trace!(sent, "liveness ping broadcast");
        sent
    }

    /// Broadcasts liveness pings every `interval` until `shutdown` fires.
    pub async fn run_liveness(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_liveness();
                }
            }
        }
    }

    /// Cancels and forgets every connection.
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self.connections.lock().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all connections");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.connections.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_restores_size() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (existing, _) = registry.register(tx);
        let before = registry.len();

        let (tx, _rx2) = mpsc::unbounded_channel();
        let (id, token) = registry.register(tx);
        assert_ne!(id, existing);
        assert_eq!(registry.len(), before + 1);

        assert!(registry.unregister(id));
        assert_eq!(registry.len(), before);
        assert!(token.is_cancelled());
        assert!(!registry.unregister(id));
    }

    #[test]
    fn broadcast_pings_open_and_prunes_closed() {
        let registry = ConnectionRegistry::new();
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (open_id, _) = registry.register(open_tx);
        let (_, closed_token) = registry.register(closed_tx);
        drop(closed_rx);

        assert_eq!(registry.broadcast_liveness(), 1);
        assert_eq!(registry.ids(), vec![open_id]);
        assert!(closed_token.is_cancelled());
        assert!(matches!(
            open_rx.try_recv(),
            Ok(ServerMessage::Ping { .. })
        ));
    }

    #[test]
    fn shutdown_all_cancels_every_token() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (_, a) = registry.register(tx_a);
        let (_, b) = registry.register(tx_b);

        registry.shutdown_all();
        assert!(registry.is_empty());
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_loop_pings_on_interval() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(tx);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            async move {
                registry
                    .run_liveness(Duration::from_secs(30), shutdown)
                    .await
            }
        });

        assert!(matches!(rx.recv().await, Some(ServerMessage::Ping { .. })));
        shutdown.cancel();
        task.await.unwrap();
    }
}
