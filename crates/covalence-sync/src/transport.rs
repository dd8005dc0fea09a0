//! Transport abstraction for the sync protocol.
//!
//! A transport moves [`SyncMessage`]s to and from one peer. Implementations
//! must be thread-safe: the sync manager reads and writes from separate tasks.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::messages::SyncMessage;

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Transport trait for one peer connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message, waiting while the connection is backed up.
    async fn send(&self, message: SyncMessage) -> Result<()>;

    /// Next message from the peer; `None` once the connection is closed.
    async fn recv(&self) -> Result<Option<SyncMessage>>;

    /// Close the connection. Pending outgoing data is dropped.
    async fn close(&self);

    /// Watch the connection status.
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    fn is_connected(&self) -> bool {
        *self.status().borrow() == ConnectionStatus::Connected
    }
}

/// Resolve once `status` reports a disconnect (or its sender is gone).
pub(crate) async fn disconnected(mut status: watch::Receiver<ConnectionStatus>) {
    loop {
        let current = *status.borrow_and_update();
        if current == ConnectionStatus::Disconnected {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

/// In-memory transports for tests and in-process peers.
pub mod memory {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    use crate::error::SyncError;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        tx: mpsc::Sender<SyncMessage>,
        rx: Mutex<mpsc::Receiver<SyncMessage>>,
        status: Arc<watch::Sender<ConnectionStatus>>,
    }

    /// Two connected ends sharing one status. Each direction buffers up to
    /// `capacity` messages before `send` waits.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        let status = Arc::new(status);
        (
            MemoryTransport {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                status: status.clone(),
            },
            MemoryTransport {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                status,
            },
        )
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, message: SyncMessage) -> Result<()> {
            if !self.is_connected() {
                return Err(SyncError::Closed);
            }
            tokio::select! {
                sent = self.tx.send(message) => sent.map_err(|_| SyncError::Closed),
                _ = disconnected(self.status.subscribe()) => Err(SyncError::Closed),
            }
        }

        async fn recv(&self) -> Result<Option<SyncMessage>> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                message = rx.recv() => Ok(message),
                _ = disconnected(self.status.subscribe()) => Ok(None),
            }
        }

        async fn close(&self) {
            self.status.send_replace(ConnectionStatus::Disconnected);
        }

        fn status(&self) -> watch::Receiver<ConnectionStatus> {
            self.status.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;
    use covalence_core::CoValueId;

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let (a, b) = memory::pair(8);
        let id = CoValueId::derive(b"v");

        a.send(SyncMessage::Done { id }).await.unwrap();
        b.send(SyncMessage::Ping).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(SyncMessage::Done { id }));
        assert_eq!(a.recv().await.unwrap(), Some(SyncMessage::Ping));
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_memory_close_ends_both_sides() {
        let (a, b) = memory::pair(8);
        let mut status = b.status();

        let waiting = tokio::spawn(async move {
            let message = b.recv().await.unwrap();
            (message, b)
        });
        tokio::task::yield_now().await;
        a.close().await;

        let (message, b) = waiting.await.unwrap();
        assert_eq!(message, None);
        assert!(b.send(SyncMessage::Ping).await.is_err());
        assert!(a.send(SyncMessage::Ping).await.is_err());
        status.changed().await.ok();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    }
}
