use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Tracks the live push socket for each connected phonenumber.
///
/// The registry never touches a socket directly: it holds the sender
/// side of each connection's outbound frame channel, so writes to one
/// socket are serialized by its writer task while fan-out across
/// sockets stays concurrent.
///
/// Uses `std::sync::RwLock` — every critical section is a map
/// operation plus a non-blocking `try_send`, never held across an
/// await point.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
    connected: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connected: AtomicUsize::new(0),
        }
    }

    /// Bind `phonenumber` to a connection's outbound channel,
    /// replacing any previous binding.
    pub fn attach(&self, phonenumber: &str, sender: mpsc::Sender<Bytes>) {
        let mut connections = self
            .connections
            .write()
            .expect("registry lock poisoned");
        if connections
            .insert(phonenumber.to_string(), sender)
            .is_none()
        {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }
        debug!(phonenumber, "connection attached");
    }

    /// Remove the binding for `phonenumber`. Idempotent.
    pub fn detach(&self, phonenumber: &str) {
        let mut connections = self
            .connections
            .write()
            .expect("registry lock poisoned");
        if connections.remove(phonenumber).is_some() {
            self.connected.fetch_sub(1, Ordering::Relaxed);
            debug!(phonenumber, "connection detached");
        }
    }

    /// Hand `frame` to every target's outbound channel. Targets
    /// without a live connection are skipped silently; a full channel
    /// drops the frame for that target without affecting the others.
    pub fn push(&self, targets: &[String], frame: Bytes) {
        let connections = self
            .connections
            .read()
            .expect("registry lock poisoned");

        for target in targets {
            let Some(sender) = connections.get(target) else {
                continue;
            };
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(phonenumber = %target, "outbound channel full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(phonenumber = %target, "outbound channel closed");
                }
            }
        }
    }

    pub fn is_connected(&self, phonenumber: &str) -> bool {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .contains_key(phonenumber)
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn attach_detach_tracks_count() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();

        registry.attach("111", tx_a);
        registry.attach("222", tx_b);
        assert_eq!(registry.connected_count(), 2);
        assert!(registry.is_connected("111"));

        // replacing a binding does not double-count
        let (tx_a2, _rx_a2) = channel();
        registry.attach("111", tx_a2);
        assert_eq!(registry.connected_count(), 2);

        registry.detach("111");
        registry.detach("111");
        assert_eq!(registry.connected_count(), 1);
        assert!(!registry.is_connected("111"));
    }

    #[tokio::test]
    async fn push_delivers_to_attached_targets_only() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.attach("111", tx_a);
        registry.attach("222", tx_b);

        registry.push(
            &["111".into(), "333".into()],
            Bytes::from_static(b"frame"),
        );

        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"frame"));
        assert!(rx_b.try_recv().is_err(), "untargeted socket got a frame");
    }

    #[tokio::test]
    async fn full_channel_does_not_block_other_targets() {
        let registry = ConnectionRegistry::new();
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = channel();
        registry.attach("full", tx_full);
        registry.attach("ok", tx_ok);

        // saturate the first target's channel
        registry.push(&["full".into()], Bytes::from_static(b"one"));
        registry.push(
            &["full".into(), "ok".into()],
            Bytes::from_static(b"two"),
        );

        assert_eq!(rx_ok.try_recv().unwrap(), Bytes::from_static(b"two"));
    }
}
