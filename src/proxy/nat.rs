//! Packet NAT table: client source address to ephemeral upstream socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;

/// The lock covers point operations only; no I/O happens while it is held.
pub struct NatMap {
    entries: Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>,
}

impl NatMap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.lock().get(peer).cloned()
    }

    pub fn insert(&self, peer: SocketAddr, socket: Arc<UdpSocket>) {
        self.lock().insert(peer, socket);
    }

    /// Remove and return the entry; the caller drops the socket to close it.
    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.lock().remove(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, Arc<UdpSocket>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NatMap {
    fn default() -> Self {
        Self::new()
    }
}
