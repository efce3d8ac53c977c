//! Connection records and the active-connection registry.
//!
//! Each accepted connection is tracked as a [`Client`]: its peer address, a
//! duplicated socket handle that lets the shutdown path force it closed, and
//! a [`Wait`] counting its in-flight writes. Handlers keep their clients in a
//! [`ConnectionRegistry`] so `close` can drain and shut them all down.

use crate::wait::{Wait, WaitGuard};
use slab::Slab;
use socket2::{SockRef, Socket};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A single client connection.
#[derive(Debug)]
pub struct Client {
    peer: SocketAddr,
    /// Duplicate of the connection's socket, used to shut it down while
    /// another task owns the stream.
    socket: Socket,
    waiting: Arc<Wait>,
}

impl Client {
    /// Create a record for an accepted stream.
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            peer: stream.peer_addr()?,
            socket: SockRef::from(stream).try_clone()?,
            waiting: Arc::new(Wait::new()),
        })
    }

    /// Address of the remote peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Mark one operation on this connection as in flight.
    pub fn begin_operation(&self) -> WaitGuard {
        self.waiting.enter()
    }

    /// Number of in-flight operations.
    pub fn in_flight(&self) -> usize {
        self.waiting.count()
    }

    /// Shut the socket down in both directions.
    ///
    /// Pending and future reads on the connection observe end-of-stream.
    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %e, "Socket shutdown failed");
        }
    }

    /// Wait up to `grace` for in-flight operations, then force the
    /// connection closed.
    ///
    /// Returns `true` if the grace period elapsed before the operations
    /// drained.
    pub async fn close(&self, grace: Duration) -> bool {
        let timed_out = self.waiting.wait_with_timeout(grace).await;
        if timed_out {
            warn!(
                peer = %self.peer,
                in_flight = self.in_flight(),
                "Grace period elapsed, forcing connection closed"
            );
        }
        self.shutdown();
        timed_out
    }
}

/// Registry of active connections using slab allocation.
///
/// Insert, remove and snapshot are safe to call from any task. Once
/// [`close_all`](Self::close_all) has started, new registrations are refused.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: Mutex<Slab<Arc<Client>>>,
    closing: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client.
    ///
    /// Returns `None` if the registry is closing.
    pub fn register(&self, client: Arc<Client>) -> Option<usize> {
        let mut clients = self.lock();
        if self.is_closing() {
            return None;
        }
        Some(clients.insert(client))
    }

    /// Remove a client from the registry.
    pub fn remove(&self, id: usize) -> Option<Arc<Client>> {
        self.lock().try_remove(id)
    }

    /// Whether `close_all` has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clients registered at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Refuse new registrations, then close every registered client
    /// concurrently, each with its own `grace` window.
    pub async fn close_all(&self, grace: Duration) {
        let clients = {
            let clients = self.lock();
            self.closing.store(true, Ordering::Release);
            clients.iter().map(|(_, c)| Arc::clone(c)).collect::<Vec<_>>()
        };

        debug!(connections = clients.len(), "Closing active connections");

        let mut closing = JoinSet::new();
        for client in clients {
            closing.spawn(async move { client.close(grace).await });
        }
        while let Some(result) = closing.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Connection close task failed");
            }
        }
    }
}
