//! Shared pool of payload listener ports.
//!
//! Every payload upload reserves one port from the configured range before
//! it advertises anything. A reservation binds the listener synchronously,
//! so an advertised port is always backed by a live socket. The RAII guard
//! releases the port on every exit path and fires a broadcast that links
//! surface to their peers as a capacity change.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPoolError {
    /// Every pool port is currently reserved. Retry after a release.
    #[error("All payload ports are in use")]
    Busy,

    /// No port is reserved by this pool, yet none can be bound. Something
    /// outside the process owns the range; retrying will not help.
    #[error("No payload port can be bound")]
    Exhausted,
}

struct PoolInner {
    range: RangeInclusive<u16>,
    reserved: Mutex<HashSet<u16>>,
    released: broadcast::Sender<()>,
}

/// Cloneable handle to the pool shared by all links.
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<PoolInner>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let (released, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(PoolInner {
                range,
                reserved: Mutex::new(HashSet::new()),
                released,
            }),
        }
    }

    /// Reserve the first free port in the range and bind its listener.
    pub fn reserve(&self) -> Result<ReservedPort, PortPoolError> {
        let mut reserved = self.inner.reserved.lock();
        let mut any_reserved = false;
        for port in self.inner.range.clone() {
            if reserved.contains(&port) {
                any_reserved = true;
                continue;
            }
            let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
            let listener = match std::net::TcpListener::bind(addr) {
                Ok(l) => l,
                Err(_) => continue,
            };
            if listener.set_nonblocking(true).is_err() {
                continue;
            }
            reserved.insert(port);
            tracing::debug!("Reserved payload port {}", port);
            return Ok(ReservedPort {
                port,
                listener: Some(listener),
                pool: Arc::clone(&self.inner),
            });
        }
        if any_reserved || !reserved.is_empty() {
            Err(PortPoolError::Busy)
        } else {
            Err(PortPoolError::Exhausted)
        }
    }

    /// Notified once for every released reservation.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.released.subscribe()
    }

    #[cfg(test)]
    fn reserved_count(&self) -> usize {
        self.inner.reserved.lock().len()
    }
}

/// One bound pool port. Dropping it releases the port and notifies waiters.
pub struct ReservedPort {
    port: u16,
    listener: Option<std::net::TcpListener>,
    pool: Arc<PoolInner>,
}

impl ReservedPort {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hand the bound listener to the upload task. Callable once; must run
    /// inside a tokio runtime.
    pub fn take_listener(&mut self) -> std::io::Result<tokio::net::TcpListener> {
        let listener = self.listener.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "listener already taken")
        })?;
        tokio::net::TcpListener::from_std(listener)
    }
}

impl std::fmt::Debug for ReservedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedPort").field("port", &self.port).finish()
    }
}

impl Drop for ReservedPort {
    fn drop(&mut self) {
        // Close the socket before announcing the port free.
        self.listener.take();
        self.pool.reserved.lock().remove(&self.port);
        tracing::debug!("Released payload port {}", self.port);
        let _ = self.pool.released.send(());
    }
}
