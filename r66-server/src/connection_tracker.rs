//! Connection slot accounting
//!
//! Enforces a global ceiling on concurrent physical connections plus a
//! per-IP ceiling. Slots are held by RAII guards and released on drop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Why a slot could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// The server-wide ceiling is reached
    Global,
    /// This IP already holds its maximum number of connections
    PerIp,
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

/// Tracks active connections globally and per IP address
///
/// A limit of 0 means unlimited.
#[derive(Debug)]
pub struct ConnectionTracker {
    counts: Arc<Mutex<Counts>>,
    /// Maximum concurrent connections (0 = unlimited)
    max_connections: usize,
    /// Maximum concurrent connections per IP (0 = unlimited)
    max_connections_per_ip: usize,
}

impl ConnectionTracker {
    /// Create a new connection tracker with the specified limits
    #[must_use]
    pub fn new(max_connections: usize, max_connections_per_ip: usize) -> Self {
        Self {
            counts: Arc::new(Mutex::new(Counts::default())),
            max_connections,
            max_connections_per_ip,
        }
    }

    /// Try to acquire a connection slot for the given IP
    ///
    /// The returned guard releases the slot when dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, LimitKind> {
        let (max_total, max_per_ip) = (self.max_connections, self.max_connections_per_ip);
        let mut counts = self.counts.lock().expect("connection tracker lock poisoned");

        if max_total > 0 && counts.total >= max_total {
            return Err(LimitKind::Global);
        }
        let current = counts.per_ip.get(&ip).copied().unwrap_or(0);
        if max_per_ip > 0 && current >= max_per_ip {
            return Err(LimitKind::PerIp);
        }

        counts.total += 1;
        *counts.per_ip.entry(ip).or_insert(0) += 1;
        Ok(ConnectionGuard {
            ip,
            counts: self.counts.clone(),
        })
    }

    #[cfg(test)]
    fn connection_count(&self, ip: IpAddr) -> usize {
        let counts = self.counts.lock().expect("connection tracker lock poisoned");
        counts.per_ip.get(&ip).copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn total_connections(&self) -> usize {
        self.counts
            .lock()
            .expect("connection tracker lock poisoned")
            .total
    }
}

/// RAII guard that releases a connection slot when dropped
///
/// Released even if the connection task panics or returns early.
#[derive(Debug)]
pub struct ConnectionGuard {
    ip: IpAddr,
    counts: Arc<Mutex<Counts>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().expect("connection tracker lock poisoned");
        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.per_ip.remove(&self.ip);
            }
        }
    }
}
