//! Connection registry
//!
//! Owns the set of live physical connections and decides which ones are
//! admitted. Admission checks the blacklist and the connection ceilings;
//! a rejected connection never reaches the multiplexer.
//!
//! Each admitted connection gets a oneshot close signal so the registry can
//! end it without holding locks across I/O: the connection task selects on
//! the signal alongside its reads.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::blacklist::{Blacklist, current_timestamp, normalize_ip};
use crate::connection_tracker::{ConnectionGuard, ConnectionTracker, LimitKind};
use crate::db::BlacklistDb;
use crate::db::blacklist::BlacklistKind;

/// Unique identifier for a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection was refused
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("address {0} is blacklisted")]
    Blacklisted(IpAddr),

    #[error("connection limit reached for {0} ({1:?})")]
    LimitReached(IpAddr, LimitKind),

    #[error("server is shutting down")]
    ShuttingDown,
}

struct ConnectionEntry {
    peer_addr: Option<SocketAddr>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl ConnectionEntry {
    /// Send the close signal (takes ownership of the sender)
    ///
    /// Returns true if a signal was sent, false if already sent.
    fn signal_close(&mut self) -> bool {
        match self.close_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Process-wide registry of physical connections
///
/// Constructed once at startup and shared by `Arc`.
pub struct ConnectionRegistry {
    blacklist: RwLock<Blacklist>,
    tracker: ConnectionTracker,
    store: BlacklistDb,
    blacklist_duration: Duration,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry
    ///
    /// `blacklist_duration` is how long addresses added by
    /// [`blacklist_and_close`](Self::blacklist_and_close) stay blacklisted.
    pub fn new(
        blacklist: Blacklist,
        tracker: ConnectionTracker,
        store: BlacklistDb,
        blacklist_duration: Duration,
    ) -> Self {
        Self {
            blacklist: RwLock::new(blacklist),
            tracker,
            store,
            blacklist_duration,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Admit or reject a new connection
    ///
    /// `peer` is the result of looking up the remote address. A failed
    /// lookup is not a reason to reject: such a connection is never
    /// blacklisted by address and shares the connection-limit bucket of the
    /// unspecified address.
    ///
    /// On success the returned handle holds the connection slot and
    /// unregisters the connection when dropped.
    pub fn admit(
        self: &Arc<Self>,
        peer: io::Result<SocketAddr>,
    ) -> Result<AdmittedConnection, AdmissionError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown);
        }

        let peer_addr = match peer {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!(error = %e, "peer address unavailable");
                None
            }
        };

        if self.is_blacklisted(peer_addr) {
            let ip = peer_addr.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |a| a.ip());
            return Err(AdmissionError::Blacklisted(normalize_ip(ip)));
        }

        let bucket = peer_addr.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |a| normalize_ip(a.ip()));
        let slot = self
            .tracker
            .try_acquire(bucket)
            .map_err(|kind| AdmissionError::LimitReached(bucket, kind))?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (close_tx, close_rx) = oneshot::channel();

        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .insert(
                id,
                ConnectionEntry {
                    peer_addr,
                    close_tx: Some(close_tx),
                },
            );

        Ok(AdmittedConnection {
            id,
            peer_addr,
            registry: Arc::clone(self),
            close_rx: Some(close_rx),
            _slot: slot,
        })
    }

    /// Whether a peer address is blacklisted
    ///
    /// Never fails: an unresolved address (`None`) is not blacklisted.
    pub fn is_blacklisted(&self, peer: Option<SocketAddr>) -> bool {
        let Some(addr) = peer else {
            return false;
        };
        let ip = addr.ip();

        // Read lock for the common case; write lock only to drop expired entries
        let blacklist = self.blacklist.read().expect("blacklist lock poisoned");
        if blacklist.needs_rebuild() {
            drop(blacklist);
            self.blacklist
                .write()
                .expect("blacklist lock poisoned")
                .is_address_blacklisted(ip)
        } else {
            blacklist.is_address_blacklisted_read_only(ip)
        }
    }

    /// Whether a host identifier is blacklisted
    pub fn is_host_blacklisted(&self, host_id: &str) -> bool {
        self.blacklist
            .read()
            .expect("blacklist lock poisoned")
            .is_host_blacklisted(host_id)
    }

    /// Blacklist an address for the configured duration and close its
    /// live connections
    ///
    /// The entry is persisted first, then added to the in-memory set.
    /// Returns the number of connections signalled.
    pub async fn blacklist_and_close(&self, ip: IpAddr, reason: &str) -> Result<usize, sqlx::Error> {
        let ip = normalize_ip(ip);
        let value = ip.to_string();
        let expires_at = current_timestamp() + self.blacklist_duration.as_secs() as i64;

        self.store
            .upsert(BlacklistKind::Address, &value, Some(reason), Some(expires_at))
            .await?;
        self.blacklist
            .write()
            .expect("blacklist lock poisoned")
            .add_address(&value, Some(expires_at));

        let closed = self.close_matching(|entry| {
            entry.peer_addr.is_some_and(|addr| normalize_ip(addr.ip()) == ip)
        });
        info!(%ip, reason, closed, "address blacklisted");
        Ok(closed)
    }

    /// Stop admitting connections and signal every live one to close
    ///
    /// Returns the number of connections signalled.
    pub fn close_all(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        self.close_matching(|_| true)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .len()
    }

    fn close_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ConnectionEntry) -> bool,
    {
        let mut connections = self
            .connections
            .lock()
            .expect("connection registry lock poisoned");

        let mut count = 0;
        for entry in connections.values_mut() {
            if predicate(entry) && entry.signal_close() {
                count += 1;
            }
        }
        count
    }

    fn unregister(&self, id: ConnectionId) {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .remove(&id);
    }
}

/// An admitted connection
///
/// Holds the connection slot and the registry entry; both are released when
/// this is dropped, even if the connection task returns early.
pub struct AdmittedConnection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    registry: Arc<ConnectionRegistry>,
    close_rx: Option<oneshot::Receiver<()>>,
    _slot: ConnectionGuard,
}

impl AdmittedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Take the receiver that fires when the registry closes this connection
    ///
    /// Returns `None` if already taken.
    pub fn take_close_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.close_rx.take()
    }
}

impl Drop for AdmittedConnection {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

impl fmt::Debug for AdmittedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmittedConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
