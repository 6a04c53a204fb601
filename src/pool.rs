//! Fixed-capacity table of client connections.
//!
//! The pool holds at most `capacity` connections in stable slots: a slot
//! index never changes for the lifetime of its connection and empty slots
//! are never compacted away. When the table is full, a new connection
//! evicts the occupant with the largest age.
//!
//! Age is charged to every occupied slot once per broadcast, whether or
//! not that slot's own write succeeded, so it approximates "broadcasts
//! survived since accept" rather than last-activity time. Eviction is
//! therefore "present the longest across broadcasts wins", not true LRU;
//! the policy is kept as deployed rather than silently upgraded.

use crate::codec::{self, ReadOutcome};
use futures::future::select_all;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Bound on one slot's write, so a stalled client cannot hold up
/// delivery to the rest of the pool.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// One TCP peer occupying a pool slot.
///
/// The slot exclusively owns the socket; it is closed exactly once, when
/// the slot is cleared (read/write failure, eviction, or shutdown).
#[derive(Debug)]
pub struct ClientConnection {
    stream: TcpStream,
    age: u64,
    peer: SocketAddr,
    // partial line carried between ticks
    line_buf: Vec<u8>,
}

impl ClientConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            age: 0,
            peer,
            line_buf: Vec::new(),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Continue reading this connection's current line. Input that
    /// arrived without its terminator is kept in the connection's buffer
    /// and picked back up on the next tick.
    pub fn read_line(&mut self, max_len: usize) -> ReadOutcome {
        codec::read_line(&self.stream, &mut self.line_buf, max_len)
    }
}

/// Outcome of [`ConnectionPool::try_insert`].
#[derive(Debug)]
pub enum Insert {
    /// An empty slot was available.
    Stored(usize),
    /// The pool was full; the previous occupant of `slot` was closed to
    /// make room.
    Evicted { slot: usize, evicted: SocketAddr },
}

/// One row of the operator-facing diagnostics dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: usize,
    pub fd: i32,
    pub age: u64,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Option<ClientConnection>>,
    max_age: u64,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_age(capacity, u64::MAX)
    }

    pub fn with_max_age(capacity: usize, max_age: u64) -> Self {
        assert!(capacity > 0, "connection pool capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, max_age }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn connection(&self, slot: usize) -> Option<&ClientConnection> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn connection_mut(&mut self, slot: usize) -> Option<&mut ClientConnection> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Store a new connection, evicting if the pool is full.
    ///
    /// The lowest-indexed empty slot is used when one exists. Otherwise
    /// the occupied slot with the largest age is closed and reused, ties
    /// going to the lowest index.
    pub fn try_insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Insert {
        if let Some(slot) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[slot] = Some(ClientConnection::new(stream, peer));
            return Insert::Stored(slot);
        }

        let mut slot = 0;
        let mut oldest = 0;
        for (i, entry) in self.slots.iter().enumerate() {
            if let Some(conn) = entry {
                if conn.age > oldest {
                    oldest = conn.age;
                    slot = i;
                }
            }
        }
        let evicted = self.slots[slot].take().map(|conn| conn.peer);
        self.slots[slot] = Some(ClientConnection::new(stream, peer));
        match evicted {
            Some(addr) => Insert::Evicted {
                slot,
                evicted: addr,
            },
            // unreachable while the pool is full, but stay total
            None => Insert::Stored(slot),
        }
    }

    /// Send `line` to every occupied slot, returning the recipient count.
    ///
    /// A failed write closes and clears only that slot; delivery to the
    /// remaining slots is unaffected. Every occupied slot is charged one
    /// tick of age before failed slots are cleared. When any occupied
    /// slot's counter would pass `max_age`, all occupied ages are
    /// decremented by one for this tick instead of incremented.
    pub async fn broadcast(&mut self, line: &[u8]) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut compress = false;

        for (slot, entry) in self.slots.iter().enumerate() {
            let Some(conn) = entry else { continue };
            match write_full(&conn.stream, line).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "broadcast write to slot {} ({}) failed: {}",
                        slot, conn.peer, e
                    );
                    failed.push(slot);
                }
            }
            if conn.age == self.max_age {
                compress = true;
            }
        }

        for conn in self.slots.iter_mut().flatten() {
            if compress {
                conn.age = conn.age.saturating_sub(1);
            } else {
                conn.age += 1;
            }
        }

        for slot in failed {
            if let Some(peer) = self.remove(slot) {
                info!("closed slot {} ({}) after write failure", slot, peer);
            }
        }

        delivered
    }

    /// Close the connection in `slot` and clear it, returning the peer
    /// address for logging.
    pub fn remove(&mut self, slot: usize) -> Option<SocketAddr> {
        self.slots
            .get_mut(slot)
            .and_then(|s| s.take())
            .map(|conn| conn.peer)
    }

    /// Read-only view of the occupied slots for the diagnostics dump.
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().map(|conn| SlotInfo {
                    slot,
                    fd: conn.stream.as_raw_fd(),
                    age: conn.age,
                    peer: conn.peer,
                })
            })
            .collect()
    }

    /// Resolve when any occupied slot's socket is readable. Pends forever
    /// while the pool is empty, leaving the event loop's poll timeout to
    /// bound the wait.
    pub async fn wait_readable(&self) {
        let watchers: Vec<_> = self
            .slots
            .iter()
            .flatten()
            .map(|conn| Box::pin(conn.stream.readable()))
            .collect();
        if watchers.is_empty() {
            std::future::pending::<()>().await;
            return;
        }
        let _ = select_all(watchers).await;
    }

    #[cfg(test)]
    fn set_age(&mut self, slot: usize, age: u64) {
        if let Some(conn) = self.slots.get_mut(slot).and_then(|s| s.as_mut()) {
            conn.age = age;
        }
    }
}

/// Write the whole buffer, waiting for the socket to become writable as
/// needed. The wait is bounded: a peer that cannot take one line within
/// the deadline has stopped reading and counts as failed.
pub(crate) async fn write_full(stream: &TcpStream, buf: &[u8]) -> io::Result<()> {
    tokio::time::timeout(WRITE_TIMEOUT, async {
        let mut written = 0;
        while written < buf.len() {
            stream.writable().await?;
            match stream.try_write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                // readiness can evaporate between the wait and the write
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}
