//! Live connection counters reported in every snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of long-lived connection being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A snapshot stream (SSE) consumer.
    Stream,
    /// A position channel (WebSocket) connection.
    Socket,
}

/// Open connection counts, updated lock-free by the gateway.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    streams: AtomicU64,
    sockets: AtomicU64,
}

impl ConnectionCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a connection until the returned guard is dropped.
    pub fn open(self: &Arc<Self>, kind: ConnectionKind) -> ConnectionGuard {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counters: Arc::clone(self),
            kind,
        }
    }

    pub fn streams(&self) -> u64 {
        self.streams.load(Ordering::Relaxed)
    }

    pub fn sockets(&self) -> u64 {
        self.sockets.load(Ordering::Relaxed)
    }

    /// All open connections; reported as `pendingConnections`.
    pub fn total(&self) -> u64 {
        self.streams() + self.sockets()
    }

    fn counter(&self, kind: ConnectionKind) -> &AtomicU64 {
        match kind {
            ConnectionKind::Stream => &self.streams,
            ConnectionKind::Socket => &self.sockets,
        }
    }
}

/// Decrements its counter on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    counters: Arc<ConnectionCounters>,
    kind: ConnectionKind,
}

impl ConnectionGuard {
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters.counter(self.kind).fetch_sub(1, Ordering::Relaxed);
    }
}
