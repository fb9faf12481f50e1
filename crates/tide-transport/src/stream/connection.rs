//! Connection table of the stream transport.
//!
//! Holds the write half of every open connection, inbound or outbound,
//! keyed by peer endpoint. Read halves live in the reader tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Endpoint;

/// One open TCP connection.
pub(crate) struct Connection {
    id: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_activity: Mutex<Instant>,
    /// Cancelling stops the reader task, which closes the connection.
    closer: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Write one encoded message. Writes on the same connection are
    /// serialized so frames never interleave.
    pub async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        drop(writer);
        self.touch();
        Ok(())
    }

    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Open connections keyed by peer endpoint.
///
/// Lookups and inserts take a short std lock; connecting and writing happen
/// outside it, so different peers never wait on each other.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    next_id: AtomicU64,
    connections: Mutex<HashMap<Endpoint, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.lock().get(endpoint).cloned()
    }

    /// Register a connection unless one already exists for `endpoint`.
    ///
    /// Returns the connection now in the table and whether it is the new
    /// one. A losing `writer` is dropped, closing that socket half.
    pub fn insert(
        &self,
        endpoint: Endpoint,
        writer: OwnedWriteHalf,
        closer: CancellationToken,
    ) -> (Arc<Connection>, bool) {
        let mut connections = self.lock();
        if let Some(existing) = connections.get(&endpoint) {
            return (existing.clone(), false);
        }
        let connection = Arc::new(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(writer),
            last_activity: Mutex::new(Instant::now()),
            closer,
        });
        connections.insert(endpoint, connection.clone());
        (connection, true)
    }

    /// Remove `endpoint` only if it still maps to connection `id`, so a
    /// stale reader never evicts a newer connection.
    pub fn remove_if(&self, endpoint: &Endpoint, id: u64) -> Option<Arc<Connection>> {
        let mut connections = self.lock();
        match connections.get(endpoint) {
            Some(conn) if conn.id == id => connections.remove(endpoint),
            _ => None,
        }
    }

    /// Connections without read or write activity for at least `timeout`.
    pub fn idle(&self, timeout: Duration) -> Vec<(Endpoint, Arc<Connection>)> {
        self.lock()
            .iter()
            .filter(|(_, conn)| conn.idle_for() >= timeout)
            .map(|(ep, conn)| (ep.clone(), conn.clone()))
            .collect()
    }

    /// Empty the table, closing every connection.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, conn) in &drained {
            conn.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.lock().contains_key(endpoint)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
