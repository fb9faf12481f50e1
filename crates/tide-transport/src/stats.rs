use serde::Serialize;
use tide_metrics::{Counter, Gauge};

/// Live counters for one transport instance.
#[derive(Debug, Default, Serialize)]
pub struct TransportStats {
    pub messages_sent: Counter,
    pub messages_received: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub send_failures: Counter,
    /// Inbound units dropped because they did not decode.
    pub decode_failures: Counter,
    /// Bytes skipped by stream reassembly while resynchronizing.
    pub bytes_discarded: Counter,
    /// Listener callbacks that returned an error or panicked.
    pub listener_failures: Counter,
    pub open_connections: Gauge,
    pub peer_states: Gauge,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub decode_failures: u64,
    pub bytes_discarded: u64,
    pub listener_failures: u64,
    pub open_connections: u64,
    pub peer_states: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.messages_sent.inc();
        self.bytes_sent.add(bytes as u64);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.messages_received.inc();
        self.bytes_received.add(bytes as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.get(),
            messages_received: self.messages_received.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            send_failures: self.send_failures.get(),
            decode_failures: self.decode_failures.get(),
            bytes_discarded: self.bytes_discarded.get(),
            listener_failures: self.listener_failures.get(),
            open_connections: self.open_connections.get(),
            peer_states: self.peer_states.get(),
        }
    }
}
