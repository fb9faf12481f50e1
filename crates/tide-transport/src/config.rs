use std::net::Ipv4Addr;
use std::time::Duration;

/// Default datagram port.
pub const DEFAULT_UDP_PORT: u16 = 6001;

/// Default stream listening port.
pub const DEFAULT_TCP_PORT: u16 = 7011;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// How a [`DatagramTransport`](crate::DatagramTransport) binds its socket.
/// Exactly one mode is active per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Unicast,
    Broadcast,
    /// Join the given IPv4 multicast group on the bound port.
    Multicast(Ipv4Addr),
}

/// Configuration for a [`DatagramTransport`](crate::DatagramTransport).
///
/// ```rust
/// use tide_transport::{BindMode, DatagramConfig};
///
/// let config = DatagramConfig::new()
///     .bind_port(6001)
///     .mode(BindMode::Multicast("224.0.75.69".parse().unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub(crate) bind_port: u16,
    pub(crate) mode: BindMode,
    pub(crate) max_datagram_size: usize,
    pub(crate) port_attempts: u16,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramConfig {
    /// Defaults, with the bind port taken from `TIDE_UDP_PORT` when set.
    pub fn new() -> Self {
        Self {
            bind_port: port_from_env("TIDE_UDP_PORT").unwrap_or(DEFAULT_UDP_PORT),
            mode: BindMode::Unicast,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            port_attempts: 10,
        }
    }

    /// Port to bind; 0 lets the OS pick one.
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn mode(mut self, mode: BindMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_datagram_size(mut self, bytes: usize) -> Self {
        self.max_datagram_size = bytes.min(MAX_DATAGRAM_SIZE);
        self
    }

    /// Consecutive ports tried when the configured one is taken (default 10).
    pub fn port_attempts(mut self, attempts: u16) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }
}

/// Configuration for a [`StreamTransport`](crate::StreamTransport).
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub(crate) bind_port: u16,
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) read_chunk_size: usize,
    pub(crate) peer_queue: usize,
    pub(crate) port_attempts: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConfig {
    /// Defaults, with the bind port taken from `TIDE_TCP_PORT` when set.
    pub fn new() -> Self {
        Self {
            bind_port: port_from_env("TIDE_TCP_PORT").unwrap_or(DEFAULT_TCP_PORT),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(20),
            read_chunk_size: 65506,
            peer_queue: 64,
            port_attempts: 10,
        }
    }

    /// Port to listen on; 0 lets the OS pick one.
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// Upper bound on connection establishment (default 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connections silent for this long are closed (default 20 s).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes.max(1);
        self
    }

    /// Chunks buffered per peer before the connection reader waits.
    pub fn peer_queue(mut self, capacity: usize) -> Self {
        self.peer_queue = capacity.max(1);
        self
    }

    pub fn port_attempts(mut self, attempts: u16) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }
}

fn port_from_env(var: &str) -> Option<u16> {
    std::env::var(var).ok().and_then(|s| s.trim().parse().ok())
}

/// Ports to try in order, starting at `port`. Port 0 is a single attempt.
pub(crate) fn candidate_ports(port: u16, attempts: u16) -> impl Iterator<Item = u16> {
    let count = if port == 0 { 1 } else { attempts.max(1) };
    (0..count).filter_map(move |i| port.checked_add(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_ports_walk_upwards() {
        let ports: Vec<u16> = candidate_ports(6001, 3).collect();
        assert_eq!(ports, vec![6001, 6002, 6003]);
    }

    #[test]
    fn ephemeral_port_is_single_attempt() {
        let ports: Vec<u16> = candidate_ports(0, 10).collect();
        assert_eq!(ports, vec![0]);
    }

    #[test]
    fn candidate_ports_stop_at_u16_max() {
        let ports: Vec<u16> = candidate_ports(65534, 5).collect();
        assert_eq!(ports, vec![65534, 65535]);
    }

    #[test]
    fn builder_clamps() {
        let c = DatagramConfig::new().max_datagram_size(1 << 20).port_attempts(0);
        assert_eq!(c.max_datagram_size, MAX_DATAGRAM_SIZE);
        assert_eq!(c.port_attempts, 1);
        let s = StreamConfig::new().peer_queue(0).read_chunk_size(0);
        assert_eq!(s.peer_queue, 1);
        assert_eq!(s.read_chunk_size, 1);
    }
}
