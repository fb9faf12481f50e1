//! Connection-oriented transport with per-peer stream reassembly.
//!
//! Every connection, accepted or dialled, gets a reader task that forwards
//! raw chunks to the peer's reassembly task (see [`peer`]). Sends reuse the
//! open connection to the endpoint or dial a new one, bounded by the
//! connect timeout, and resolve `Success` once the bytes are written.

mod connection;
mod peer;

pub use peer::PeerState;

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use self::connection::{Connection, ConnectionTable};
use self::peer::PeerTable;
use crate::codec::MessageCodec;
use crate::config::{candidate_ports, StreamConfig};
use crate::endpoint::AddressCache;
use crate::listener::{ListenerId, ListenerSet, MessageListener};
use crate::outcome::{delivery_channel, DeliveryFuture, DeliveryListener, DeliveryOutcome};
use crate::scope::SendScope;
use crate::stats::TransportStats;
use crate::{Endpoint, TideTransportError};

/// Housekeeping period of the accept loop (idle sweep).
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// TCP transport over a [`MessageCodec`].
///
/// Cloning yields another handle to the same listener and connections.
pub struct StreamTransport<C: MessageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: MessageCodec> Clone for StreamTransport<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<C: MessageCodec> {
    config: StreamConfig,
    codec: C,
    listeners: ListenerSet<C::Message>,
    stats: TransportStats,
    connections: ConnectionTable,
    peers: PeerTable,
    state: Mutex<State>,
    bind_error: AtomicBool,
    addresses: AddressCache,
}

struct State {
    running: bool,
    local_port: Option<u16>,
    scope: Arc<SendScope>,
    /// Parent of the accept loop and every connection reader.
    lifetime: CancellationToken,
    accept: Option<JoinHandle<()>>,
}

impl<C: MessageCodec> StreamTransport<C> {
    /// Bind the listening socket and start accepting.
    ///
    /// Never fails: if no candidate port can be bound the transport stays
    /// inactive and [`is_on_bind_error`](Self::is_on_bind_error) reports it.
    pub async fn bind(config: StreamConfig, codec: C) -> Self {
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                codec,
                listeners: ListenerSet::new(),
                stats: TransportStats::new(),
                connections: ConnectionTable::new(),
                peers: PeerTable::new(),
                state: Mutex::new(State {
                    running: false,
                    local_port: None,
                    scope: SendScope::new(),
                    lifetime: CancellationToken::new(),
                    accept: None,
                }),
                bind_error: AtomicBool::new(false),
                addresses: AddressCache::new(),
            }),
        };
        transport.start().await;
        transport
    }

    async fn start(&self) -> bool {
        let inner = &self.inner;
        let listener = match open_listener(&inner.config).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "stream transport could not bind");
                inner.bind_error.store(true, Ordering::Release);
                return false;
            }
        };
        inner.bind_error.store(false, Ordering::Release);
        let local_port = listener.local_addr().ok().map(|a| a.port());

        let lifetime = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(inner.clone(), listener, lifetime.clone()));

        let mut state = inner.lock_state();
        state.running = true;
        state.local_port = local_port;
        state.scope = SendScope::new();
        state.lifetime = lifetime;
        state.accept = Some(accept);
        drop(state);

        tracing::info!(port = ?local_port, "stream transport listening");
        true
    }

    /// Write one message to `to`, connecting first if needed.
    ///
    /// Resolves `Success` once written, `TimeOut` if connecting exceeds the
    /// configured bound, `Unreachable` if the peer refuses or cannot be
    /// routed to, `Error` otherwise.
    pub fn send(&self, to: &Endpoint, message: &C::Message) -> DeliveryFuture {
        let inner = &self.inner;
        let bytes = match inner.codec.encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                inner.stats.send_failures.inc();
                return DeliveryFuture::ready(TideTransportError::from(e).into());
            }
        };
        let scope = match inner.current_scope() {
            Some(scope) => scope,
            None => {
                inner.stats.send_failures.inc();
                return DeliveryFuture::ready(TideTransportError::NotRunning.into());
            }
        };

        let (promise, future) = delivery_channel();
        let inner = inner.clone();
        let to = to.clone();
        tokio::spawn(async move {
            let outcome = scope.run(inner.deliver(&to, bytes)).await;
            promise.resolve(outcome);
        });
        future
    }

    /// Send and wait for the outcome, firing `listener` once if given.
    ///
    /// Returns true iff the write completed.
    pub async fn send_message(
        &self,
        to: &Endpoint,
        message: &C::Message,
        listener: Option<&dyn DeliveryListener>,
    ) -> bool {
        let outcome = self.send(to, message).await;
        if let Some(listener) = listener {
            outcome.notify(listener);
        }
        outcome.is_success_class()
    }

    /// Dial `host:port` unless a connection is already open. Returns whether
    /// a connection is open afterwards.
    pub async fn connect_if_not_connected(&self, host: &str, port: u16) -> bool {
        if self.inner.current_scope().is_none() {
            return false;
        }
        let endpoint = Endpoint::new(host, port);
        match self.inner.connect(&endpoint).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(%endpoint, error = %e, "pre-connect failed");
                false
            }
        }
    }

    /// Whether a connection to exactly `host:port` is in the table.
    ///
    /// Accepted connections are keyed by the peer's source port, not its
    /// listening port.
    pub fn is_connection_established(&self, host: &str, port: u16) -> bool {
        self.inner.connections.contains(&Endpoint::new(host, port))
    }

    pub fn get_active_number_of_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of live per-peer connection states.
    pub fn active_peer_states(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peer_states(&self) -> Vec<PeerState> {
        self.inner.peers.states()
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener<C::Message>>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Close the listener and every connection, tear down all connection
    /// states and resolve every outstanding send.
    pub async fn stop(&self) {
        let accept = {
            let mut state = self.inner.lock_state();
            state.running = false;
            state.local_port = None;
            state.scope.close(false);
            state.scope = SendScope::new();
            state.lifetime.cancel();
            state.lifetime = CancellationToken::new();
            state.accept.take()
        };
        let closed = self.inner.connections.clear();
        self.inner.stats.open_connections.set(0);
        let states = self.inner.peers.clear();
        self.inner.addresses.clear();
        if let Some(accept) = accept {
            let _ = accept.await;
            tracing::info!(closed, states, "stream transport stopped");
        }
    }

    /// Rebind after [`stop`](Self::stop) or a bind error. Returns false if
    /// the transport is already running or binding failed again.
    pub async fn restart(&self) -> bool {
        if self.is_running() {
            return false;
        }
        self.start().await
    }

    /// Drop in-flight sends and all connection states. The listening socket
    /// and open connections stay up.
    pub fn purge(&self) {
        {
            let mut state = self.inner.lock_state();
            state.scope.close(true);
            state.scope = SendScope::new();
        }
        let states = self.inner.peers.clear();
        tracing::debug!(states, "stream transport purged");
    }

    pub fn is_on_bind_error(&self) -> bool {
        self.inner.bind_error.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn is_running_normally(&self) -> bool {
        self.is_running() && !self.is_on_bind_error()
    }

    /// Port actually listened on, which may differ from the configured one.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.lock_state().local_port
    }

    pub fn stats(&self) -> &TransportStats {
        &self.inner.stats
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }
}

impl<C: MessageCodec> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_scope(&self) -> Option<Arc<SendScope>> {
        let state = self.lock_state();
        state.running.then(|| state.scope.clone())
    }

    async fn deliver(self: &Arc<Self>, to: &Endpoint, bytes: Bytes) -> DeliveryOutcome {
        let connection = match self.connect(to).await {
            Ok(connection) => connection,
            Err(e) => {
                self.stats.send_failures.inc();
                tracing::debug!(endpoint = %to, error = %e, "connect failed");
                return e.into();
            }
        };
        match connection.write(&bytes).await {
            Ok(()) => {
                self.stats.record_sent(bytes.len());
                tracing::trace!(endpoint = %to, bytes = bytes.len(), "message written");
                DeliveryOutcome::success()
            }
            Err(source) => {
                self.stats.send_failures.inc();
                if self.connections.remove_if(to, connection.id()).is_some() {
                    self.stats.open_connections.dec();
                }
                connection.close();
                tracing::debug!(endpoint = %to, error = %source, "write failed, connection evicted");
                TideTransportError::Write {
                    endpoint: to.clone(),
                    source,
                }
                .into()
            }
        }
    }

    /// Open connection to `to`, dialling if there is none.
    async fn connect(
        self: &Arc<Self>,
        to: &Endpoint,
    ) -> Result<Arc<Connection>, TideTransportError> {
        if let Some(connection) = self.connections.get(to) {
            return Ok(connection);
        }
        let addr = self.addresses.resolve(to).await?;
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(classify_connect_error(to, source, timeout)),
            Err(_) => {
                return Err(TideTransportError::ConnectTimeout {
                    endpoint: to.clone(),
                    millis: timeout.as_millis() as u64,
                })
            }
        };
        tracing::debug!(endpoint = %to, "connected");
        self.register(to.clone(), stream).ok_or(TideTransportError::NotRunning)
    }

    /// Put a fresh connection in the table and start its reader. If one
    /// already exists for `endpoint` the new stream is dropped and the
    /// existing connection returned. `None` once the transport stopped.
    fn register(
        self: &Arc<Self>,
        endpoint: Endpoint,
        stream: TcpStream,
    ) -> Option<Arc<Connection>> {
        let lifetime = {
            let state = self.lock_state();
            if !state.running {
                return None;
            }
            state.lifetime.child_token()
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(%endpoint, error = %e, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (connection, inserted) = self.connections.insert(endpoint.clone(), writer, lifetime);
        if inserted {
            self.stats.open_connections.inc();
            tokio::spawn(read_loop(self.clone(), endpoint, reader, connection.clone()));
        }
        Some(connection)
    }

    fn sweep_idle(&self) {
        for (endpoint, connection) in self.connections.idle(self.config.idle_timeout) {
            tracing::debug!(%endpoint, "closing idle connection");
            connection.close();
        }
    }
}

fn classify_connect_error(
    endpoint: &Endpoint,
    source: std::io::Error,
    timeout: Duration,
) -> TideTransportError {
    match source.kind() {
        ErrorKind::TimedOut => TideTransportError::ConnectTimeout {
            endpoint: endpoint.clone(),
            millis: timeout.as_millis() as u64,
        },
        ErrorKind::ConnectionRefused
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::AddrNotAvailable => TideTransportError::Unreachable {
            endpoint: endpoint.clone(),
            source,
        },
        _ => TideTransportError::Connect {
            endpoint: endpoint.clone(),
            source,
        },
    }
}

async fn open_listener(config: &StreamConfig) -> Result<TcpListener, TideTransportError> {
    let mut last_error = None;
    for port in candidate_ports(config.bind_port, config.port_attempts) {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                if port != config.bind_port {
                    tracing::info!(
                        configured = config.bind_port,
                        port,
                        "configured port taken, bound next one"
                    );
                }
                return Ok(listener);
            }
            Err(source) => {
                tracing::debug!(port, error = %source, "tcp bind attempt failed");
                last_error = Some(TideTransportError::Bind { port, source });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        TideTransportError::InvalidConfig(format!("no usable port from {}", config.bind_port))
    }))
}

async fn accept_loop<C: MessageCodec>(
    inner: Arc<Inner<C>>,
    listener: TcpListener,
    lifetime: CancellationToken,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let endpoint = Endpoint::from(addr);
                    tracing::debug!(%endpoint, "accepted connection");
                    inner.register(endpoint, stream);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = sweep.tick() => inner.sweep_idle(),
        }
    }
    tracing::debug!("accept loop exited");
}

/// Reader for one connection. Exits on EOF, read error, idle close or
/// transport shutdown, then signals end-of-stream for the endpoint.
async fn read_loop<C: MessageCodec>(
    inner: Arc<Inner<C>>,
    endpoint: Endpoint,
    mut reader: OwnedReadHalf,
    connection: Arc<Connection>,
) {
    let closer = connection.closer().clone();
    let mut buf = vec![0u8; inner.config.read_chunk_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                tracing::debug!(%endpoint, "peer closed connection");
                break;
            }
            Ok(n) => {
                connection.touch();
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                inner.peers.feed(&inner, &endpoint, chunk, &closer).await;
            }
            Err(e) => {
                tracing::debug!(%endpoint, error = %e, "read failed");
                break;
            }
        }
    }
    connection.close();
    if inner.connections.remove_if(&endpoint, connection.id()).is_some() {
        inner.stats.open_connections.dec();
    }
    inner.peers.end_of_stream(&endpoint).await;
}
