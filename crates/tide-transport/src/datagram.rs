//! Connectionless transport: one-shot sends, fan-out receive.
//!
//! A single receiver task per bound socket decodes each datagram on its own
//! (no reassembly across datagrams) and dispatches it to the listeners.
//! Sends resolve to `Uncertain` at best: a datagram that left the socket
//! carries no delivery confirmation.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Decoded, MessageCodec};
use crate::config::{candidate_ports, BindMode, DatagramConfig};
use crate::endpoint::AddressCache;
use crate::listener::{ListenerId, ListenerSet, MessageListener, ReceptionEvent};
use crate::outcome::{delivery_channel, DeliveryFuture, DeliveryListener, DeliveryOutcome};
use crate::scope::SendScope;
use crate::stats::TransportStats;
use crate::{Endpoint, TideTransportError, TransportKind};

/// Receive buffer; one byte above the largest IPv4 UDP payload.
const RECV_BUFFER: usize = 65536;

/// UDP transport over a [`MessageCodec`].
///
/// Cloning yields another handle to the same socket and listener set.
pub struct DatagramTransport<C: MessageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: MessageCodec> Clone for DatagramTransport<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: MessageCodec> {
    config: DatagramConfig,
    codec: C,
    listeners: ListenerSet<C::Message>,
    stats: TransportStats,
    state: Mutex<State>,
    bind_error: AtomicBool,
    addresses: AddressCache,
    multicast_active: AtomicBool,
    broadcast_active: AtomicBool,
}

struct State {
    socket: Option<Arc<UdpSocket>>,
    local_port: Option<u16>,
    scope: Arc<SendScope>,
    receiver_cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

impl<C: MessageCodec> DatagramTransport<C> {
    /// Bind the socket and start the receiver task.
    ///
    /// Never fails: if no candidate port can be bound the transport stays
    /// inactive and [`is_on_bind_error`](Self::is_on_bind_error) reports it.
    pub async fn bind(config: DatagramConfig, codec: C) -> Self {
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                codec,
                listeners: ListenerSet::new(),
                stats: TransportStats::new(),
                state: Mutex::new(State {
                    socket: None,
                    local_port: None,
                    scope: SendScope::new(),
                    receiver_cancel: CancellationToken::new(),
                    receiver: None,
                }),
                bind_error: AtomicBool::new(false),
                addresses: AddressCache::new(),
                multicast_active: AtomicBool::new(false),
                broadcast_active: AtomicBool::new(false),
            }),
        };
        transport.start().await;
        transport
    }

    async fn start(&self) -> bool {
        let inner = &self.inner;
        let socket = match open_socket(&inner.config).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                tracing::warn!(error = %e, "datagram transport could not bind");
                inner.bind_error.store(true, Ordering::Release);
                return false;
            }
        };
        inner.bind_error.store(false, Ordering::Release);
        self.apply_mode(&socket);

        let local_port = socket.local_addr().ok().map(|a| a.port());
        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(inner.clone(), socket.clone(), cancel.clone()));

        let mut state = inner.lock_state();
        state.socket = Some(socket);
        state.local_port = local_port;
        state.scope = SendScope::new();
        state.receiver_cancel = cancel;
        state.receiver = Some(receiver);
        drop(state);

        tracing::info!(port = ?local_port, mode = ?inner.config.mode, "datagram transport bound");
        true
    }

    fn apply_mode(&self, socket: &UdpSocket) {
        let inner = &self.inner;
        inner.multicast_active.store(false, Ordering::Release);
        inner.broadcast_active.store(false, Ordering::Release);
        match inner.config.mode {
            BindMode::Unicast => {}
            BindMode::Broadcast => match socket.set_broadcast(true) {
                Ok(()) => inner.broadcast_active.store(true, Ordering::Release),
                Err(e) => tracing::warn!(error = %e, "could not enable broadcast"),
            },
            BindMode::Multicast(group) => {
                let joined = socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .and_then(|()| socket.set_multicast_loop_v4(true));
                match joined {
                    Ok(()) => inner.multicast_active.store(true, Ordering::Release),
                    Err(e) => tracing::warn!(%group, error = %e, "could not join multicast group"),
                }
            }
        }
    }

    /// Send one message as a single datagram.
    ///
    /// The returned future resolves to `Uncertain` once the datagram left the
    /// local socket, or `Error` on any local failure.
    pub fn send(&self, to: &Endpoint, message: &C::Message) -> DeliveryFuture {
        let inner = &self.inner;
        let bytes = match inner.codec.encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                inner.stats.send_failures.inc();
                return DeliveryFuture::ready(TideTransportError::from(e).into());
            }
        };
        if bytes.len() > inner.config.max_datagram_size {
            inner.stats.send_failures.inc();
            return DeliveryFuture::ready(
                TideTransportError::MessageTooLarge {
                    size: bytes.len(),
                    max: inner.config.max_datagram_size,
                }
                .into(),
            );
        }

        let (socket, scope) = {
            let state = inner.lock_state();
            match &state.socket {
                Some(socket) => (socket.clone(), state.scope.clone()),
                None => {
                    inner.stats.send_failures.inc();
                    return DeliveryFuture::ready(TideTransportError::NotRunning.into());
                }
            }
        };

        let (promise, future) = delivery_channel();
        let inner = inner.clone();
        let to = to.clone();
        tokio::spawn(async move {
            let outcome = scope.run(inner.write_datagram(&socket, &to, bytes)).await;
            promise.resolve(outcome);
        });
        future
    }

    /// Send and wait for the outcome, firing `listener` once if given.
    ///
    /// Returns true iff the datagram left the local socket.
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

    pub fn add_listener(&self, listener: Arc<dyn MessageListener<C::Message>>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Close the socket and resolve every outstanding send.
    pub async fn stop(&self) {
        let receiver = {
            let mut state = self.inner.lock_state();
            state.scope.close(false);
            state.scope = SendScope::new();
            state.receiver_cancel.cancel();
            state.socket = None;
            state.local_port = None;
            state.receiver.take()
        };
        if let Some(receiver) = receiver {
            let _ = receiver.await;
            tracing::info!("datagram transport stopped");
        }
        self.inner.multicast_active.store(false, Ordering::Release);
        self.inner.broadcast_active.store(false, Ordering::Release);
        self.inner.addresses.clear();
    }

    /// Rebind after [`stop`](Self::stop) or a bind error. Returns false if
    /// the transport is already running or binding failed again.
    pub async fn restart(&self) -> bool {
        if self.is_running() {
            return false;
        }
        self.start().await
    }

    /// Drop in-flight sends without closing the socket.
    pub fn purge(&self) {
        let mut state = self.inner.lock_state();
        state.scope.close(true);
        state.scope = SendScope::new();
        tracing::debug!("datagram transport purged");
    }

    pub fn is_on_bind_error(&self) -> bool {
        self.inner.bind_error.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().socket.is_some()
    }

    /// Running on a socket configured as requested.
    pub fn is_running_normally(&self) -> bool {
        if !self.is_running() || self.is_on_bind_error() {
            return false;
        }
        match self.inner.config.mode {
            BindMode::Unicast => true,
            BindMode::Broadcast => self.is_broadcast_active(),
            BindMode::Multicast(_) => self.is_multicast_active(),
        }
    }

    pub fn is_multicast_active(&self) -> bool {
        self.inner.multicast_active.load(Ordering::Acquire)
    }

    pub fn is_broadcast_active(&self) -> bool {
        self.inner.broadcast_active.load(Ordering::Acquire)
    }

    /// Port actually bound, which may differ from the configured one.
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

    async fn write_datagram(
        &self,
        socket: &UdpSocket,
        to: &Endpoint,
        bytes: Bytes,
    ) -> DeliveryOutcome {
        let result = match self.addresses.resolve(to).await {
            Ok(addr) => socket
                .send_to(&bytes, addr)
                .await
                .map_err(|source| TideTransportError::Write {
                    endpoint: to.clone(),
                    source,
                }),
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => {
                self.stats.record_sent(written);
                tracing::trace!(endpoint = %to, bytes = written, "datagram sent");
                DeliveryOutcome::uncertain("datagram sent; no delivery confirmation on udp")
            }
            Err(e) => {
                self.stats.send_failures.inc();
                tracing::debug!(endpoint = %to, error = %e, "datagram send failed");
                DeliveryOutcome::error(e)
            }
        }
    }

    fn handle_datagram(&self, source: SocketAddr, datagram: &[u8]) {
        self.stats.record_received(datagram.len());
        let source = Endpoint::from(source);
        match self.codec.decode_one(datagram) {
            Ok(Decoded::Message { message, consumed }) => {
                let consumed = consumed.min(datagram.len());
                if consumed < datagram.len() {
                    tracing::debug!(
                        %source,
                        trailing = datagram.len() - consumed,
                        "ignoring trailing bytes after message"
                    );
                }
                let event = ReceptionEvent::new(
                    source,
                    Bytes::copy_from_slice(&datagram[..consumed]),
                    TransportKind::Datagram,
                );
                let failures = self.listeners.dispatch(&event, &message);
                self.stats.listener_failures.add(failures as u64);
            }
            Ok(Decoded::NeedMoreData) => {
                self.stats.decode_failures.inc();
                tracing::debug!(%source, len = datagram.len(), "dropping truncated datagram");
            }
            Err(e) => {
                self.stats.decode_failures.inc();
                tracing::debug!(%source, error = %e, "dropping undecodable datagram");
            }
        }
    }
}

async fn open_socket(config: &DatagramConfig) -> Result<UdpSocket, TideTransportError> {
    let mut last_error = None;
    for port in candidate_ports(config.bind_port, config.port_attempts) {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => {
                if port != config.bind_port {
                    tracing::info!(
                        configured = config.bind_port,
                        port,
                        "configured port taken, bound next one"
                    );
                }
                return Ok(socket);
            }
            Err(source) => {
                tracing::debug!(port, error = %source, "udp bind attempt failed");
                last_error = Some(TideTransportError::Bind { port, source });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        TideTransportError::InvalidConfig(format!("no usable port from {}", config.bind_port))
    }))
}

async fn receive_loop<C: MessageCodec>(
    inner: Arc<Inner<C>>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => inner.handle_datagram(source, &buf[..len]),
                // ICMP errors from earlier sends surface here on some platforms.
                Err(e) => tracing::trace!(error = %e, "datagram receive error"),
            },
        }
    }
    tracing::debug!("datagram receiver exited");
}
