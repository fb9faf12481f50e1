//! Per-peer connection state: one reassembly task per endpoint.
//!
//! Connection readers push raw chunks here; the peer task owns the
//! [`Reassembler`] for that endpoint and is the only code touching it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::codec::MessageCodec;
use crate::listener::ReceptionEvent;
use crate::reassembly::Reassembler;
use crate::{Endpoint, TransportKind};

pub(crate) enum PeerInput {
    Chunk(Bytes),
    EndOfStream,
}

struct PeerHandle {
    tx: mpsc::Sender<PeerInput>,
    cancel: CancellationToken,
}

/// Live connection states keyed by endpoint. At most one per endpoint.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: Mutex<HashMap<Endpoint, PeerHandle>>,
}

/// Snapshot of one live connection state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PeerState {
    pub endpoint: Endpoint,
    /// Chunks queued for reassembly but not yet consumed.
    pub queued_chunks: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a chunk to the endpoint's reassembly task, creating the state on
    /// first contact. Waits when the peer queue is full.
    ///
    /// `reader` is the feeding connection's lifetime; once it is cancelled
    /// no new state is created, so a torn-down table stays empty.
    pub async fn feed<C: MessageCodec>(
        &self,
        inner: &Arc<Inner<C>>,
        endpoint: &Endpoint,
        chunk: Bytes,
        reader: &CancellationToken,
    ) {
        let tx = {
            let mut peers = self.lock();
            if reader.is_cancelled() {
                return;
            }
            match peers.get(endpoint) {
                Some(handle) if !handle.tx.is_closed() => handle.tx.clone(),
                _ => {
                    let handle = self.spawn(inner, endpoint.clone());
                    let tx = handle.tx.clone();
                    peers.insert(endpoint.clone(), handle);
                    tx
                }
            }
        };
        if tx.send(PeerInput::Chunk(chunk)).await.is_err() {
            tracing::trace!(%endpoint, "peer state closed while feeding");
        }
    }

    /// The endpoint's stream ended: detach its state and let the task drain
    /// what it has, then exit.
    pub async fn end_of_stream(&self, endpoint: &Endpoint) {
        let handle = self.lock().remove(endpoint);
        if let Some(handle) = handle {
            let _ = handle.tx.send(PeerInput::EndOfStream).await;
        }
    }

    /// Tear down every state without draining.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn states(&self) -> Vec<PeerState> {
        self.lock()
            .iter()
            .map(|(endpoint, handle)| PeerState {
                endpoint: endpoint.clone(),
                queued_chunks: handle.tx.max_capacity() - handle.tx.capacity(),
            })
            .collect()
    }

    fn spawn<C: MessageCodec>(&self, inner: &Arc<Inner<C>>, endpoint: Endpoint) -> PeerHandle {
        let (tx, rx) = mpsc::channel(inner.config.peer_queue);
        let cancel = CancellationToken::new();
        inner.stats.peer_states.inc();
        tracing::debug!(%endpoint, "connection state created");
        tokio::spawn(reassemble(inner.clone(), endpoint, rx, cancel.clone()));
        PeerHandle { tx, cancel }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, PeerHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reassembly task for one endpoint. Suspends on the queue while there is
/// nothing to decode.
async fn reassemble<C: MessageCodec>(
    inner: Arc<Inner<C>>,
    endpoint: Endpoint,
    mut rx: mpsc::Receiver<PeerInput>,
    cancel: CancellationToken,
) {
    let mut reassembler = Reassembler::new();
    loop {
        let input = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            input = rx.recv() => input,
        };
        match input {
            Some(PeerInput::Chunk(chunk)) => {
                reassembler.push(&chunk);
                let discarded_before = reassembler.discarded();
                while let Some((frame, message)) = reassembler.next_message(&inner.codec) {
                    inner.stats.record_received(frame.len());
                    let event = ReceptionEvent::new(endpoint.clone(), frame, TransportKind::Stream);
                    let failures = inner.listeners.dispatch(&event, &message);
                    inner.stats.listener_failures.add(failures as u64);
                }
                let discarded = reassembler.discarded() - discarded_before;
                if discarded > 0 {
                    inner.stats.bytes_discarded.add(discarded);
                    inner.stats.decode_failures.inc();
                }
            }
            Some(PeerInput::EndOfStream) | None => {
                if reassembler.buffered() > 0 {
                    tracing::debug!(
                        %endpoint,
                        leftover = reassembler.buffered(),
                        "stream ended inside a message"
                    );
                }
                let mut event =
                    ReceptionEvent::new(endpoint.clone(), Bytes::new(), TransportKind::Stream);
                event.is_end_of_stream = true;
                let failures = inner.listeners.dispatch_end_of_stream(&event);
                inner.stats.listener_failures.add(failures as u64);
                break;
            }
        }
    }
    inner.stats.peer_states.dec();
    tracing::debug!(%endpoint, "connection state released");
}
