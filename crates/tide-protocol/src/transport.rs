use bytes::Bytes;
use tide_transport::{
    DatagramTransport, Decoded, DeliveryOutcome, Endpoint, Frame, FrameCodec, MessageCodec,
    StreamTransport, TideTransportError, TransportKind,
};

use crate::envelope::RelayEnvelope;
use crate::error::TideProtocolError;
use crate::types::DirectRoute;

/// Network seam of the router.
///
/// In production: [`TransportPair`] over the tide datagram and stream
/// transports. In tests: `MockTransport` (records every send).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Message: Send + Sync;

    /// Deliver straight to the destination's own endpoint.
    async fn send_direct(&self, route: &DirectRoute, message: &Self::Message) -> DeliveryOutcome;

    /// Hand an envelope to a relay over the `kind` transport.
    async fn send_relay(
        &self,
        relay: &Endpoint,
        kind: TransportKind,
        envelope: &RelayEnvelope,
    ) -> DeliveryOutcome;

    /// Wire form of `message`, as carried inside a relay envelope.
    fn encode(&self, message: &Self::Message) -> Result<Bytes, TideProtocolError>;

    fn decode(&self, bytes: &[u8]) -> Option<Self::Message>;

    /// Whether an established connection already backs `route`.
    fn is_connected(&self, route: &DirectRoute) -> bool;
}

// ── TransportPair (production) ──────────────────────────────────────

/// Datagram plus stream transport sharing the frame codec.
#[derive(Clone)]
pub struct TransportPair {
    datagram: DatagramTransport<FrameCodec>,
    stream: StreamTransport<FrameCodec>,
}

impl TransportPair {
    pub fn new(
        datagram: DatagramTransport<FrameCodec>,
        stream: StreamTransport<FrameCodec>,
    ) -> Self {
        Self { datagram, stream }
    }

    pub fn datagram(&self) -> &DatagramTransport<FrameCodec> {
        &self.datagram
    }

    pub fn stream(&self) -> &StreamTransport<FrameCodec> {
        &self.stream
    }

    pub async fn stop(&self) {
        self.datagram.stop().await;
        self.stream.stop().await;
    }

    async fn send_frame(
        &self,
        kind: TransportKind,
        to: &Endpoint,
        frame: &Frame,
    ) -> DeliveryOutcome {
        match kind {
            TransportKind::Datagram => self.datagram.send(to, frame).await,
            TransportKind::Stream => self.stream.send(to, frame).await,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TransportPair {
    type Message = Frame;

    async fn send_direct(&self, route: &DirectRoute, message: &Frame) -> DeliveryOutcome {
        self.send_frame(route.kind, &route.endpoint, message).await
    }

    async fn send_relay(
        &self,
        relay: &Endpoint,
        kind: TransportKind,
        envelope: &RelayEnvelope,
    ) -> DeliveryOutcome {
        match envelope.to_frame() {
            Ok(frame) => self.send_frame(kind, relay, &frame).await,
            Err(e) => DeliveryOutcome::error(e),
        }
    }

    fn encode(&self, message: &Frame) -> Result<Bytes, TideProtocolError> {
        self.stream
            .codec()
            .encode(message)
            .map_err(|e| TideTransportError::from(e).into())
    }

    fn decode(&self, bytes: &[u8]) -> Option<Frame> {
        match self.stream.codec().decode_one(bytes) {
            Ok(Decoded::Message { message, .. }) => Some(message),
            _ => None,
        }
    }

    fn is_connected(&self, route: &DirectRoute) -> bool {
        match route.kind {
            TransportKind::Stream => self
                .stream
                .is_connection_established(route.endpoint.host(), route.endpoint.port()),
            TransportKind::Datagram => false,
        }
    }
}

// ── MockTransport (tests) ───────────────────────────────────────────
