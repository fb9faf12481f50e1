//! Tide transport layer.
//!
//! Point-to-point delivery of framed messages between endpoints, over UDP
//! datagrams or TCP streams, with a uniform asynchronous delivery outcome.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tide_transport::{
//!     DatagramConfig, DatagramTransport, Endpoint, Frame, FrameCodec, StreamConfig,
//!     StreamTransport,
//! };
//!
//! # async fn example() {
//! let udp = DatagramTransport::bind(DatagramConfig::new(), FrameCodec::new()).await;
//! let tcp = StreamTransport::bind(StreamConfig::new(), FrameCodec::new()).await;
//!
//! let peer = Endpoint::new("127.0.0.1", 7011);
//! let outcome = tcp.send(&peer, &Frame::new(1, "hello")).await;
//! println!("delivery: {:?}", outcome.result());
//!
//! udp.stop().await;
//! tcp.stop().await;
//! # }
//! ```

mod codec;
mod config;
mod datagram;
mod endpoint;
mod error;
mod listener;
mod outcome;
mod reassembly;
mod scope;
mod stats;
mod stream;

pub use codec::{
    crc16, CodecError, DecodeError, Decoded, Frame, FrameCodec, MessageCodec,
    DEFAULT_MAX_PAYLOAD, HEADER_LEN, SYNC_WORD, TRAILER_LEN,
};
pub use config::{
    BindMode, DatagramConfig, StreamConfig, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, MAX_DATAGRAM_SIZE,
};
pub use datagram::DatagramTransport;
pub use endpoint::Endpoint;
pub use error::TideTransportError;
pub use listener::{ChannelListener, ListenerId, MessageListener, ReceptionEvent};
pub use outcome::{
    delivery_channel, DeliveryFuture, DeliveryListener, DeliveryOutcome, DeliveryPromise,
    DeliveryResult,
};
pub use reassembly::Reassembler;
pub use stats::{StatsSnapshot, TransportStats};
pub use stream::{PeerState, StreamTransport};

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Which transport carried (or should carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Datagram,
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Datagram => write!(f, "udp"),
            TransportKind::Stream => write!(f, "tcp"),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
