//! Tide routing layer.
//!
//! Delivers one message to a batch of named destinations over the tide
//! transports, directly when a destination is reachable and through a relay
//! that advertises it otherwise.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tide_protocol::{
//!     DirectRoute, MessageRouter, RouterConfig, StaticPresence, TargetId, TransportPair,
//! };
//! use tide_transport::{
//!     DatagramConfig, DatagramTransport, Endpoint, Frame, FrameCodec, StreamConfig,
//!     StreamTransport,
//! };
//!
//! # async fn example() {
//! let config = RouterConfig::new();
//! let pair = TransportPair::new(
//!     DatagramTransport::bind(DatagramConfig::new(), FrameCodec::new()).await,
//!     StreamTransport::bind(StreamConfig::new(), FrameCodec::new()).await,
//! );
//! let presence = Arc::new(StaticPresence::new());
//! presence.set_route("auv-1", DirectRoute::stream(Endpoint::new("10.0.10.21", 7011)));
//! presence.set_active("auv-1", true);
//!
//! let router = MessageRouter::new(pair, presence, config);
//! let targets = [TargetId::from("auv-1")];
//! let delivered = router.send_batch(&targets, &Frame::new(1, "abort")).await;
//! println!("delivered: {delivered}");
//! # }
//! ```

pub mod envelope;
pub mod error;
pub mod policy;
pub mod presence;
pub mod router;
pub mod transport;
pub mod types;

pub use envelope::{RelayEnvelope, OP_FORWARD, RELAY_FORWARD_TYPE};
pub use error::TideProtocolError;
pub use policy::{AutoConfirm, FailureReporter, LogReporter, RelayConfirmation};
pub use presence::{PresenceSource, StaticPresence};
pub use router::{BatchReport, DestinationReport, MessageRouter, RoutePath, RouterConfig};
pub use transport::{Transport, TransportPair};
pub use types::{DirectRoute, RelayCapability, TargetId};
