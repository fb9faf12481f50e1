//! Relay envelope: a message wrapped for forwarding by an intermediary.
//!
//! Encoded with MessagePack and carried as the payload of a frame whose
//! type is [`RELAY_FORWARD_TYPE`], so it travels over the ordinary
//! transports like any other message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tide_transport::Frame;

use crate::error::TideProtocolError;
use crate::types::TargetId;

/// Frame type reserved for relay envelopes.
pub const RELAY_FORWARD_TYPE: u16 = 0xFFF0;

/// The only relay operation.
pub const OP_FORWARD: &str = "forward";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub op: String,
    pub target: TargetId,
    /// The wrapped message, already encoded by the sender's codec.
    pub payload: Bytes,
}

impl RelayEnvelope {
    pub fn forward(target: TargetId, payload: Bytes) -> Self {
        Self {
            op: OP_FORWARD.to_string(),
            target,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TideProtocolError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    /// Decode and check the operation.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TideProtocolError> {
        let envelope: Self = rmp_serde::from_slice(data)?;
        if envelope.op != OP_FORWARD {
            return Err(TideProtocolError::UnknownOperation { op: envelope.op });
        }
        Ok(envelope)
    }

    pub fn to_frame(&self) -> Result<Frame, TideProtocolError> {
        Ok(Frame::new(RELAY_FORWARD_TYPE, self.to_bytes()?))
    }

    /// `Ok(None)` for frames that are not relay envelopes.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, TideProtocolError> {
        if frame.msg_type != RELAY_FORWARD_TYPE {
            return Ok(None);
        }
        Self::from_bytes(&frame.payload).map(Some)
    }
}
