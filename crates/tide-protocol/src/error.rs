/// Routing-level errors for tide.
///
/// Like the transport errors, these end up as the cause of a failed
/// `DeliveryOutcome` rather than being returned across the batch API.
#[derive(Debug, thiserror::Error)]
pub enum TideProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] tide_transport::TideTransportError),

    #[error("no reachable path to {target}")]
    NoReachablePath { target: String },

    #[error("relay use not confirmed for {target}")]
    RelayNotConfirmed { target: String },

    #[error("envelope encode error: {0}")]
    EnvelopeEncode(String),

    #[error("envelope decode error: {0}")]
    EnvelopeDecode(String),

    #[error("unknown relay operation: {op}")]
    UnknownOperation { op: String },
}

impl From<rmp_serde::encode::Error> for TideProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TideProtocolError::EnvelopeEncode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TideProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TideProtocolError::EnvelopeDecode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_no_reachable_path() {
        let err = TideProtocolError::NoReachablePath {
            target: "auv-1".into(),
        };
        assert_eq!(err.to_string(), "no reachable path to auv-1");
    }

    #[test]
    fn test_display_relay_not_confirmed() {
        let err = TideProtocolError::RelayNotConfirmed {
            target: "auv-2".into(),
        };
        assert_eq!(err.to_string(), "relay use not confirmed for auv-2");
    }

    #[test]
    fn test_display_unknown_operation() {
        let err = TideProtocolError::UnknownOperation { op: "drop".into() };
        assert_eq!(err.to_string(), "unknown relay operation: drop");
    }

    #[test]
    fn test_from_transport_error() {
        let err: TideProtocolError = tide_transport::TideTransportError::NotRunning.into();
        assert_eq!(err.to_string(), "transport error: transport is not running");
    }
}
