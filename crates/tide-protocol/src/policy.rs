//! Hooks the router consults around a batch: the relay confirmation gate
//! and the failure sink.

use tide_transport::DeliveryOutcome;

use crate::types::TargetId;

/// Asked before any destination of a batch goes through a relay.
///
/// Called at most once per batch, with every destination that needs a
/// relay, so an operator prompt is shown once rather than per destination.
#[async_trait::async_trait]
pub trait RelayConfirmation: Send + Sync {
    async fn confirm_relay(&self, targets: &[TargetId]) -> bool;
}

/// Accepts every relay request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait::async_trait]
impl RelayConfirmation for AutoConfirm {
    async fn confirm_relay(&self, _targets: &[TargetId]) -> bool {
        true
    }
}

/// Receives each failed destination exactly once per batch.
pub trait FailureReporter: Send + Sync {
    fn report_failure(&self, target: &TargetId, outcome: &DeliveryOutcome);
}

/// Logs failures at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl FailureReporter for LogReporter {
    fn report_failure(&self, target: &TargetId, outcome: &DeliveryOutcome) {
        match outcome.cause() {
            Some(cause) => tracing::warn!(
                %target,
                result = ?outcome.result(),
                error = %cause,
                "delivery failed"
            ),
            None => tracing::warn!(%target, result = ?outcome.result(), "delivery failed"),
        }
    }
}
