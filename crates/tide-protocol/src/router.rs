//! Destination routing for tide.
//!
//! Per destination: send directly when it is reachable, otherwise wrap the
//! message in a relay envelope for a relay that advertises it, otherwise
//! fail with "no reachable path". A batch classifies every destination
//! first, asks the relay confirmation gate once, then runs all sends
//! concurrently and aggregates their outcomes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tide_transport::{DeliveryOutcome, Endpoint, TransportKind};

use crate::envelope::RelayEnvelope;
use crate::error::TideProtocolError;
use crate::policy::{AutoConfirm, FailureReporter, LogReporter, RelayConfirmation};
use crate::presence::PresenceSource;
use crate::transport::Transport;
use crate::types::{DirectRoute, TargetId};

/// Upper bound on a single destination's send within a batch (30 s).
const DEFAULT_DESTINATION_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    relay_transport: TransportKind,
    destination_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self {
            relay_transport: TransportKind::Stream,
            destination_timeout: DEFAULT_DESTINATION_TIMEOUT,
        }
    }

    /// Transport used to reach relays (default: stream).
    pub fn relay_transport(mut self, kind: TransportKind) -> Self {
        self.relay_transport = kind;
        self
    }

    /// A destination whose send has not resolved by then counts as `TimeOut`.
    pub fn destination_timeout(mut self, timeout: Duration) -> Self {
        self.destination_timeout = timeout;
        self
    }

    pub fn relay_kind(&self) -> TransportKind {
        self.relay_transport
    }
}

// ── Batch results ──────────────────────────────────────────────────────

/// How a destination was (or could not be) reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    Direct,
    Relay,
    Unroutable,
}

#[derive(Debug, Clone)]
pub struct DestinationReport {
    pub target: TargetId,
    pub path: RoutePath,
    /// Endpoint the message was handed to: the destination or its relay.
    pub via: Option<Endpoint>,
    pub outcome: DeliveryOutcome,
}

/// Per-destination outcomes of one batch, in first-occurrence order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub destinations: Vec<DestinationReport>,
}

impl BatchReport {
    /// True iff every destination ended in a success-class result. An
    /// empty batch succeeds.
    pub fn all_succeeded(&self) -> bool {
        self.destinations.iter().all(|d| d.outcome.is_success_class())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestinationReport> {
        self.destinations
            .iter()
            .filter(|d| !d.outcome.is_success_class())
    }

    pub fn get(&self, target: &TargetId) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| &d.target == target)
    }
}

// ── Router ─────────────────────────────────────────────────────────────

/// Routing decision for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Direct(DirectRoute),
    Relay(Endpoint),
    Unroutable,
}

pub struct MessageRouter<T: Transport, P: PresenceSource> {
    transport: T,
    presence: P,
    config: RouterConfig,
    confirmation: Arc<dyn RelayConfirmation>,
    reporter: Arc<dyn FailureReporter>,
}

impl<T: Transport, P: PresenceSource> MessageRouter<T, P> {
    /// Router that relays without asking and logs failures.
    pub fn new(transport: T, presence: P, config: RouterConfig) -> Self {
        Self {
            transport,
            presence,
            config,
            confirmation: Arc::new(AutoConfirm),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn RelayConfirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn presence(&self) -> &P {
        &self.presence
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Send `message` to every target. True iff all succeeded.
    pub async fn send_batch(&self, targets: &[TargetId], message: &T::Message) -> bool {
        self.send_batch_report(targets, message).await.all_succeeded()
    }

    /// Send `message` to every target and return the per-destination
    /// outcomes. Each failure is also handed to the reporter, once.
    pub async fn send_batch_report(
        &self,
        targets: &[TargetId],
        message: &T::Message,
    ) -> BatchReport {
        let mut seen = HashSet::new();
        let plans: Vec<(TargetId, Plan)> = targets
            .iter()
            .filter(|t| seen.insert(*t))
            .map(|t| (t.clone(), self.plan(t)))
            .collect();

        let relay_targets: Vec<TargetId> = plans
            .iter()
            .filter(|(_, plan)| matches!(plan, Plan::Relay(_)))
            .map(|(t, _)| t.clone())
            .collect();
        let relay_allowed = if relay_targets.is_empty() {
            true
        } else {
            let confirmed = self.confirmation.confirm_relay(&relay_targets).await;
            if !confirmed {
                tracing::info!(count = relay_targets.len(), "relay use refused for batch");
            }
            confirmed
        };

        // Encoded once; every relayed destination carries the same bytes.
        let relay_payload = if relay_allowed && !relay_targets.is_empty() {
            Some(self.transport.encode(message))
        } else {
            None
        };

        let sends = plans.into_iter().map(|(target, plan)| {
            let relay_payload = relay_payload.as_ref();
            async move {
                let (path, via, outcome) = match plan {
                    Plan::Direct(route) => {
                        let via = route.endpoint.clone();
                        let outcome =
                            self.bounded(self.transport.send_direct(&route, message)).await;
                        (RoutePath::Direct, Some(via), outcome)
                    }
                    Plan::Relay(relay) => {
                        let outcome = match relay_payload {
                            None => DeliveryOutcome::error(TideProtocolError::RelayNotConfirmed {
                                target: target.to_string(),
                            }),
                            Some(Err(e)) => DeliveryOutcome::error(anyhow::anyhow!(
                                "relay payload encoding failed: {e}"
                            )),
                            Some(Ok(payload)) => {
                                let envelope =
                                    RelayEnvelope::forward(target.clone(), payload.clone());
                                let kind = self.config.relay_transport;
                                self.bounded(self.transport.send_relay(&relay, kind, &envelope))
                                    .await
                            }
                        };
                        (RoutePath::Relay, Some(relay), outcome)
                    }
                    Plan::Unroutable => {
                        let outcome = DeliveryOutcome::error(TideProtocolError::NoReachablePath {
                            target: target.to_string(),
                        });
                        (RoutePath::Unroutable, None, outcome)
                    }
                };
                tracing::debug!(%target, ?path, result = ?outcome.result(), "destination resolved");
                DestinationReport {
                    target,
                    path,
                    via,
                    outcome,
                }
            }
        });
        let report = BatchReport {
            destinations: join_all(sends).await,
        };

        for failed in report.failures() {
            self.reporter.report_failure(&failed.target, &failed.outcome);
        }
        report
    }

    /// Relay side: deliver an inbound envelope to its target's direct
    /// route. Never relays further.
    pub async fn forward_inbound(&self, envelope: &RelayEnvelope) -> DeliveryOutcome {
        let target = &envelope.target;
        let Some(message) = self.transport.decode(&envelope.payload) else {
            return DeliveryOutcome::error(TideProtocolError::EnvelopeDecode(format!(
                "payload for {target} is not a message"
            )));
        };
        let outcome = match self.presence.direct_route(target) {
            Some(route) => self.bounded(self.transport.send_direct(&route, &message)).await,
            None => DeliveryOutcome::error(TideProtocolError::NoReachablePath {
                target: target.to_string(),
            }),
        };
        if !outcome.is_success_class() {
            self.reporter.report_failure(target, &outcome);
        }
        tracing::debug!(%target, result = ?outcome.result(), "relay envelope forwarded");
        outcome
    }

    fn plan(&self, target: &TargetId) -> Plan {
        let route = self.presence.direct_route(target);
        if let Some(route) = &route {
            if self.presence.is_active_direct(target) || self.transport.is_connected(route) {
                return Plan::Direct(route.clone());
            }
        }
        let own = route.map(|r| r.endpoint);
        self.presence
            .relays_for(target)
            .into_iter()
            .find(|relay| Some(relay) != own.as_ref())
            .map(Plan::Relay)
            .unwrap_or(Plan::Unroutable)
    }

    async fn bounded<F>(&self, send: F) -> DeliveryOutcome
    where
        F: std::future::Future<Output = DeliveryOutcome>,
    {
        let limit = self.config.destination_timeout;
        match tokio::time::timeout(limit, send).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::time_out(anyhow::anyhow!(
                "no delivery outcome within {} ms",
                limit.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::StaticPresence;
    use crate::transport::mock::MockTransport;
    use crate::types::RelayCapability;
    use std::sync::Mutex;
    use tide_transport::DeliveryResult;

    #[derive(Default)]
    struct RecordingReporter(Mutex<Vec<(TargetId, DeliveryResult)>>);

    impl FailureReporter for RecordingReporter {
        fn report_failure(&self, target: &TargetId, outcome: &DeliveryOutcome) {
            self.0
                .lock()
                .unwrap()
                .push((target.clone(), outcome.result()));
        }
    }

    struct Gate {
        answer: bool,
        calls: Mutex<Vec<Vec<TargetId>>>,
    }

    impl Gate {
        fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl RelayConfirmation for Gate {
        async fn confirm_relay(&self, targets: &[TargetId]) -> bool {
            self.calls.lock().unwrap().push(targets.to_vec());
            self.answer
        }
    }

    fn ep(last: u8) -> Endpoint {
        Endpoint::new(format!("10.0.0.{last}"), 7011)
    }

    fn ids(names: &[&str]) -> Vec<TargetId> {
        names.iter().map(|n| TargetId::from(*n)).collect()
    }

    struct Fixture {
        transport: MockTransport,
        presence: Arc<StaticPresence>,
        reporter: Arc<RecordingReporter>,
        router: MessageRouter<MockTransport, Arc<StaticPresence>>,
    }

    fn fixture(config: RouterConfig) -> Fixture {
        let transport = MockTransport::new();
        let presence = Arc::new(StaticPresence::new());
        let reporter = Arc::new(RecordingReporter::default());
        let router = MessageRouter::new(transport.clone(), presence.clone(), config)
            .with_reporter(reporter.clone());
        Fixture {
            transport,
            presence,
            reporter,
            router,
        }
    }

    #[tokio::test]
    async fn active_destination_goes_direct() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("a", DirectRoute::stream(ep(1)));
        f.presence.set_active("a", true);

        let report = f.router.send_batch_report(&ids(&["a"]), &b"hi".to_vec()).await;
        let a = report.get(&"a".into()).unwrap();
        assert_eq!(a.path, RoutePath::Direct);
        assert_eq!(a.outcome.result(), DeliveryResult::Success);
        assert_eq!(f.transport.direct_sends().len(), 1);
        assert!(f.transport.relay_sends().is_empty());
    }

    #[tokio::test]
    async fn established_connection_counts_as_reachable() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("a", DirectRoute::stream(ep(1)));
        f.transport.set_connected(ep(1));

        assert!(f.router.send_batch(&ids(&["a"]), &b"hi".to_vec()).await);
        assert_eq!(f.transport.direct_sends()[0].0.endpoint, ep(1));
    }

    /// D unreachable directly but advertised by R: exactly one envelope to R,
    /// and D's outcome is R's.
    #[tokio::test]
    async fn falls_back_to_single_relay_envelope() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("d", DirectRoute::stream(ep(4)));
        f.presence.add_relay(RelayCapability::new(ep(9), ["d"]));
        f.presence.add_relay(RelayCapability::new(ep(8), ["d"]));
        f.transport
            .fail_to(ep(9), DeliveryOutcome::unreachable(anyhow::anyhow!("relay down")));

        let report = f.router.send_batch_report(&ids(&["d"]), &b"payload".to_vec()).await;

        let relayed = f.transport.relay_sends();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].0, ep(9));
        assert_eq!(relayed[0].1.target, TargetId::from("d"));
        assert_eq!(&relayed[0].1.payload[..], b"payload");
        assert!(f.transport.direct_sends().is_empty());

        let d = report.get(&"d".into()).unwrap();
        assert_eq!(d.path, RoutePath::Relay);
        assert_eq!(d.via, Some(ep(9)));
        assert_eq!(d.outcome.result(), DeliveryResult::Unreachable);
        assert_eq!(
            *f.reporter.0.lock().unwrap(),
            vec![(TargetId::from("d"), DeliveryResult::Unreachable)]
        );
    }

    #[tokio::test]
    async fn relay_goes_over_configured_transport() {
        let f = fixture(RouterConfig::new());
        f.presence.add_relay(RelayCapability::new(ep(9), ["d"]));
        assert!(f.router.send_batch(&ids(&["d"]), &b"x".to_vec()).await);
        assert_eq!(f.transport.relay_kinds(), vec![TransportKind::Stream]);

        let f = fixture(RouterConfig::new().relay_transport(TransportKind::Datagram));
        f.presence.add_relay(RelayCapability::new(ep(9), ["d"]));
        assert!(f.router.send_batch(&ids(&["d"]), &b"x".to_vec()).await);
        assert_eq!(f.transport.relay_kinds(), vec![TransportKind::Datagram]);
    }

    #[tokio::test]
    async fn relay_equal_to_own_endpoint_is_skipped() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("d", DirectRoute::stream(ep(4)));
        f.presence.add_relay(RelayCapability::new(ep(4), ["d"]));
        f.presence.add_relay(RelayCapability::new(ep(5), ["d"]));

        assert!(f.router.send_batch(&ids(&["d"]), &b"x".to_vec()).await);
        assert_eq!(f.transport.relay_sends()[0].0, ep(5));
    }

    #[tokio::test]
    async fn unroutable_destination_fails_without_blocking_others() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("ok", DirectRoute::datagram(ep(1)));
        f.presence.set_active("ok", true);

        let report = f
            .router
            .send_batch_report(&ids(&["ok", "ghost"]), &b"x".to_vec())
            .await;
        assert!(!report.all_succeeded());

        let ghost = report.get(&"ghost".into()).unwrap();
        assert_eq!(ghost.path, RoutePath::Unroutable);
        assert_eq!(ghost.outcome.result(), DeliveryResult::Error);
        assert!(ghost
            .outcome
            .cause()
            .unwrap()
            .to_string()
            .contains("no reachable path"));
        assert_eq!(
            report.get(&"ok".into()).unwrap().outcome.result(),
            DeliveryResult::Success
        );
        assert_eq!(f.reporter.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmation_is_asked_once_per_batch() {
        let f = fixture(RouterConfig::new());
        let gate = Gate::new(true);
        let router =
            MessageRouter::new(f.transport.clone(), f.presence.clone(), RouterConfig::new())
                .with_confirmation(gate.clone());
        f.presence
            .add_relay(RelayCapability::new(ep(9), ["r1", "r2", "r3"]));
        f.presence.set_route("direct", DirectRoute::stream(ep(1)));
        f.presence.set_active("direct", true);

        let targets = ids(&["r1", "direct", "r2", "r3"]);
        assert!(router.send_batch(&targets, &b"x".to_vec()).await);
        let calls = gate.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![ids(&["r1", "r2", "r3"])]);
        assert_eq!(f.transport.relay_sends().len(), 3);
    }

    #[tokio::test]
    async fn confirmation_not_asked_without_relays() {
        let f = fixture(RouterConfig::new());
        let gate = Gate::new(false);
        let router =
            MessageRouter::new(f.transport.clone(), f.presence.clone(), RouterConfig::new())
                .with_confirmation(gate.clone());
        f.presence.set_route("a", DirectRoute::stream(ep(1)));
        f.presence.set_active("a", true);

        assert!(router.send_batch(&ids(&["a"]), &b"x".to_vec()).await);
        assert!(gate.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_confirmation_fails_relayed_destinations_only() {
        let f = fixture(RouterConfig::new());
        let reporter = Arc::new(RecordingReporter::default());
        let router =
            MessageRouter::new(f.transport.clone(), f.presence.clone(), RouterConfig::new())
                .with_confirmation(Gate::new(false))
                .with_reporter(reporter.clone());
        f.presence.add_relay(RelayCapability::new(ep(9), ["far"]));
        f.presence.set_route("near", DirectRoute::stream(ep(1)));
        f.presence.set_active("near", true);

        let report = router
            .send_batch_report(&ids(&["far", "near"]), &b"x".to_vec())
            .await;
        let far = report.get(&"far".into()).unwrap();
        assert_eq!(far.outcome.result(), DeliveryResult::Error);
        assert!(far.outcome.cause().unwrap().to_string().contains("not confirmed"));
        assert!(report.get(&"near".into()).unwrap().outcome.is_success_class());
        assert!(f.transport.relay_sends().is_empty());
        assert_eq!(reporter.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_targets_are_sent_once() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("a", DirectRoute::stream(ep(1)));
        f.presence.set_active("a", true);

        let report = f
            .router
            .send_batch_report(&ids(&["a", "a", "a"]), &b"x".to_vec())
            .await;
        assert_eq!(report.destinations.len(), 1);
        assert_eq!(f.transport.direct_sends().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let f = fixture(RouterConfig::new());
        assert!(f.router.send_batch(&[], &b"x".to_vec()).await);
        assert!(f.reporter.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncertain_counts_as_success() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("udp", DirectRoute::datagram(ep(2)));
        f.presence.set_active("udp", true);
        f.transport
            .fail_to(ep(2), DeliveryOutcome::uncertain("no acknowledgement"));

        assert!(f.router.send_batch(&ids(&["udp"]), &b"x".to_vec()).await);
        assert!(f.reporter.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_destination_times_out_alone() {
        let f = fixture(RouterConfig::new().destination_timeout(Duration::from_secs(1)));
        f.presence.set_route("slow", DirectRoute::stream(ep(1)));
        f.presence.set_active("slow", true);
        f.presence.set_route("fast", DirectRoute::stream(ep(2)));
        f.presence.set_active("fast", true);
        f.transport.delay_to(ep(1), Duration::from_secs(60));

        let report = f
            .router
            .send_batch_report(&ids(&["slow", "fast"]), &b"x".to_vec())
            .await;
        assert_eq!(
            report.get(&"slow".into()).unwrap().outcome.result(),
            DeliveryResult::TimeOut
        );
        assert_eq!(
            report.get(&"fast".into()).unwrap().outcome.result(),
            DeliveryResult::Success
        );
    }

    #[tokio::test]
    async fn forward_inbound_uses_direct_route_only() {
        let f = fixture(RouterConfig::new());
        f.presence.set_route("d", DirectRoute::datagram(ep(4)));
        f.presence.add_relay(RelayCapability::new(ep(9), ["e"]));

        let env = RelayEnvelope::forward("d".into(), bytes::Bytes::from_static(b"inner"));
        let outcome = f.router.forward_inbound(&env).await;
        assert_eq!(outcome.result(), DeliveryResult::Success);
        assert_eq!(
            f.transport.direct_sends(),
            vec![(DirectRoute::datagram(ep(4)), b"inner".to_vec())]
        );

        let env = RelayEnvelope::forward("e".into(), bytes::Bytes::from_static(b"inner"));
        let outcome = f.router.forward_inbound(&env).await;
        assert_eq!(outcome.result(), DeliveryResult::Error);
        assert!(f.transport.relay_sends().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Every distinct target is contacted exactly once, whatever the
            /// duplicates and ordering of the input.
            #[test]
            fn each_distinct_target_contacted_once(
                picks in prop::collection::vec(0usize..6, 0..20),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let names = ["a", "b", "c", "d", "e", "f"];
                let f = fixture(RouterConfig::new());
                for (i, name) in names.iter().enumerate() {
                    if i % 2 == 0 {
                        f.presence.set_route(*name, DirectRoute::stream(ep(i as u8 + 1)));
                        f.presence.set_active(*name, true);
                    }
                }
                f.presence.add_relay(RelayCapability::new(ep(200), ["b", "d"]));

                let targets: Vec<TargetId> = picks.iter().map(|&i| names[i].into()).collect();
                let report = rt.block_on(f.router.send_batch_report(&targets, &b"x".to_vec()));

                let distinct: HashSet<&TargetId> = targets.iter().collect();
                prop_assert_eq!(report.destinations.len(), distinct.len());
                let contacted = f.transport.direct_sends().len() + f.transport.relay_sends().len();
                let unroutable = report
                    .destinations
                    .iter()
                    .filter(|d| d.path == RoutePath::Unroutable)
                    .count();
                prop_assert_eq!(contacted + unroutable, distinct.len());
                prop_assert_eq!(f.reporter.0.lock().unwrap().len(), unroutable);
            }
        }
    }
}
