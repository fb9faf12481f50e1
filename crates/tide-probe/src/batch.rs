use std::sync::Arc;
use std::time::{Duration, Instant};

use tide_protocol::{MessageRouter, RouterConfig, StaticPresence, TargetId};
use tide_transport::{Frame, TransportKind};

use crate::common::{bind_pair, parse_relay, parse_route, PromptConfirm};
use crate::events::{cause_of, emit, EventBatch, EventDestination, EventStarted};

pub struct BatchConfig {
    pub routes: Vec<String>,
    pub relays: Vec<String>,
    pub stale: Vec<String>,
    pub targets: Vec<String>,
    pub msg_type: u16,
    pub text: String,
    pub relay_over_udp: bool,
    pub confirm: bool,
    pub timeout_secs: u64,
}

/// Presence built from the command line: every route is active unless
/// listed as stale.
pub fn build_presence(config: &BatchConfig) -> anyhow::Result<StaticPresence> {
    let presence = StaticPresence::new();
    for route in &config.routes {
        let (id, route) = parse_route(route)?;
        let stale = config.stale.iter().any(|s| s.trim() == id.as_str());
        presence.set_active(id.clone(), !stale);
        presence.set_route(id, route);
    }
    for relay in &config.relays {
        presence.add_relay(parse_relay(relay)?);
    }
    Ok(presence)
}

pub async fn run(
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    config: BatchConfig,
) -> anyhow::Result<()> {
    let presence = build_presence(&config)?;
    let relay_kind = if config.relay_over_udp {
        TransportKind::Datagram
    } else {
        TransportKind::Stream
    };
    let pair = bind_pair(udp_port.or(Some(0)), tcp_port.or(Some(0))).await?;

    emit(&EventStarted::new(
        "batch",
        pair.datagram().local_port(),
        pair.stream().local_port(),
    ));

    let router_config = RouterConfig::new()
        .relay_transport(relay_kind)
        .destination_timeout(Duration::from_secs(config.timeout_secs));
    let mut router = MessageRouter::new(pair.clone(), presence, router_config);
    if config.confirm {
        router = router.with_confirmation(Arc::new(PromptConfirm));
    }

    let targets: Vec<TargetId> = config
        .targets
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(TargetId::from)
        .collect();
    let frame = Frame::new(config.msg_type, config.text.clone().into_bytes());

    let start = Instant::now();
    let report = router.send_batch_report(&targets, &frame).await;
    for dest in &report.destinations {
        emit(&EventDestination {
            event: "destination",
            target: dest.target.to_string(),
            path: dest.path,
            via: dest.via.as_ref().map(ToString::to_string),
            result: dest.outcome.result(),
            cause: cause_of(&dest.outcome),
        });
    }
    let delivered = report.all_succeeded();
    emit(&EventBatch {
        event: "batch",
        destinations: report.destinations.len(),
        delivered,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    });

    pair.stop().await;
    if !delivered {
        anyhow::bail!("{} destination(s) failed", report.failures().count());
    }
    Ok(())
}
