use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tide_protocol::{MessageRouter, RelayEnvelope, RouterConfig, StaticPresence};
use tide_transport::{ChannelListener, Frame};

use crate::common::{bind_pair, parse_route, setup_ctrlc};
use crate::events::{
    cause_of, emit, now_ms, EventForwarded, EventReceived, EventStarted, EventStats,
};

pub async fn run(
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    relay: bool,
    routes: Vec<String>,
) -> anyhow::Result<()> {
    let presence = Arc::new(StaticPresence::new());
    for route in &routes {
        let (id, route) = parse_route(route)?;
        presence.set_active(id.clone(), true);
        presence.set_route(id, route);
    }

    let pair = bind_pair(udp_port, tcp_port).await?;
    let (listener, mut rx) = ChannelListener::<Frame>::new();
    pair.datagram().add_listener(listener.clone());
    pair.stream().add_listener(listener);

    let router = Arc::new(MessageRouter::new(
        pair.clone(),
        presence,
        RouterConfig::new(),
    ));

    emit(&EventStarted::new(
        if relay { "relay" } else { "listen" },
        pair.datagram().local_port(),
        pair.stream().local_port(),
    ));
    eprintln!(
        "Listening on udp {:?} / tcp {:?}. Ctrl+C to stop.",
        pair.datagram().local_port(),
        pair.stream().local_port()
    );

    let running = setup_ctrlc();
    while running.load(Ordering::Relaxed) {
        let (event, frame) =
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(_) => continue,
            };

        if relay {
            match RelayEnvelope::from_frame(&frame) {
                Ok(Some(envelope)) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        let outcome = router.forward_inbound(&envelope).await;
                        emit(&EventForwarded {
                            event: "forwarded",
                            target: envelope.target.to_string(),
                            result: outcome.result(),
                            cause: cause_of(&outcome),
                        });
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(source = %event.source, error = %e, "bad relay envelope");
                    continue;
                }
            }
        }

        emit(&EventReceived {
            event: "received",
            transport: event.transport.to_string(),
            source: event.source.to_string(),
            msg_type: frame.msg_type,
            len: frame.payload.len(),
            text: std::str::from_utf8(&frame.payload).ok().map(str::to_string),
            timestamp_ms: now_ms(),
        });
    }

    emit(&EventStats::new("udp", pair.datagram().stats().snapshot()));
    emit(&EventStats::new("tcp", pair.stream().stats().snapshot()));
    pair.stop().await;
    Ok(())
}
