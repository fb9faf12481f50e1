use std::time::{Duration, Instant};

use tide_transport::{Frame, TransportKind};

use crate::common::{bind_pair, parse_endpoint};
use crate::events::{cause_of, emit, EventOutcome, EventStarted, EventStats};

pub struct SendConfig {
    pub to: String,
    pub stream: bool,
    pub msg_type: u16,
    pub text: String,
    pub count: u32,
    pub delay_ms: u64,
}

pub async fn run(
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    config: SendConfig,
) -> anyhow::Result<()> {
    let to = parse_endpoint(&config.to)?;
    let kind = if config.stream {
        TransportKind::Stream
    } else {
        TransportKind::Datagram
    };
    // Port 0 keeps a sender from colliding with a listener on the same host.
    let pair = bind_pair(udp_port.or(Some(0)), tcp_port.or(Some(0))).await?;

    emit(&EventStarted::new(
        "send",
        pair.datagram().local_port(),
        pair.stream().local_port(),
    ));

    let mut failures = 0u32;
    for seq in 0..config.count {
        let frame = Frame::new(config.msg_type, config.text.clone().into_bytes());
        let start = Instant::now();
        let outcome = match kind {
            TransportKind::Datagram => pair.datagram().send(&to, &frame).await,
            TransportKind::Stream => pair.stream().send(&to, &frame).await,
        };
        if !outcome.is_success_class() {
            failures += 1;
        }
        emit(&EventOutcome {
            event: "outcome",
            seq,
            transport: kind.to_string(),
            to: to.to_string(),
            result: outcome.result(),
            cause: cause_of(&outcome),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        });

        if seq + 1 < config.count {
            tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
        }
    }

    let stats = match kind {
        TransportKind::Datagram => pair.datagram().stats().snapshot(),
        TransportKind::Stream => pair.stream().stats().snapshot(),
    };
    emit(&EventStats::new(if config.stream { "tcp" } else { "udp" }, stats));
    pair.stop().await;

    if failures > 0 {
        anyhow::bail!("{failures}/{} sends failed", config.count);
    }
    Ok(())
}
