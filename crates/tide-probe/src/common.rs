use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tide_protocol::{DirectRoute, RelayCapability, RelayConfirmation, TargetId, TransportPair};
use tide_transport::{
    DatagramConfig, DatagramTransport, Endpoint, FrameCodec, StreamConfig, StreamTransport,
    TransportKind,
};

/// Setup Ctrl+C handler, returns a flag that goes false on signal.
pub fn setup_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\nCtrl+C received, shutting down...");
        r.store(false, Ordering::Relaxed);
    });
    running
}

/// Bind both transports. `None` keeps the environment/default port.
pub async fn bind_pair(
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
) -> anyhow::Result<TransportPair> {
    let mut udp = DatagramConfig::new();
    if let Some(port) = udp_port {
        udp = udp.bind_port(port);
    }
    let mut tcp = StreamConfig::new();
    if let Some(port) = tcp_port {
        tcp = tcp.bind_port(port);
    }
    let datagram = DatagramTransport::bind(udp, FrameCodec::new()).await;
    let stream = StreamTransport::bind(tcp, FrameCodec::new()).await;
    if datagram.is_on_bind_error() || stream.is_on_bind_error() {
        datagram.stop().await;
        stream.stop().await;
        anyhow::bail!("could not bind transports (udp {udp_port:?}, tcp {tcp_port:?})");
    }
    Ok(TransportPair::new(datagram, stream))
}

/// Parse `host:port`, rejecting a missing port.
pub fn parse_endpoint(s: &str) -> anyhow::Result<Endpoint> {
    let endpoint = Endpoint::parse(s);
    if endpoint.port() == 0 || endpoint.host().is_empty() {
        anyhow::bail!("invalid endpoint '{s}': expected host:port");
    }
    Ok(endpoint)
}

/// Parse `id=host:port[/tcp|/udp]` (datagram unless `/tcp`).
pub fn parse_route(s: &str) -> anyhow::Result<(TargetId, DirectRoute)> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid route '{s}': expected id=host:port[/tcp]"))?;
    let (addr, kind) = match addr.rsplit_once('/') {
        Some((addr, "tcp")) => (addr, TransportKind::Stream),
        Some((addr, "udp")) => (addr, TransportKind::Datagram),
        Some((_, other)) => anyhow::bail!("invalid route '{s}': unknown transport '{other}'"),
        None => (addr, TransportKind::Datagram),
    };
    let endpoint = parse_endpoint(addr)?;
    Ok((
        TargetId::new(id.trim()),
        DirectRoute { endpoint, kind },
    ))
}

/// Parse `host:port=id,id,...`.
pub fn parse_relay(s: &str) -> anyhow::Result<RelayCapability> {
    let (addr, targets) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid relay '{s}': expected host:port=id,id"))?;
    let endpoint = parse_endpoint(addr)?;
    let targets: Vec<&str> = targets
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if targets.is_empty() {
        anyhow::bail!("invalid relay '{s}': no targets");
    }
    Ok(RelayCapability::new(endpoint, targets))
}

/// Asks on the terminal before relaying.
pub struct PromptConfirm;

#[async_trait::async_trait]
impl RelayConfirmation for PromptConfirm {
    async fn confirm_relay(&self, targets: &[TargetId]) -> bool {
        let names: Vec<String> = targets.iter().map(ToString::to_string).collect();
        eprint!("Relay needed for {}. Proceed? [y/N] ", names.join(", "));
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        matches!(answer, Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y"))
    }
}
