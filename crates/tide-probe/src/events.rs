use serde::Serialize;
use std::io::Write;
use tide_transport::{DeliveryOutcome, DeliveryResult, StatsSnapshot};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

pub use tide_transport::now_ms;

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub timestamp_ms: u64,
}

impl EventStarted {
    pub fn new(mode: &str, udp_port: Option<u16>, tcp_port: Option<u16>) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            udp_port,
            tcp_port,
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStats {
    pub event: &'static str,
    pub transport: &'static str,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

impl EventStats {
    pub fn new(transport: &'static str, stats: StatsSnapshot) -> Self {
        Self {
            event: "stats",
            transport,
            stats,
        }
    }
}

// ── Reception ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventReceived {
    pub event: &'static str,
    pub transport: String,
    pub source: String,
    pub msg_type: u16,
    pub len: usize,
    pub text: Option<String>,
    pub timestamp_ms: u64,
}

#[derive(Serialize)]
pub struct EventForwarded {
    pub event: &'static str,
    pub target: String,
    pub result: DeliveryResult,
    pub cause: Option<String>,
}

// ── Delivery outcomes ───────────────────────────────────────────

#[derive(Serialize)]
pub struct EventOutcome {
    pub event: &'static str,
    pub seq: u32,
    pub transport: String,
    pub to: String,
    pub result: DeliveryResult,
    pub cause: Option<String>,
    pub elapsed_ms: f64,
}

#[derive(Serialize)]
pub struct EventDestination {
    pub event: &'static str,
    pub target: String,
    pub path: tide_protocol::RoutePath,
    pub via: Option<String>,
    pub result: DeliveryResult,
    pub cause: Option<String>,
}

#[derive(Serialize)]
pub struct EventBatch {
    pub event: &'static str,
    pub destinations: usize,
    pub delivered: bool,
    pub elapsed_ms: f64,
}

/// Cause text of a failed outcome, if any.
pub fn cause_of(outcome: &DeliveryOutcome) -> Option<String> {
    outcome.cause().map(|c| format!("{c:#}"))
}
