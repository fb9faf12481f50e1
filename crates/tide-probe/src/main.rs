mod batch;
mod common;
mod events;
mod listen;
mod send;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tide-probe", about = "Exercise the tide transports and router from the shell")]
struct Cli {
    /// UDP port to bind (default: TIDE_UDP_PORT or 6001)
    #[arg(long, global = true)]
    udp_port: Option<u16>,

    /// TCP port to bind (default: TIDE_TCP_PORT or 7011)
    #[arg(long, global = true)]
    tcp_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every received message as a JSON line until Ctrl+C
    Listen {
        /// Forward inbound relay envelopes to their direct routes
        #[arg(long)]
        relay: bool,

        /// Direct route known to this node: id=host:port[/tcp]
        #[arg(long = "route")]
        routes: Vec<String>,
    },
    /// Send messages to one endpoint and print each outcome
    Send {
        /// Destination host:port
        #[arg(long)]
        to: String,

        /// Use the stream (TCP) transport instead of datagrams
        #[arg(long)]
        stream: bool,

        /// Message type tag
        #[arg(long, default_value = "1")]
        msg_type: u16,

        /// Payload text
        #[arg(long, default_value = "ping")]
        text: String,

        /// Number of messages to send
        #[arg(long, default_value = "1")]
        count: u32,

        /// Delay between messages in milliseconds
        #[arg(long, default_value = "200")]
        delay: u64,
    },
    /// Route one message to a set of logical destinations
    Batch {
        /// Direct route: id=host:port[/tcp] (repeatable)
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Relay capability: host:port=id,id (repeatable)
        #[arg(long = "relay")]
        relays: Vec<String>,

        /// Destinations that have a route but are not announcing presence
        #[arg(long, value_delimiter = ',')]
        stale: Vec<String>,

        /// Destinations to send to
        #[arg(long, value_delimiter = ',', required = true)]
        targets: Vec<String>,

        /// Message type tag
        #[arg(long, default_value = "1")]
        msg_type: u16,

        /// Payload text
        #[arg(long, default_value = "hello")]
        text: String,

        /// Relay envelopes over datagrams instead of the stream transport
        #[arg(long)]
        relay_over_udp: bool,

        /// Ask on the terminal before relaying
        #[arg(long)]
        confirm: bool,

        /// Per-destination timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Listen { relay, routes } => {
            eprintln!("tide-probe listen");
            listen::run(cli.udp_port, cli.tcp_port, relay, routes).await
        }
        Command::Send {
            to,
            stream,
            msg_type,
            text,
            count,
            delay,
        } => {
            eprintln!("tide-probe send -> {to}");
            let config = send::SendConfig {
                to,
                stream,
                msg_type,
                text,
                count,
                delay_ms: delay,
            };
            send::run(cli.udp_port, cli.tcp_port, config).await
        }
        Command::Batch {
            routes,
            relays,
            stale,
            targets,
            msg_type,
            text,
            relay_over_udp,
            confirm,
            timeout,
        } => {
            eprintln!("tide-probe batch -> {}", targets.join(","));
            let config = batch::BatchConfig {
                routes,
                relays,
                stale,
                targets,
                msg_type,
                text,
                relay_over_udp,
                confirm,
                timeout_secs: timeout,
            };
            batch::run(cli.udp_port, cli.tcp_port, config).await
        }
    }
}
