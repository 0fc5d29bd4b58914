//! Runs a small table inside one process: each player joins through the one
//! before it, gossip completes the mesh, and the first player deals.

use std::time::Duration;

use clap::Parser;
use mental_poker_p2p::p2p::{NetworkConfig, Node};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "In-process mental poker table demonstration", author, version)]
struct Cli {
    /// Number of players
    #[arg(long = "players", default_value_t = 3)]
    players: usize,

    /// Listen port of the first player; the others count up in steps of 1000
    #[arg(long = "base-port", default_value_t = 3000)]
    base_port: u16,

    /// Pause between joins, in milliseconds
    #[arg(long = "join-delay-ms", default_value_t = 1000)]
    join_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Local table failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> mental_poker_p2p::NodeResult<()> {
    let mut nodes = Vec::with_capacity(cli.players);
    for i in 0..cli.players {
        let port = cli.base_port as usize + i * 1000;
        let config = NetworkConfig {
            listen_addr: format!("127.0.0.1:{port}"),
            dealer: i == 0,
            min_players: cli.players.max(2),
            ..NetworkConfig::default()
        };
        nodes.push(Node::start(config).await?);
    }

    let delay = Duration::from_millis(cli.join_delay_ms);
    for i in 1..nodes.len() {
        tokio::time::sleep(delay).await;
        let target = nodes[i - 1].listen_addr().to_string();
        if let Err(e) = nodes[i].connect(&target).await {
            error!(peer = %target, error = %e, "join failed");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
