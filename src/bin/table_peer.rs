use std::time::Duration;

use clap::{Parser, ValueEnum};
use mental_poker_p2p::p2p::{GameVariant, NetworkConfig, Node};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Peer-to-peer mental poker table node", author, version)]
struct Cli {
    /// Address to listen on (port 0 picks a free port)
    #[arg(long = "listen", default_value = "127.0.0.1:3000")]
    listen: String,

    /// Table members to join through (repeat flag for multiple)
    #[arg(long = "bootstrap", default_values_t = Vec::<String>::new())]
    bootstrap: Vec<String>,

    /// Game variant; every player at the table must agree
    #[arg(long = "variant", value_enum, default_value = "texas-holdem")]
    variant: VariantArg,

    /// Protocol version; every player at the table must agree
    #[arg(long = "protocol-version", default_value = "1")]
    protocol_version: String,

    /// Act as the dealer and start a round once the table is ready
    #[arg(long = "dealer", default_value_t = false)]
    dealer: bool,

    /// Seated players required before the dealer starts a round
    #[arg(long = "min-players", default_value_t = 2)]
    min_players: usize,

    /// Seconds between status log lines
    #[arg(long = "status-interval-secs", default_value_t = 5)]
    status_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    TexasHoldem,
    Omaha,
}

impl From<VariantArg> for GameVariant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::TexasHoldem => GameVariant::TexasHoldem,
            VariantArg::Omaha => GameVariant::Omaha,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = NetworkConfig {
        version: cli.protocol_version,
        listen_addr: cli.listen,
        game_variant: cli.variant.into(),
        dealer: cli.dealer,
        min_players: cli.min_players,
        status_interval: Duration::from_secs(cli.status_interval_secs),
        ..NetworkConfig::default()
    };

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Table node failed: {e}");
            std::process::exit(1);
        }
    };

    for addr in &cli.bootstrap {
        if let Err(e) = node.connect(addr).await {
            error!(peer = %addr, error = %e, "failed to join through bootstrap peer");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    node.shutdown().await;
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
