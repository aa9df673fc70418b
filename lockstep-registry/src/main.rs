//! Account registry server for a lockstep cluster.

use std::net::SocketAddr;

use clap::Parser;
use lockstep_registry::{Registry, serve_connection};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lockstep-registry")]
#[command(about = "Run the lockstep account registry")]
struct Args {
    /// Number of nodes expected to register before the cluster opens.
    #[arg(short = 'n', long)]
    cluster_size: usize,

    /// Starting balance for every account.
    #[arg(short, long, default_value_t = 100)]
    initial_balance: u64,

    #[arg(short = 'B', long, default_value = "0.0.0.0:7400")]
    bind: SocketAddr,

    #[arg(short, long, default_value = "127.0.0.1:7480")]
    api_bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = Registry::new(args.cluster_size, args.initial_balance);

    let api_router = lockstep_registry::api::router(registry.clone());
    let api_listener = tokio::net::TcpListener::bind(args.api_bind).await?;
    info!(addr = %args.api_bind, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api_router).await {
            error!(error = %e, "API server error");
        }
    });

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        addr = %args.bind,
        cluster_size = args.cluster_size,
        "registry listening"
    );

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "incoming connection");
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(registry, stream).await {
                error!(error = ?e, "connection error");
            }
        });
    }
}
