//! Peer node binary for a lockstep cluster.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use clap::Parser;
use error_stack::{Report, ResultExt};
use lockstep_core::CoordinatorCore;
use lockstep_core::codec::RegistryClientCodec;
use lockstep_node::{
    NodeActor, NodeError, PeerDirectory, RegistryClient, TokioDial, api, serve_peer, spawn_writer,
};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lockstep-node")]
#[command(about = "Run a lockstep peer node")]
struct Args {
    /// Registry endpoint.
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    registry: String,

    /// Peer listener bind address.
    #[arg(short = 'B', long, default_value = "0.0.0.0:7500")]
    bind: SocketAddr,

    /// Endpoint advertised to peers; defaults to the bind address.
    #[arg(short = 'e', long)]
    advertise: Option<String>,

    #[arg(short, long, default_value = "127.0.0.1:7580")]
    api_bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Report<NodeError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Listen before registering: peers start sending the moment the
    // registration barrier opens.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .change_context(NodeError)
        .attach("failed to bind peer listener")?;
    info!(addr = %args.bind, "peer listener bound");
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        info!(%peer_addr, "peer connected");
                        tokio::spawn(serve_peer(stream, event_tx.clone()));
                    }
                    Err(err) => error!(%err, "accept failed"),
                }
            }
        });
    }

    let stream = tokio::net::TcpStream::connect(&args.registry)
        .await
        .change_context(NodeError)
        .attach("failed to reach the registry")?;
    let mut registry = RegistryClient::new(Framed::new(stream, RegistryClientCodec::default()));

    let advertise = args
        .advertise
        .clone()
        .unwrap_or_else(|| args.bind.to_string());
    info!(registry = %args.registry, %advertise, "registering, waiting for the cluster");
    let registration = registry.register(&advertise).await?;
    info!(
        node_id = registration.node_id,
        balance = registration.initial_balance,
        peers = registration.peers.len(),
        "registered"
    );

    let directory = PeerDirectory::new(registration.peers);
    let core = CoordinatorCore::new(registration.node_id, directory.peers());
    let links: BTreeMap<_, _> = directory
        .iter()
        .map(|(id, endpoint)| (id, spawn_writer(TokioDial, id, endpoint.to_owned())))
        .collect();

    let (actor, handle) = NodeActor::new(core, registry, links, event_rx);
    tokio::spawn(actor.run());

    let api_router = api::router(handle);
    let api_listener = tokio::net::TcpListener::bind(args.api_bind)
        .await
        .change_context(NodeError)
        .attach("failed to bind API listener")?;
    info!(addr = %args.api_bind, "API server listening");
    axum::serve(api_listener, api_router)
        .await
        .change_context(NodeError)
        .attach("API server error")?;

    Ok(())
}
