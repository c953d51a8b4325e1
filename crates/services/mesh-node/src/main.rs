//! Mesh node binary entry point
//!
//! Joins the overlay, keeps a WebRTC connection to every other node running
//! the same binary, and exposes the mesh to one local application over a
//! loopback WebSocket bridge.
//!
//! # Usage
//!
//! ```bash
//! # Tailscale overlay (default)
//! cargo run -p meshcall-node -- --hostname laptop
//!
//! # Fixed peer list, e.g. on a LAN or in tests
//! cargo run -p meshcall-node -- \
//!   --overlay static \
//!   --local-addr 10.0.0.2 \
//!   --static-peers 10.0.0.3,10.0.0.4
//! ```
//!
//! Once the bridge is listening, a single JSON line announcing its URLs is
//! written to stdout. Logs go to stderr.

mod bridge_server;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bridge_server::BridgeServer;
use clap::Parser;
use meshcall_webrtc::config::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use meshcall_webrtc::{
    signaling, DirectoryService, EstimatorPool, EventSender, HttpSignaler, LocalBridge,
    MeshConfig, MeshContext, MeshOrchestrator, NodeIdentity, Overlay, PeerDirectory,
    SharedMirror, StaticOverlay, TailscaleOverlay, WebRtcEngine,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_QUEUE: usize = 1024;
const MEDIA_QUEUE: usize = 1024;

/// Meshcall node
///
/// Full-mesh WebRTC calling between nodes of a private overlay network.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name announced to peers (defaults to $HOSTNAME)
    #[arg(long, env = "NODE_HOSTNAME")]
    hostname: Option<String>,

    /// Where the peer list comes from
    #[arg(long, value_enum, default_value = "tailscale", env = "MESHCALL_OVERLAY")]
    overlay: OverlayKind,

    /// tailscale CLI to query (tailscale overlay only)
    #[arg(long, default_value = "tailscale")]
    tailscale_bin: String,

    /// This node's overlay address (static overlay only)
    #[arg(long, env = "MESHCALL_LOCAL_ADDR")]
    local_addr: Option<Ipv4Addr>,

    /// Peer addresses, comma-separated (static overlay only)
    #[arg(long, value_delimiter = ',')]
    static_peers: Vec<Ipv4Addr>,

    /// Presence datagram port
    #[arg(long, default_value_t = DEFAULT_UDP_PORT, env = "MESHCALL_UDP_PORT")]
    udp_port: u16,

    /// Signaling HTTP port
    #[arg(long, default_value_t = DEFAULT_TCP_PORT, env = "MESHCALL_TCP_PORT")]
    tcp_port: u16,

    /// Presence broadcast and reconciliation period in milliseconds
    #[arg(long, default_value_t = 2000)]
    broadcast_interval_ms: u64,

    /// Seconds without presence before a peer is dropped
    #[arg(long, default_value_t = 10)]
    peer_timeout_secs: u64,

    /// Signaling request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    signaling_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OverlayKind {
    /// Peers from `tailscale status --json`
    Tailscale,
    /// Peers from --static-peers
    Static,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("Second interrupt, exiting immediately");
            std::process::exit(1);
        }
        eprintln!("Interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    })
    .context("failed to install Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("mesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_rx))
}

async fn async_main(args: Args, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        overlay = ?args.overlay,
        "Meshcall node starting"
    );

    let overlay: Arc<dyn Overlay> = match args.overlay {
        OverlayKind::Tailscale => Arc::new(
            TailscaleOverlay::discover(args.tailscale_bin.clone())
                .await
                .context("overlay discovery failed")?,
        ),
        OverlayKind::Static => {
            let Some(local) = args.local_addr else {
                bail!("--local-addr is required with --overlay static");
            };
            Arc::new(StaticOverlay::new(local, args.static_peers.clone()))
        }
    };
    let local_addr = overlay.local_address();

    let config = MeshConfig {
        udp_port: args.udp_port,
        tcp_port: args.tcp_port,
        broadcast_interval: Duration::from_millis(args.broadcast_interval_ms),
        peer_timeout: Duration::from_secs(args.peer_timeout_secs),
        signaling_timeout: Duration::from_millis(args.signaling_timeout_ms),
        ..Default::default()
    };
    config.validate()?;

    let hostname = args
        .hostname
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string());
    let identity = NodeIdentity::generate(hostname, local_addr);
    info!(
        hostname = %identity.hostname,
        address = %local_addr,
        start_time = identity.start_time,
        "Node identity"
    );

    let directory = Arc::new(PeerDirectory::new(identity, config.peer_timeout));
    let (events, events_rx) = EventSender::channel(EVENT_QUEUE);
    let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE);

    let presence_addr = config.presence_addr(local_addr);
    let presence_socket = UdpSocket::bind(presence_addr)
        .await
        .with_context(|| format!("failed to bind presence socket on {}", presence_addr))?;
    let ice_socket = UdpSocket::bind((local_addr, 0))
        .await
        .with_context(|| format!("failed to bind ICE socket on {}", local_addr))?;
    info!(ice = %ice_socket.local_addr()?, "ICE traffic multiplexed on one UDP socket");

    let estimators = Arc::new(EstimatorPool::new());
    let engine = Arc::new(WebRtcEngine::new(ice_socket, Arc::clone(&estimators), &config)?);
    let signaler = Arc::new(HttpSignaler::new(config.tcp_port, config.signaling_timeout)?);

    let orchestrator = MeshOrchestrator::new(
        MeshContext {
            config: config.clone(),
            directory: Arc::clone(&directory),
            mirror: Arc::new(SharedMirror::new()),
            estimators,
            events: events.clone(),
            media_out: media_tx,
        },
        engine,
        signaler,
    );

    let mut handles = Arc::new(DirectoryService::new(
        directory,
        overlay,
        Arc::new(presence_socket),
        events,
        config.clone(),
    ))
    .spawn(shutdown.clone());
    handles.extend(orchestrator.spawn(shutdown.clone()));

    let signaling_addr = config.signaling_addr(local_addr);
    let listener = TcpListener::bind(signaling_addr)
        .await
        .with_context(|| format!("failed to bind signaling server on {}", signaling_addr))?;
    info!(%signaling_addr, "Signaling server listening");
    let app = signaling::router(Arc::clone(&orchestrator));
    let mut signaling_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = signaling_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!("Signaling server failed: {}", e);
        }
    }));

    let bridge = BridgeServer::bind(LocalBridge::new(Arc::clone(&orchestrator)))
        .await
        .context("failed to bind local bridge")?;
    let bridge_addr = bridge.local_addr()?;
    println!(
        "{}",
        serde_json::json!({
            "type": "ws",
            "mediaWs": format!("ws://{}", bridge_addr),
            "msgWs": format!("ws://{}/msg", bridge_addr),
        })
    );
    info!(%bridge_addr, "Local bridge listening");
    handles.push(tokio::spawn(bridge.run(events_rx, media_rx, shutdown.clone())));

    info!("Node running. Press Ctrl+C to shut down.");
    let _ = shutdown.wait_for(|stop| *stop).await;

    info!("Shutdown signal received, closing connections");
    orchestrator.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }
    info!("Meshcall node stopped");

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
