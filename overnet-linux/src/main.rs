//! Overnet Linux daemon: UDP mesh links, LAN discovery and TCP service
//! bridging on one single-threaded runtime.

mod config;
mod discovery;
mod services;
mod transport;

use std::rc::Rc;

use overnet_core::{
    BridgeFactory, EndpointConfig, NodeId, NubConfig, PacketNub, RouterEndpoint, Timer,
    TokioTimer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("overnet-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load()?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let node = NodeId::random(&mut rand::rngs::OsRng);
    let timer: Rc<dyn Timer> = Rc::new(TokioTimer::new());
    let endpoint = RouterEndpoint::new(node, timer, EndpointConfig::default());
    endpoint.set_label(cfg.label.clone());
    info!(%node, label = ?cfg.label, "overnet-linux {}", VERSION);

    let socket = transport::bind(cfg.udp_port).await?;
    let nub = PacketNub::new(
        endpoint.clone(),
        Rc::new(transport::UdpSender::new(socket.clone())),
        NubConfig::default(),
    );
    let factory = BridgeFactory::new(endpoint.config().codec_limits());

    {
        let nub = nub.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = transport::receive_loop(socket, nub).await {
                error!(error = %e, "mesh transport failed");
            }
        });
    }
    tokio::task::spawn_local(transport::expire_loop(nub.clone()));
    {
        let nub = nub.clone();
        let (discovery_port, udp_port) = (cfg.discovery_port, cfg.udp_port);
        tokio::task::spawn_local(async move {
            if let Err(e) = discovery::run_discovery(nub, discovery_port, udp_port).await {
                error!(error = %e, "discovery failed");
            }
        });
    }
    tokio::task::spawn_local(services::serve_exports(
        endpoint.clone(),
        factory.clone(),
        cfg.exports.clone(),
    ));
    for forward in cfg.forwards.iter().cloned() {
        let endpoint = endpoint.clone();
        let factory = factory.clone();
        tokio::task::spawn_local(async move {
            let listen = forward.listen;
            if let Err(e) = services::run_forward(endpoint, factory, forward).await {
                error!(%listen, error = %e, "forward failed");
            }
        });
    }

    shutdown_signal().await?;
    info!(bridges = factory.active(), "shutting down");
    endpoint.close().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
