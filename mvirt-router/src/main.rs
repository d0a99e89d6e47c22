//! mvirt-router daemon: control plane for the eBPF router fast path.

use anyhow::{Context, Result};
use clap::Parser;
use mvirt_router::config::{PortConfig, RouterConfig};
use mvirt_router::ebpf_loader::EbpfManager;
use mvirt_router::netlink::NetlinkMonitor;
use mvirt_router::port::{PortIo, RawSocket};
use mvirt_router::router::Router;
use mvirt_router::shadow::{self, NamespaceStack};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mvirt-router", version, about)]
struct Args {
    /// Router description (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Compiled fast-path program (stub mode when not installed)
    #[arg(long)]
    program: Option<PathBuf>,

    /// Mirror the OS network namespace, regardless of the config
    #[arg(long)]
    shadow: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn if_index(name: &str) -> io::Result<u32> {
    Ok(nix::net::if_::if_nametoindex(name)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mvirt-router starting...");

    let config = RouterConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let shadow_mode = args.shadow || config.shadow;

    let ebpf = EbpfManager::load(args.program.as_deref()).context("Failed to load eBPF program")?;
    if ebpf.is_stub() {
        warn!("Running without fast path, punted packets will not arrive");
    }

    let stack = Arc::new(NamespaceStack::new());
    let mut router = Router::new(config.name.clone(), ebpf.tables());
    if shadow_mode {
        router = router.with_stack(stack.clone());
    }
    let router = Arc::new(router);

    let open = |port: &PortConfig| -> io::Result<(u32, Arc<dyn PortIo>)> {
        let index = match port.ifindex {
            Some(index) => index,
            None => if_index(&port.name)?,
        };
        ebpf.attach(index, &port.name).map_err(io::Error::other)?;
        let socket = RawSocket::bind(index)?;
        Ok((index, Arc::new(socket)))
    };
    router
        .apply_config(&config, open)
        .context("Failed to apply router configuration")?;

    if shadow_mode {
        for port in router.ports() {
            let Some(peer) = &port.peer else {
                continue;
            };
            let result = if_index(peer).and_then(|peer_index| stack.attach(port.index, peer_index));
            if let Err(e) = result {
                warn!(port = %port.name, peer = %peer, error = %e, "Failed to attach namespace peer");
            }
        }
    }

    let readers = {
        let router = Arc::clone(&router);
        ebpf.spawn_packet_in_readers(move |packet| router.packet_in(packet))
            .context("Failed to start packet-in readers")?
    };

    let monitor = if shadow_mode {
        let (events_tx, events_rx) = shadow::event_channel();
        let monitor = NetlinkMonitor::start(events_tx).context("Failed to start netlink monitor")?;
        tokio::spawn(shadow::reconcile(Arc::clone(&router), events_rx));
        Some(monitor)
    } else {
        None
    };

    info!(
        router = %router.name(),
        ports = router.ports().len(),
        shadow = shadow_mode,
        "Router running"
    );

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }

    info!("Shutting down...");
    if let Some(monitor) = monitor {
        monitor.stop();
    }
    for reader in readers {
        reader.abort();
    }
    info!("mvirt-router stopped");
    Ok(())
}
