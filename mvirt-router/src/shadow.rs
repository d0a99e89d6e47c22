//! Shadow mode: keeping the router in sync with an OS network namespace.
//!
//! Kernel notifications arrive as [`KernelEvent`]s on a bounded channel and are
//! applied by a single reconciliation loop. A notification never fails the
//! router: errors are logged and the event is dropped.

use crate::error::{Result, RouterError};
use crate::port::{Port, PortIo, RawSocket};
use crate::router::Router;
use crate::routing::Nexthop;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the kernel event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change observed in the mirrored namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    RouteAdded {
        ifindex: u32,
        network: Ipv4Net,
        nexthop: Ipv4Addr,
    },
    RouteDeleted {
        ifindex: u32,
        network: Ipv4Net,
        nexthop: Ipv4Addr,
    },
    LinkDeleted {
        ifindex: u32,
        name: String,
    },
    NewAddress {
        ifindex: u32,
        address: Ipv4Net,
    },
}

impl KernelEvent {
    /// Route notification, `route` in `network/prefix/nexthop` form.
    pub fn route_added(ifindex: u32, route: &str) -> Result<Self> {
        let (network, nexthop) = parse_route(route)?;
        Ok(Self::RouteAdded {
            ifindex,
            network,
            nexthop,
        })
    }

    pub fn route_deleted(ifindex: u32, route: &str) -> Result<Self> {
        let (network, nexthop) = parse_route(route)?;
        Ok(Self::RouteDeleted {
            ifindex,
            network,
            nexthop,
        })
    }

    pub fn link_deleted(ifindex: u32, name: impl Into<String>) -> Self {
        Self::LinkDeleted {
            ifindex,
            name: name.into(),
        }
    }

    /// Address notification, `address` in `ip/prefix` form.
    pub fn new_address(ifindex: u32, address: &str) -> Result<Self> {
        Ok(Self::NewAddress {
            ifindex,
            address: parse_address(address)?,
        })
    }

    pub fn ifindex(&self) -> u32 {
        match self {
            Self::RouteAdded { ifindex, .. }
            | Self::RouteDeleted { ifindex, .. }
            | Self::LinkDeleted { ifindex, .. }
            | Self::NewAddress { ifindex, .. } => *ifindex,
        }
    }
}

fn invalid(what: &str, value: &str) -> RouterError {
    RouterError::InvalidArgument(format!("invalid {} '{}'", what, value))
}

/// Parse a route notification in `network/prefix/nexthop` form.
///
/// A nexthop of `-` means directly connected and becomes `0.0.0.0`.
pub fn parse_route(route: &str) -> Result<(Ipv4Net, Ipv4Addr)> {
    let mut parts = route.split('/');
    let (Some(network), Some(prefix), Some(nexthop), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid("route", route));
    };

    let network: Ipv4Addr = network.parse().map_err(|_| invalid("route", route))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("route", route))?;
    let network = Ipv4Net::new(network, prefix)
        .map_err(|_| invalid("route", route))?
        .trunc();
    let nexthop = match nexthop {
        "-" => Ipv4Addr::UNSPECIFIED,
        other => other.parse().map_err(|_| invalid("nexthop", other))?,
    };
    Ok((network, nexthop))
}

/// Parse an address notification in `ip/prefix` form.
pub fn parse_address(address: &str) -> Result<Ipv4Net> {
    address.parse().map_err(|_| invalid("address", address))
}

/// Entry point into the mirrored namespace's network stack.
pub trait StackInjector: Send + Sync {
    /// Deliver a frame received on `port` to the namespace.
    fn inject(&self, port: &Port, frame: &[u8]) -> io::Result<()>;
}

/// Injects frames through raw sockets on the namespace side of each port.
#[derive(Default)]
pub struct NamespaceStack {
    sockets: RwLock<HashMap<u32, RawSocket>>,
}

impl NamespaceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the namespace interface mirroring port `port_index`.
    pub fn attach(&self, port_index: u32, peer_ifindex: u32) -> io::Result<()> {
        let socket = RawSocket::bind(peer_ifindex)?;
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port_index, socket);
        debug!(port_index, peer_ifindex, "Namespace peer attached");
        Ok(())
    }
}

impl StackInjector for NamespaceStack {
    fn inject(&self, port: &Port, frame: &[u8]) -> io::Result<()> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        let socket = sockets.get(&port.index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no namespace peer for port {}", port.name),
            )
        })?;
        socket.transmit(frame)
    }
}

impl Router {
    /// Apply one kernel notification. Events for interfaces this router does
    /// not own are ignored; errors are logged and swallowed.
    pub fn handle_kernel_event(&self, event: KernelEvent) {
        let ifindex = event.ifindex();
        let Some(port) = self.port_by_index(ifindex) else {
            debug!(ifindex, "Ignoring event for foreign interface");
            return;
        };

        let result = match &event {
            KernelEvent::RouteAdded {
                network, nexthop, ..
            } => self.add_route(*network, Nexthop::Via(*nexthop), Some(port.name.as_str()), None),
            KernelEvent::RouteDeleted {
                network, nexthop, ..
            } => self.remove_route(*network, Nexthop::Via(*nexthop)),
            KernelEvent::LinkDeleted { name, .. } => {
                if *name != port.name {
                    warn!(ifindex, name = %name, port = %port.name, "Deleted link name differs from port");
                }
                self.remove_port(&port.name)
            }
            KernelEvent::NewAddress { address, .. } => self.set_port_address(&port.name, *address),
        };

        match result {
            Ok(()) => debug!(?event, "Kernel event applied"),
            Err(e) => warn!(?event, error = %e, "Kernel event ignored"),
        }
    }
}

/// Channel feeding the reconciliation loop.
pub fn event_channel() -> (mpsc::Sender<KernelEvent>, mpsc::Receiver<KernelEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Apply kernel events to the router until the channel closes.
pub async fn reconcile(router: Arc<Router>, mut events: mpsc::Receiver<KernelEvent>) {
    info!(router = %router.name(), "Shadow reconciliation started");
    while let Some(event) = events.recv().await {
        router.handle_kernel_event(event);
    }
    info!(router = %router.name(), "Shadow reconciliation stopped");
}
