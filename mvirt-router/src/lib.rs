//! mvirt-router: control plane of an eBPF virtual IPv4 router.
//!
//! The forwarding fast path runs as a TC eBPF program and keeps its state in
//! BPF maps. This crate owns everything the fast path cannot do on its own:
//! route arbitration, ARP resolution and the packets the fast path punts.
//!
//! # Architecture
//!
//! ```text
//! port --> TC eBPF (Kernel) --(hit)--> forward / bpf_redirect
//!               |
//!               +--(miss, TTL, for router)--> perf buffer --> slowpath
//!                                                              |
//!                  ROUTING_TABLE / ARP_TABLE / ROUTER_PORT <----+--> routing, arp
//!                                                              |
//!   netlink (shadow mode) --> shadow::reconcile --> routing ---+
//! ```

pub mod arp;
pub mod config;
pub mod ebpf_loader;
pub mod error;
pub mod net;
pub mod netlink;
pub mod packet;
pub mod port;
pub mod router;
pub mod routing;
pub mod shadow;
pub mod slowpath;
pub mod tables;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use arp::{ArpEntry, ArpResolver, ReplyOutcome};
pub use config::RouterConfig;
pub use ebpf_loader::EbpfManager;
pub use error::{Result, RouterError};
pub use netlink::NetlinkMonitor;
pub use port::{Port, PortIo, RawSocket};
pub use router::Router;
pub use routing::{DEFAULT_PATHCOST, InstalledRoute, Nexthop, Route};
pub use shadow::{KernelEvent, NamespaceStack, StackInjector};
pub use slowpath::{PacketIn, SlowPathReason};
pub use tables::{FastPathTables, RouteKind};
