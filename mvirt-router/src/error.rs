//! Errors surfaced by router management operations.

use crate::tables::TableError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Router control plane errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Route to {network} via {nexthop} already exists")]
    DuplicateRoute { network: Ipv4Net, nexthop: String },

    #[error("Route to {network} via {nexthop} not found")]
    RouteNotFound { network: Ipv4Net, nexthop: String },

    #[error("Users can not delete a local route ({0})")]
    ProtectedRoute(Ipv4Net),

    #[error("Local entry exists for {0}, route ignored")]
    LocalRouteExists(Ipv4Net),

    #[error("Nexthop {0} is not reachable from any local network")]
    UnreachableNexthop(Ipv4Addr),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Port already exists: {0}")]
    PortExists(String),

    #[error("ARP entry not found: {0}")]
    ArpEntryNotFound(Ipv4Addr),

    #[error("Port {port} already has {max} secondary addresses")]
    TooManySecondaryAddresses { port: String, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Fast path table error: {0}")]
    TableBackend(#[from] TableError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;
