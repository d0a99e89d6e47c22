//! Kernel notifications for shadow mode, read from an rtnetlink multicast socket.

use crate::shadow::KernelEvent;
use futures::StreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV4_ROUTE, RTMGRP_LINK};
use netlink_packet_core::NetlinkPayload;
use netlink_sys::{AsyncSocket, SocketAddr};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Netlink monitor errors.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("Failed to open netlink connection: {0}")]
    Connection(#[source] io::Error),

    #[error("Failed to join netlink groups: {0}")]
    Bind(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

/// Listens for link, address and route changes and forwards them as
/// [`KernelEvent`]s.
pub struct NetlinkMonitor {
    handle: JoinHandle<()>,
}

impl NetlinkMonitor {
    /// Join the link, IPv4 address and IPv4 route groups and start forwarding.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(events: mpsc::Sender<KernelEvent>) -> Result<Self> {
        let (mut connection, _handle, mut messages) =
            rtnetlink::new_connection().map_err(NetlinkError::Connection)?;

        let groups = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV4_ROUTE;
        connection
            .socket_mut()
            .socket_mut()
            .bind(&SocketAddr::new(0, groups))
            .map_err(NetlinkError::Bind)?;
        tokio::spawn(connection);

        let handle = tokio::spawn(async move {
            while let Some((message, _)) = messages.next().await {
                let NetlinkPayload::InnerMessage(message) = message.payload else {
                    continue;
                };
                let Some(event) = translate(message) else {
                    continue;
                };
                debug!(?event, "Kernel notification");
                if events.send(event).await.is_err() {
                    break;
                }
            }
            info!("Netlink monitor stopped");
        });

        info!(groups, "Netlink monitor started");
        Ok(Self { handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Map a netlink message to the event it represents, if any.
pub fn translate(message: RouteNetlinkMessage) -> Option<KernelEvent> {
    match message {
        RouteNetlinkMessage::NewRoute(msg) => {
            let (ifindex, network, nexthop) = route_fields(&msg)?;
            Some(KernelEvent::RouteAdded {
                ifindex,
                network,
                nexthop,
            })
        }
        RouteNetlinkMessage::DelRoute(msg) => {
            let (ifindex, network, nexthop) = route_fields(&msg)?;
            Some(KernelEvent::RouteDeleted {
                ifindex,
                network,
                nexthop,
            })
        }
        RouteNetlinkMessage::DelLink(msg) => Some(link_deleted(&msg)),
        RouteNetlinkMessage::NewAddress(msg) => new_address(&msg),
        _ => None,
    }
}

/// Unicast IPv4 routes of the main table only. A missing gateway means the
/// destination is directly connected.
fn route_fields(msg: &RouteMessage) -> Option<(u32, Ipv4Net, Ipv4Addr)> {
    let header = &msg.header;
    if header.address_family != AddressFamily::Inet
        || header.kind != RouteType::Unicast
        || header.table != RouteHeader::RT_TABLE_MAIN
    {
        return None;
    }

    let mut ifindex = None;
    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut gateway = Ipv4Addr::UNSPECIFIED;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Oif(index) => ifindex = Some(*index),
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => destination = *addr,
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = *addr,
            _ => {}
        }
    }

    let Some(ifindex) = ifindex else {
        warn!(destination = %destination, "Route notification without output interface");
        return None;
    };
    let network = Ipv4Net::new(destination, header.destination_prefix_length)
        .ok()?
        .trunc();
    Some((ifindex, network, gateway))
}

fn link_deleted(msg: &LinkMessage) -> KernelEvent {
    let name = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_default();
    KernelEvent::LinkDeleted {
        ifindex: msg.header.index,
        name,
    }
}

fn new_address(msg: &AddressMessage) -> Option<KernelEvent> {
    if msg.header.family != AddressFamily::Inet {
        return None;
    }
    let ip = msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(IpAddr::V4(ip)) => Some(*ip),
        _ => None,
    })?;
    let address = Ipv4Net::new(ip, msg.header.prefix_len).ok()?;
    Some(KernelEvent::NewAddress {
        ifindex: msg.header.index,
        address,
    })
}
