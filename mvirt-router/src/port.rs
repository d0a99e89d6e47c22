//! Router ports and the directory that resolves them by name or index.

use crate::tables::{MAX_SECONDARY_ADDRESSES, PortValue};
use crate::net::{format_mac, ip_to_raw};
use ipnet::Ipv4Net;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Transmit side of a port.
pub trait PortIo: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> io::Result<()>;
}

/// A router port: one attached interface with its addresses.
#[derive(Clone)]
pub struct Port {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
    /// Primary address with its prefix
    pub address: Ipv4Net,
    pub secondary: Vec<Ipv4Net>,
    /// Peer interface, used as the injection point into a mirrored namespace
    pub peer: Option<String>,
    io: Arc<dyn PortIo>,
}

impl Port {
    pub fn new(
        name: impl Into<String>,
        index: u32,
        mac: [u8; 6],
        address: Ipv4Net,
        io: Arc<dyn PortIo>,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            mac,
            address,
            secondary: Vec::new(),
            peer: None,
            io,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.address.addr()
    }

    /// Whether `ip` is one of this port's addresses.
    pub fn owns(&self, ip: Ipv4Addr) -> bool {
        self.address.addr() == ip || self.secondary.iter().any(|s| s.addr() == ip)
    }

    pub fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        self.io.transmit(frame)
    }

    /// Entry describing this port in the fast-path port table.
    pub fn table_entry(&self) -> PortValue {
        let mut value = PortValue::new(
            ip_to_raw(self.address.addr()),
            ip_to_raw(self.address.netmask()),
            self.mac,
        );
        for (i, addr) in self.secondary.iter().take(MAX_SECONDARY_ADDRESSES).enumerate() {
            value.secondary_ip[i] = ip_to_raw(addr.addr());
            value.secondary_netmask[i] = ip_to_raw(addr.netmask());
        }
        value
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("mac", &format_mac(&self.mac))
            .field("address", &self.address)
            .field("secondary", &self.secondary)
            .field("peer", &self.peer)
            .finish()
    }
}

#[derive(Default)]
struct Directory {
    by_name: HashMap<String, Arc<Port>>,
    by_index: HashMap<u32, String>,
}

/// Ports of one router, looked up by name or index.
#[derive(Default)]
pub struct PortDirectory {
    inner: RwLock<Directory>,
}

impl PortDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Port>> {
        let dir = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        dir.by_name.get(name).cloned()
    }

    pub fn lookup_index(&self, index: u32) -> Option<Arc<Port>> {
        let dir = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        dir.by_index
            .get(&index)
            .and_then(|name| dir.by_name.get(name))
            .cloned()
    }

    pub fn contains(&self, name: &str, index: u32) -> bool {
        let dir = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        dir.by_name.contains_key(name) || dir.by_index.contains_key(&index)
    }

    /// Insert or replace a port.
    pub fn insert(&self, port: Port) -> Arc<Port> {
        let port = Arc::new(port);
        let mut dir = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        dir.by_index.insert(port.index, port.name.clone());
        dir.by_name.insert(port.name.clone(), Arc::clone(&port));
        debug!(name = %port.name, index = port.index, "Port registered");
        port
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Port>> {
        let mut dir = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let port = dir.by_name.remove(name)?;
        dir.by_index.remove(&port.index);
        Some(port)
    }

    /// All ports, sorted by index.
    pub fn list(&self) -> Vec<Arc<Port>> {
        let dir = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ports: Vec<_> = dir.by_name.values().cloned().collect();
        ports.sort_by_key(|p| p.index);
        ports
    }
}

/// AF_PACKET socket bound to one interface, used to transmit frames out of a port.
pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    pub fn bind(if_index: u32) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(libc::ETH_P_ALL)),
        )?;

        // Bind to interface using sockaddr_ll
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = if_index as i32;

        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(if_index, "Bound AF_PACKET socket to interface");

        Ok(Self { socket })
    }
}

impl PortIo for RawSocket {
    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Discard;

    impl PortIo for Discard {
        fn transmit(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn port(name: &str, index: u32, addr: &str) -> Port {
        Port::new(name, index, [2, 0, 0, 0, 0, index as u8], addr.parse().unwrap(), Arc::new(Discard))
    }

    #[test]
    fn test_lookup_by_name_and_index() {
        let dir = PortDirectory::new();
        dir.insert(port("eth0", 3, "10.0.0.1/24"));
        assert_eq!(dir.lookup("eth0").unwrap().index, 3);
        assert_eq!(dir.lookup_index(3).unwrap().name, "eth0");
        assert!(dir.lookup_index(4).is_none());
        assert!(dir.contains("other", 3));
    }

    #[test]
    fn test_insert_replaces_port() {
        let dir = PortDirectory::new();
        dir.insert(port("eth0", 3, "10.0.0.1/24"));
        dir.insert(port("eth0", 3, "10.1.0.1/16"));
        assert_eq!(dir.list().len(), 1);
        assert_eq!(dir.lookup("eth0").unwrap().ip(), Ipv4Addr::new(10, 1, 0, 1));
        assert!(dir.remove("eth0").is_some());
        assert!(dir.lookup_index(3).is_none());
    }

    #[test]
    fn test_table_entry_carries_secondary_addresses() {
        let mut p = port("eth0", 1, "10.0.0.1/24");
        p.secondary.push("192.168.1.1/16".parse().unwrap());
        let entry = p.table_entry();
        assert_eq!(entry.ip, ip_to_raw(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(entry.netmask, ip_to_raw(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(entry.secondary_ip[0], ip_to_raw(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(entry.secondary_netmask[0], ip_to_raw(Ipv4Addr::new(255, 255, 0, 0)));
        assert_eq!(entry.secondary_ip[1], 0);
    }

    #[test]
    fn test_owns_checks_all_addresses() {
        let mut p = port("eth0", 1, "10.0.0.1/24");
        p.secondary.push("192.168.1.1/16".parse().unwrap());
        assert!(p.owns(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(p.owns(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!p.owns(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
