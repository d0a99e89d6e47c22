//! Fast-path table layouts and the storage abstraction over them.
//!
//! The fast path owns three tables: the routing table (keyed by prefix length
//! and network), the ARP cache and the router port table. The control plane
//! only ever does exact-match get/set/remove on them. A miss is `Ok(None)` or
//! `Ok(false)`, never an error.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Maximum number of secondary addresses per port (fixed by the fast path).
pub const MAX_SECONDARY_ADDRESSES: usize = 5;

/// Fast-path table errors.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Failed to access map: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("Map not found: {0}")]
    MapNotFound(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Kind of an installed route.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// Forward towards `nexthop` (or the destination itself when it is 0.0.0.0).
    Remote = 0,
    /// Destination is one of the router's own addresses.
    Local = 1,
}

/// Routing table key.
/// Must match the eBPF struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub prefix_len: u32,
    /// Network address, network byte order
    pub network: u32,
}

unsafe impl aya::Pod for RouteKey {}

/// Routing table value.
/// Must match the eBPF struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteValue {
    /// Egress port index
    pub port: u32,
    /// Nexthop address, network byte order (0 = directly connected)
    pub nexthop: u32,
    kind: u8,
    _padding: [u8; 3],
}

impl RouteValue {
    pub fn new(port: u32, nexthop: u32, kind: RouteKind) -> Self {
        Self {
            port,
            nexthop,
            kind: kind as u8,
            _padding: [0; 3],
        }
    }

    pub fn kind(&self) -> RouteKind {
        if self.kind == RouteKind::Local as u8 {
            RouteKind::Local
        } else {
            RouteKind::Remote
        }
    }
}

unsafe impl aya::Pod for RouteValue {}

/// ARP cache value, keyed by the neighbor address (network byte order).
/// Must match the eBPF struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpValue {
    pub mac: [u8; 6],
    _padding: [u8; 2],
    /// Port the neighbor is reachable through
    pub port: u32,
}

impl ArpValue {
    pub fn new(mac: [u8; 6], port: u32) -> Self {
        Self {
            mac,
            _padding: [0; 2],
            port,
        }
    }
}

unsafe impl aya::Pod for ArpValue {}

/// Router port entry, keyed by port index.
/// Must match the eBPF struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortValue {
    pub ip: u32,
    pub netmask: u32,
    pub secondary_ip: [u32; MAX_SECONDARY_ADDRESSES],
    pub secondary_netmask: [u32; MAX_SECONDARY_ADDRESSES],
    pub mac: [u8; 6],
    _padding: [u8; 2],
}

impl PortValue {
    pub fn new(ip: u32, netmask: u32, mac: [u8; 6]) -> Self {
        Self {
            ip,
            netmask,
            secondary_ip: [0; MAX_SECONDARY_ADDRESSES],
            secondary_netmask: [0; MAX_SECONDARY_ADDRESSES],
            mac,
            _padding: [0; 2],
        }
    }
}

unsafe impl aya::Pod for PortValue {}

/// Exact-match key/value store exposed by the fast path.
pub trait FastPathTable<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;

    fn set(&self, key: K, value: V) -> Result<()>;

    /// Returns whether an entry was removed.
    fn remove(&self, key: &K) -> Result<bool>;

    fn get_all(&self) -> Result<Vec<(K, V)>>;

    fn remove_all(&self) -> Result<()> {
        for (key, _) in self.get_all()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// In-memory table used when no fast-path program is loaded (stub mode) and in tests.
pub struct MemoryTable<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> MemoryTable<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FastPathTable<K, V> for MemoryTable<K, V>
where
    K: Eq + Hash + Copy + Send,
    V: Copy + Send,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).copied())
    }

    fn set(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }

    fn get_all(&self) -> Result<Vec<(K, V)>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn remove_all(&self) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

pub type RouteTable = Arc<dyn FastPathTable<RouteKey, RouteValue>>;
pub type ArpTable = Arc<dyn FastPathTable<u32, ArpValue>>;
pub type PortTable = Arc<dyn FastPathTable<u32, PortValue>>;

/// Handles to the three fast-path tables of one router.
#[derive(Clone)]
pub struct FastPathTables {
    pub routes: RouteTable,
    pub arp: ArpTable,
    pub ports: PortTable,
}

impl FastPathTables {
    /// Tables backed by process memory.
    pub fn in_memory() -> Self {
        Self {
            routes: Arc::new(MemoryTable::new()),
            arp: Arc::new(MemoryTable::new()),
            ports: Arc::new(MemoryTable::new()),
        }
    }
}
