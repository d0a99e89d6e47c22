//! ARP entries stored in the fast-path ARP table.
//!
//! The fast path learns entries itself from ARP traffic; this is the
//! management view over the same table. Nothing is cached on this side.

use crate::error::{Result, RouterError};
use crate::net::{format_mac, ip_to_raw, raw_to_ip};
use crate::tables::{ArpTable, ArpValue};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// One neighbor known to the fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub address: Ipv4Addr,
    pub mac: [u8; 6],
    /// Index of the port the neighbor is reachable through
    pub port: u32,
}

/// Read-through access to the fast-path ARP table.
pub struct ArpCache {
    table: ArpTable,
}

impl ArpCache {
    pub fn new(table: ArpTable) -> Self {
        Self { table }
    }

    pub fn get(&self, address: Ipv4Addr) -> Result<ArpEntry> {
        let value = self
            .table
            .get(&ip_to_raw(address))?
            .ok_or(RouterError::ArpEntryNotFound(address))?;
        Ok(ArpEntry {
            address,
            mac: value.mac,
            port: value.port,
        })
    }

    /// All entries, ordered by address.
    pub fn list(&self) -> Result<Vec<ArpEntry>> {
        let mut entries: Vec<ArpEntry> = self
            .table
            .get_all()?
            .into_iter()
            .map(|(ip, value)| ArpEntry {
                address: raw_to_ip(ip),
                mac: value.mac,
                port: value.port,
            })
            .collect();
        entries.sort_by_key(|e| e.address);
        Ok(entries)
    }

    /// Add or overwrite an entry.
    pub fn add(&self, address: Ipv4Addr, mac: [u8; 6], port: u32) -> Result<()> {
        self.table.set(ip_to_raw(address), ArpValue::new(mac, port))?;
        info!(address = %address, mac = %format_mac(&mac), port, "ARP entry added");
        Ok(())
    }

    /// Replace an existing entry.
    pub fn replace(&self, address: Ipv4Addr, mac: [u8; 6], port: u32) -> Result<()> {
        self.remove(address)?;
        self.add(address, mac, port)
    }

    pub fn remove(&self, address: Ipv4Addr) -> Result<()> {
        if !self.table.remove(&ip_to_raw(address))? {
            return Err(RouterError::ArpEntryNotFound(address));
        }
        info!(address = %address, "ARP entry removed");
        Ok(())
    }

    pub fn remove_all(&self) -> Result<()> {
        self.table.remove_all()?;
        info!("All ARP entries removed");
        Ok(())
    }

    /// Remove the entries learned through one port. Returns how many were removed.
    pub fn remove_port(&self, port: u32) -> Result<usize> {
        let mut removed = 0;
        for (ip, value) in self.table.get_all()? {
            if value.port == port && self.table.remove(&ip)? {
                removed += 1;
            }
        }
        debug!(port, removed, "ARP entries of port removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::MemoryTable;
    use std::sync::Arc;

    const MAC: [u8; 6] = [0x52, 0x54, 0, 0, 0, 1];

    fn cache() -> ArpCache {
        ArpCache::new(Arc::new(MemoryTable::new()))
    }

    #[test]
    fn test_crud() {
        let cache = cache();
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        assert!(matches!(cache.get(ip), Err(RouterError::ArpEntryNotFound(_))));

        cache.add(ip, MAC, 1).unwrap();
        assert_eq!(cache.get(ip).unwrap().mac, MAC);

        cache.replace(ip, [2; 6], 2).unwrap();
        let entry = cache.get(ip).unwrap();
        assert_eq!(entry.mac, [2; 6]);
        assert_eq!(entry.port, 2);

        cache.remove(ip).unwrap();
        assert!(matches!(cache.remove(ip), Err(RouterError::ArpEntryNotFound(_))));
    }

    #[test]
    fn test_replace_requires_existing_entry() {
        let cache = cache();
        assert!(cache.replace(Ipv4Addr::new(10, 0, 0, 5), MAC, 1).is_err());
    }

    #[test]
    fn test_list_sorted_and_remove_port() {
        let cache = cache();
        cache.add(Ipv4Addr::new(10, 0, 0, 9), MAC, 1).unwrap();
        cache.add(Ipv4Addr::new(10, 0, 0, 2), MAC, 1).unwrap();
        cache.add(Ipv4Addr::new(10, 1, 0, 2), MAC, 2).unwrap();

        let list = cache.list().unwrap();
        assert_eq!(list[0].address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(list.len(), 3);

        assert_eq!(cache.remove_port(1).unwrap(), 2);
        assert_eq!(cache.list().unwrap().len(), 1);

        cache.remove_all().unwrap();
        assert!(cache.list().unwrap().is_empty());
    }
}
