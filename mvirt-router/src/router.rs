//! A virtual router instance: ports, routes and ARP state of one router.

use crate::arp::{ArpCache, ArpEntry, ArpResolver};
use crate::config::{ArpEntryConfig, PortConfig, RouteConfig, RouterConfig, SecondaryIpConfig};
use crate::error::{Result, RouterError};
use crate::net::{format_mac, parse_interface_address, parse_mac, parse_network, random_mac};
use crate::port::{Port, PortDirectory, PortIo};
use crate::routing::{InstalledRoute, Interface, Nexthop, Route, RouteManager};
use crate::shadow::StackInjector;
use crate::tables::{FastPathTables, MAX_SECONDARY_ADDRESSES, PortTable};
use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One virtual router.
///
/// All methods take `&self`; routes and pending ARP resolutions are guarded by
/// their own locks, so API calls, kernel notifications and punted packets can
/// be handled from different tasks.
pub struct Router {
    name: String,
    pub(crate) ports: PortDirectory,
    pub(crate) routes: RouteManager,
    pub(crate) arp: ArpCache,
    pub(crate) resolver: ArpResolver,
    port_table: PortTable,
    pub(crate) stack: Option<Arc<dyn StackInjector>>,
}

impl Router {
    pub fn new(name: impl Into<String>, tables: FastPathTables) -> Self {
        Self {
            name: name.into(),
            ports: PortDirectory::new(),
            routes: RouteManager::new(tables.routes),
            arp: ArpCache::new(tables.arp),
            resolver: ArpResolver::new(),
            port_table: tables.ports,
            stack: None,
        }
    }

    /// Mirror an OS network namespace: unclaimed ARP replies are injected into its stack.
    pub fn with_stack(mut self, stack: Arc<dyn StackInjector>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shadow(&self) -> bool {
        self.stack.is_some()
    }

    pub fn resolver(&self) -> &ArpResolver {
        &self.resolver
    }

    // ========== Ports ==========

    /// Add a port. Its addresses get local routes and the fast path learns the port.
    pub fn add_port(&self, config: &PortConfig, index: u32, io: Arc<dyn PortIo>) -> Result<Arc<Port>> {
        if self.ports.contains(&config.name, index) {
            return Err(RouterError::PortExists(config.name.clone()));
        }

        let address = parse_interface_address(&config.ip, &config.netmask)?;
        let mac = match &config.mac {
            Some(mac) => parse_mac(mac)
                .ok_or_else(|| RouterError::InvalidArgument(format!("invalid mac '{}'", mac)))?,
            None => random_mac(),
        };
        if config.secondary_ips.len() > MAX_SECONDARY_ADDRESSES {
            return Err(RouterError::TooManySecondaryAddresses {
                port: config.name.clone(),
                max: MAX_SECONDARY_ADDRESSES,
            });
        }
        let secondary = config
            .secondary_ips
            .iter()
            .map(|s| parse_interface_address(&s.ip, &s.netmask))
            .collect::<Result<Vec<_>>>()?;

        let interface = Interface::new(&config.name, index);
        let mut added = Vec::new();
        for addr in std::iter::once(address).chain(secondary.iter().copied()) {
            if let Err(e) = self.routes.add_local_route(addr, &interface) {
                self.rollback_local_routes(&added, &interface);
                return Err(e);
            }
            added.push(addr);
        }

        let mut port = Port::new(&config.name, index, mac, address, io);
        port.secondary = secondary;
        port.peer = config.peer.clone();
        if let Err(e) = self.port_table.set(index, port.table_entry()) {
            self.rollback_local_routes(&added, &interface);
            return Err(e.into());
        }
        let port = self.ports.insert(port);

        info!(
            name = %port.name,
            index,
            mac = %format_mac(&port.mac),
            address = %port.address,
            "Added new port"
        );
        for addr in &port.secondary {
            info!(name = %port.name, address = %addr, "Secondary address");
        }
        Ok(port)
    }

    fn rollback_local_routes(&self, addresses: &[Ipv4Net], interface: &Interface) {
        for addr in addresses {
            if let Err(e) = self.routes.remove_local_route(*addr, interface) {
                warn!(port = %interface.name, address = %addr, error = %e, "Failed to roll back local routes");
            }
        }
    }

    /// Remove a port with its local routes, its routes and its ARP entries.
    ///
    /// Teardown always runs to the end; the first failure is returned afterwards.
    pub fn remove_port(&self, name: &str) -> Result<()> {
        let port = self.port(name)?;
        let interface = Interface::new(&port.name, port.index);

        let mut results = Vec::new();
        for addr in &port.secondary {
            results.push(self.routes.remove_local_route(*addr, &interface));
        }
        results.push(self.routes.remove_local_route(port.address, &interface));
        results.push(self.routes.remove_interface_routes(port.index).map(|_| ()));
        results.push(self.arp.remove_port(port.index).map(|_| ()));
        results.push(self.port_table.remove(&port.index).map(|_| ()).map_err(RouterError::from));
        self.ports.remove(name);

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!(name, error = %e, "Port teardown step failed");
                first.get_or_insert(e);
            }
        }
        if let Some(e) = first {
            return Err(e);
        }

        info!(name, index = port.index, "Port was removed");
        Ok(())
    }

    /// Replace a port with a new configuration.
    pub fn replace_port(&self, config: &PortConfig, index: u32, io: Arc<dyn PortIo>) -> Result<Arc<Port>> {
        if self.ports.lookup(&config.name).is_some() {
            self.remove_port(&config.name)?;
        }
        self.add_port(config, index, io)
    }

    pub fn port(&self, name: &str) -> Result<Arc<Port>> {
        self.ports
            .lookup(name)
            .ok_or_else(|| RouterError::PortNotFound(name.to_string()))
    }

    pub fn port_by_index(&self, index: u32) -> Option<Arc<Port>> {
        self.ports.lookup_index(index)
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.list()
    }

    pub fn add_secondary_address(&self, port: &str, address: Ipv4Net) -> Result<()> {
        let current = self.port(port)?;
        if current.secondary.len() >= MAX_SECONDARY_ADDRESSES {
            return Err(RouterError::TooManySecondaryAddresses {
                port: port.to_string(),
                max: MAX_SECONDARY_ADDRESSES,
            });
        }
        if current.owns(address.addr()) {
            return Err(RouterError::InvalidArgument(format!(
                "address {} already assigned to port {}",
                address.addr(),
                port
            )));
        }

        self.routes
            .add_local_route(address, &Interface::new(port, current.index))?;

        let mut updated = (*current).clone();
        updated.secondary.push(address);
        self.update_port(updated)?;

        info!(port, address = %address, "Secondary address added");
        Ok(())
    }

    pub fn remove_secondary_address(&self, port: &str, address: Ipv4Net) -> Result<()> {
        let current = self.port(port)?;
        let pos = current
            .secondary
            .iter()
            .position(|a| *a == address)
            .ok_or_else(|| {
                RouterError::InvalidArgument(format!(
                    "secondary address {} not found on port {}",
                    address, port
                ))
            })?;

        self.routes
            .remove_local_route(address, &Interface::new(port, current.index))?;

        let mut updated = (*current).clone();
        updated.secondary.remove(pos);
        self.update_port(updated)?;

        info!(port, address = %address, "Secondary address removed");
        Ok(())
    }

    /// Change the primary address of a port, replacing its local routes.
    pub fn set_port_address(&self, port: &str, address: Ipv4Net) -> Result<()> {
        let current = self.port(port)?;
        if current.address == address {
            debug!(port, address = %address, "Port address unchanged");
            return Ok(());
        }

        self.routes
            .replace_local_route(current.address, address, &Interface::new(port, current.index))?;

        let mut updated = (*current).clone();
        updated.address = address;
        self.update_port(updated)?;

        info!(port, old = %current.address, new = %address, "Port address changed");
        Ok(())
    }

    fn update_port(&self, port: Port) -> Result<()> {
        self.port_table.set(port.index, port.table_entry())?;
        self.ports.insert(port);
        Ok(())
    }

    fn interface(&self, name: &str) -> Result<Interface> {
        let port = self.port(name)?;
        Ok(Interface::new(&port.name, port.index))
    }

    // ========== Routes ==========

    /// Add a route. Without an interface it is derived from the nexthop.
    pub fn add_route(
        &self,
        network: Ipv4Net,
        nexthop: Nexthop,
        interface: Option<&str>,
        cost: Option<u32>,
    ) -> Result<()> {
        let interface = interface.map(|name| self.interface(name)).transpose()?;
        self.routes.add_route(network, nexthop, interface, cost)
    }

    pub fn remove_route(&self, network: Ipv4Net, nexthop: Nexthop) -> Result<()> {
        self.routes.remove_route(network, nexthop)
    }

    pub fn replace_route(
        &self,
        network: Ipv4Net,
        nexthop: Nexthop,
        interface: Option<&str>,
        cost: Option<u32>,
    ) -> Result<()> {
        let interface = interface.map(|name| self.interface(name)).transpose()?;
        self.routes.replace_route(network, nexthop, interface, cost)
    }

    pub fn remove_all_routes(&self) -> Result<()> {
        self.routes.remove_all_routes()
    }

    pub fn get_route(&self, network: Ipv4Net, nexthop: Nexthop) -> Result<Route> {
        self.routes.get_route(network, nexthop)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.routes()
    }

    pub fn installed_route(&self, network: Ipv4Net) -> Result<Option<InstalledRoute>> {
        self.routes.installed_route(network)
    }

    // ========== ARP ==========

    pub fn add_arp_entry(&self, address: Ipv4Addr, mac: [u8; 6], interface: &str) -> Result<()> {
        let port = self.port(interface)?;
        self.arp.add(address, mac, port.index)
    }

    pub fn replace_arp_entry(&self, address: Ipv4Addr, mac: [u8; 6], interface: &str) -> Result<()> {
        let port = self.port(interface)?;
        self.arp.replace(address, mac, port.index)
    }

    pub fn remove_arp_entry(&self, address: Ipv4Addr) -> Result<()> {
        self.arp.remove(address)
    }

    pub fn remove_all_arp_entries(&self) -> Result<()> {
        self.arp.remove_all()
    }

    pub fn get_arp_entry(&self, address: Ipv4Addr) -> Result<ArpEntry> {
        self.arp.get(address)
    }

    pub fn arp_entries(&self) -> Result<Vec<ArpEntry>> {
        self.arp.list()
    }

    // ========== Configuration ==========

    /// Apply a router description. `open` attaches each port and returns its
    /// index and transmit side.
    pub fn apply_config<F>(&self, config: &RouterConfig, mut open: F) -> Result<()>
    where
        F: FnMut(&PortConfig) -> io::Result<(u32, Arc<dyn PortIo>)>,
    {
        for port in &config.ports {
            let (index, io) = open(port)?;
            self.add_port(port, index, io)?;
        }

        for route in &config.routes {
            let nexthop: Nexthop = route.nexthop.parse()?;
            if nexthop.is_local() {
                debug!(network = %route.network, "Skipping local route, derived from ports");
                continue;
            }
            let network = parse_network(&route.network, &route.netmask)?;
            self.add_route(network, nexthop, route.interface.as_deref(), route.pathcost)?;
        }

        for entry in &config.arp_entries {
            let address: Ipv4Addr = entry.address.parse().map_err(|_| {
                RouterError::InvalidArgument(format!("invalid ip address '{}'", entry.address))
            })?;
            let mac = parse_mac(&entry.mac)
                .ok_or_else(|| RouterError::InvalidArgument(format!("invalid mac '{}'", entry.mac)))?;
            self.add_arp_entry(address, mac, &entry.interface)?;
        }

        info!(
            router = %self.name,
            ports = config.ports.len(),
            routes = config.routes.len(),
            arp_entries = config.arp_entries.len(),
            "Configuration applied"
        );
        Ok(())
    }

    /// Snapshot of the router in its description format.
    pub fn show(&self) -> Result<RouterConfig> {
        let ports = self
            .ports
            .list()
            .iter()
            .map(|p| PortConfig {
                name: p.name.clone(),
                ip: p.address.addr().to_string(),
                netmask: p.address.netmask().to_string(),
                mac: Some(format_mac(&p.mac)),
                ifindex: Some(p.index),
                peer: p.peer.clone(),
                secondary_ips: p
                    .secondary
                    .iter()
                    .map(|s| SecondaryIpConfig {
                        ip: s.addr().to_string(),
                        netmask: s.netmask().to_string(),
                    })
                    .collect(),
            })
            .collect();

        let routes = self
            .routes
            .routes()
            .into_iter()
            .map(|r| RouteConfig {
                network: r.network.network().to_string(),
                netmask: r.network.netmask().to_string(),
                nexthop: r.nexthop.to_string(),
                interface: Some(r.interface.name),
                pathcost: r.cost,
            })
            .collect();

        let mut arp_entries = Vec::new();
        for entry in self.arp.list()? {
            let interface = match self.ports.lookup_index(entry.port) {
                Some(port) => port.name.clone(),
                None => {
                    warn!(address = %entry.address, port = entry.port, "ARP entry on unknown port");
                    entry.port.to_string()
                }
            };
            arp_entries.push(ArpEntryConfig {
                address: entry.address.to_string(),
                mac: format_mac(&entry.mac),
                interface,
            });
        }

        Ok(RouterConfig {
            name: self.name.clone(),
            shadow: self.is_shadow(),
            ports,
            routes,
            arp_entries,
        })
    }
}
