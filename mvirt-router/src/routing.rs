//! Routing table manager.
//!
//! The control plane keeps every candidate route in insertion order and decides
//! which one is installed in the fast path for each destination network. A
//! network has at most one installed entry:
//!
//! - a local route (directly connected, generated from a port address) always wins;
//! - otherwise the candidate with the lowest path cost wins, first-seen on ties.
//!
//! The candidate list and the installed entries are always updated under the
//! same lock.

use crate::error::{Result, RouterError};
use crate::net::{ip_to_raw, raw_to_ip};
use crate::tables::{RouteKey, RouteKind, RouteTable, RouteValue};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Path cost of routes that do not carry one.
pub const DEFAULT_PATHCOST: u32 = 1;

/// Next hop of a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Nexthop {
    /// Directly connected network of one of the router's ports.
    Local,
    /// Forward via a gateway; `0.0.0.0` means directly connected without a local address.
    Via(Ipv4Addr),
}

impl Nexthop {
    /// Address written to the fast path.
    pub fn addr(&self) -> Ipv4Addr {
        match self {
            Nexthop::Local => Ipv4Addr::UNSPECIFIED,
            Nexthop::Via(ip) => *ip,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Nexthop::Local)
    }

    /// Whether the nexthop marks a directly connected network.
    fn is_connected(&self) -> bool {
        match self {
            Nexthop::Local => true,
            Nexthop::Via(ip) => ip.is_unspecified(),
        }
    }
}

impl fmt::Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nexthop::Local => f.write_str("local"),
            Nexthop::Via(ip) => write!(f, "{}", ip),
        }
    }
}

impl FromStr for Nexthop {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "local" {
            return Ok(Nexthop::Local);
        }
        s.parse()
            .map(Nexthop::Via)
            .map_err(|_| RouterError::InvalidArgument(format!("invalid nexthop '{}'", s)))
    }
}

/// Egress interface of a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// A candidate route. Identified by `(network, nexthop)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Net,
    pub nexthop: Nexthop,
    pub interface: Interface,
    pub cost: Option<u32>,
}

impl Route {
    /// Cost used for arbitration; local routes cost nothing.
    pub fn effective_cost(&self) -> u32 {
        if self.nexthop.is_local() {
            0
        } else {
            self.cost.unwrap_or(DEFAULT_PATHCOST)
        }
    }

    fn is(&self, network: &Ipv4Net, nexthop: &Nexthop) -> bool {
        self.network == *network && self.nexthop == *nexthop
    }
}

/// Entry currently installed in the fast path for one network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstalledRoute {
    pub port: u32,
    pub nexthop: Ipv4Addr,
    pub kind: RouteKind,
}

fn route_key(network: &Ipv4Net) -> RouteKey {
    RouteKey {
        prefix_len: network.prefix_len() as u32,
        network: ip_to_raw(network.network()),
    }
}

/// Candidate routes and the port addresses that own local routes.
#[derive(Default)]
struct RouteState {
    routes: Vec<Route>,
    /// Port addresses with their interface, in the order they were added
    addresses: Vec<(Ipv4Net, Interface)>,
}

/// Owns the candidate routes of one router and the fast-path routing table.
pub struct RouteManager {
    state: Mutex<RouteState>,
    table: RouteTable,
}

impl RouteManager {
    pub fn new(table: RouteTable) -> Self {
        Self {
            state: Mutex::new(RouteState::default()),
            table,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add the host and network routes of a port address.
    ///
    /// Both are installed unconditionally: a local route always wins. A network
    /// already connected through another address keeps its owner.
    pub fn add_local_route(&self, address: Ipv4Net, interface: &Interface) -> Result<()> {
        let mut state = self.lock();
        self.add_local(&mut state, address, interface)?;
        info!(address = %address, interface = %interface.name, "Local routes added");
        Ok(())
    }

    /// Remove the local routes `interface` holds for a port address.
    ///
    /// The network route stays while another address still covers the network;
    /// otherwise it goes together with every route whose nexthop is no longer
    /// reachable through a connected network.
    pub fn remove_local_route(&self, address: Ipv4Net, interface: &Interface) -> Result<()> {
        let mut state = self.lock();
        self.remove_local(&mut state, address, interface)?;
        info!(address = %address, interface = %interface.name, "Local routes removed");
        Ok(())
    }

    /// Move the local routes of `interface` from address `old` to `new`.
    ///
    /// The new address is validated before anything is removed. If installing
    /// it fails, the old address is restored.
    pub fn replace_local_route(&self, old: Ipv4Net, new: Ipv4Net, interface: &Interface) -> Result<()> {
        let mut state = self.lock();
        let owned = |a: &Ipv4Net, i: &Interface| *a == old && i.index == interface.index;
        if !state.addresses.iter().any(|(a, i)| owned(a, i)) {
            return Err(RouterError::RouteNotFound {
                network: old,
                nexthop: Nexthop::Local.to_string(),
            });
        }
        if state
            .addresses
            .iter()
            .any(|(a, i)| a.addr() == new.addr() && !owned(a, i))
        {
            return Err(Self::duplicate_address(new));
        }

        // Install the new address before dropping the old one so shared networks keep their routes
        state.addresses.push((new, interface.clone()));
        let result = match self.install_local(&mut state, new, interface) {
            Ok(()) => self.remove_local(&mut state, old, interface),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Err(undo) = self.remove_local(&mut state, new, interface) {
                warn!(address = %new, error = %undo, "Failed to roll back new address");
            }
            let restore = if state.addresses.iter().any(|(a, i)| owned(a, i)) {
                self.install_local(&mut state, old, interface)
            } else {
                self.add_local(&mut state, old, interface)
            };
            if let Err(undo) = restore {
                warn!(address = %old, error = %undo, "Failed to restore old address");
            }
            return Err(e);
        }

        info!(old = %old, new = %new, interface = %interface.name, "Local routes moved");
        Ok(())
    }

    fn duplicate_address(address: Ipv4Net) -> RouterError {
        RouterError::DuplicateRoute {
            network: Ipv4Net::from(address.addr()),
            nexthop: Nexthop::Local.to_string(),
        }
    }

    fn add_local(&self, state: &mut RouteState, address: Ipv4Net, interface: &Interface) -> Result<()> {
        if state.addresses.iter().any(|(a, _)| a.addr() == address.addr()) {
            return Err(Self::duplicate_address(address));
        }

        state.addresses.push((address, interface.clone()));
        if let Err(e) = self.install_local(state, address, interface) {
            if let Err(undo) = self.remove_local(state, address, interface) {
                warn!(address = %address, error = %undo, "Failed to roll back local routes");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Install the host and network routes of a registered address that are not present yet.
    fn install_local(&self, state: &mut RouteState, address: Ipv4Net, interface: &Interface) -> Result<()> {
        let host = Ipv4Net::from(address.addr());
        for net in [host, address.trunc()] {
            if state.routes.iter().any(|r| r.is(&net, &Nexthop::Local)) {
                debug!(network = %net, "Local route already present");
                continue;
            }
            let route = Route {
                network: net,
                nexthop: Nexthop::Local,
                interface: interface.clone(),
                cost: Some(0),
            };
            self.install(&route, interface)?;
            state.routes.push(route);
        }
        Ok(())
    }

    fn remove_local(&self, state: &mut RouteState, address: Ipv4Net, interface: &Interface) -> Result<()> {
        let host = Ipv4Net::from(address.addr());
        let network = address.trunc();

        let pos = state
            .addresses
            .iter()
            .position(|(a, i)| *a == address && i.index == interface.index)
            .ok_or_else(|| RouterError::RouteNotFound {
                network: address,
                nexthop: Nexthop::Local.to_string(),
            })?;
        state.addresses.remove(pos);

        if network != host {
            let owner = state
                .addresses
                .iter()
                .find(|(a, _)| a.trunc() == network)
                .map(|(_, i)| i.clone());

            match owner {
                Some(owner) => {
                    let moved = state
                        .routes
                        .iter_mut()
                        .find(|r| r.is(&network, &Nexthop::Local) && r.interface.index != owner.index);
                    if let Some(route) = moved {
                        route.interface = owner.clone();
                        let route = route.clone();
                        self.install(&route, &owner)?;
                        debug!(network = %network, interface = %owner.name, "Connected network moved to remaining address");
                    }
                }
                None => {
                    state.routes.retain(|r| !r.is(&network, &Nexthop::Local));
                    self.find_new_active_nexthop(&state.routes, &network, Ipv4Addr::UNSPECIFIED)?;
                    self.remove_stranded(state, &network)?;
                }
            }
        }

        if !state.addresses.iter().any(|(a, _)| a.addr() == address.addr()) {
            state.routes.retain(|r| !r.is(&host, &Nexthop::Local));
            self.find_new_active_nexthop(&state.routes, &host, Ipv4Addr::UNSPECIFIED)?;
        }
        Ok(())
    }

    /// Drop routes with a nexthop in `network` that no connected network reaches anymore.
    fn remove_stranded(&self, state: &mut RouteState, network: &Ipv4Net) -> Result<()> {
        let stranded: Vec<Route> = state
            .routes
            .iter()
            .filter(|r| match r.nexthop {
                Nexthop::Via(ip) => {
                    !ip.is_unspecified()
                        && network.contains(&ip)
                        && Self::search_interface(&state.routes, ip).is_err()
                }
                Nexthop::Local => false,
            })
            .cloned()
            .collect();

        for route in stranded {
            debug!(network = %route.network, nexthop = %route.nexthop, "Removing route with unreachable nexthop");
            state.routes.retain(|r| !r.is(&route.network, &route.nexthop));
            self.find_new_active_nexthop(&state.routes, &route.network, route.nexthop.addr())?;
        }
        Ok(())
    }

    /// Register a route and re-decide the installed entry of its network.
    ///
    /// Without an explicit interface, the egress interface is derived from the
    /// local network containing the nexthop.
    pub fn add_route(
        &self,
        network: Ipv4Net,
        nexthop: Nexthop,
        interface: Option<Interface>,
        cost: Option<u32>,
    ) -> Result<()> {
        let network = network.trunc();
        if nexthop.is_local() {
            return Err(RouterError::InvalidArgument(
                "local routes are derived from port addresses".to_string(),
            ));
        }

        let mut state = self.lock();
        let routes = &mut state.routes;
        if routes.iter().any(|r| r.is(&network, &nexthop)) {
            return Err(RouterError::DuplicateRoute {
                network,
                nexthop: nexthop.to_string(),
            });
        }
        if routes.iter().any(|r| r.is(&network, &Nexthop::Local)) {
            info!(network = %network, "Local entry exists, route ignored");
            return Err(RouterError::LocalRouteExists(network));
        }

        let interface = match interface {
            Some(interface) => interface,
            None => Self::search_interface(&routes, nexthop.addr())?,
        };
        let route = Route {
            network,
            nexthop,
            interface,
            cost,
        };

        let best = routes
            .iter()
            .filter(|r| r.network == network)
            .fold(None::<&Route>, |best, r| match best {
                Some(b) if b.effective_cost() <= r.effective_cost() => Some(b),
                _ => Some(r),
            });

        match best {
            Some(best) if best.effective_cost() <= route.effective_cost() => {
                let interface = Self::search_interface(&routes, best.nexthop.addr())
                    .unwrap_or_else(|_| best.interface.clone());
                self.install(best, &interface)?;
            }
            _ => self.install(&route, &route.interface)?,
        }

        info!(
            network = %network,
            nexthop = %nexthop,
            interface = %route.interface.name,
            cost = route.effective_cost(),
            "Route added"
        );
        routes.push(route);
        Ok(())
    }

    /// Remove a route. Local routes can not be removed this way.
    pub fn remove_route(&self, network: Ipv4Net, nexthop: Nexthop) -> Result<()> {
        let network = network.trunc();
        if nexthop.is_local() {
            return Err(RouterError::ProtectedRoute(network));
        }

        let mut state = self.lock();
        let routes = &mut state.routes;
        let pos = routes
            .iter()
            .position(|r| r.is(&network, &nexthop))
            .ok_or_else(|| RouterError::RouteNotFound {
                network,
                nexthop: nexthop.to_string(),
            })?;
        routes.remove(pos);
        self.find_new_active_nexthop(&routes, &network, nexthop.addr())?;

        info!(network = %network, nexthop = %nexthop, "Route removed");
        Ok(())
    }

    /// Remove a route and add its replacement.
    pub fn replace_route(
        &self,
        network: Ipv4Net,
        nexthop: Nexthop,
        interface: Option<Interface>,
        cost: Option<u32>,
    ) -> Result<()> {
        self.remove_route(network, nexthop)?;
        self.add_route(network, nexthop, interface, cost)
    }

    /// Remove every non-local route.
    pub fn remove_all_routes(&self) -> Result<()> {
        let mut state = self.lock();
        let routes = &mut state.routes;
        let removable: Vec<Route> = routes
            .iter()
            .filter(|r| !r.nexthop.is_local())
            .cloned()
            .collect();

        for route in &removable {
            routes.retain(|r| !r.is(&route.network, &route.nexthop));
            self.find_new_active_nexthop(&routes, &route.network, route.nexthop.addr())?;
        }

        info!(count = removable.len(), "All routes removed");
        Ok(())
    }

    /// Remove the non-local routes leaving through port `index`. Returns how many were removed.
    pub fn remove_interface_routes(&self, index: u32) -> Result<usize> {
        let mut state = self.lock();
        let routes = &mut state.routes;
        let removable: Vec<Route> = routes
            .iter()
            .filter(|r| !r.nexthop.is_local() && r.interface.index == index)
            .cloned()
            .collect();

        for route in &removable {
            routes.retain(|r| !r.is(&route.network, &route.nexthop));
            self.find_new_active_nexthop(&routes, &route.network, route.nexthop.addr())?;
        }

        debug!(port = index, count = removable.len(), "Interface routes removed");
        Ok(removable.len())
    }

    pub fn get_route(&self, network: Ipv4Net, nexthop: Nexthop) -> Result<Route> {
        let network = network.trunc();
        self.lock()
            .routes
            .iter()
            .find(|r| r.is(&network, &nexthop))
            .cloned()
            .ok_or_else(|| RouterError::RouteNotFound {
                network,
                nexthop: nexthop.to_string(),
            })
    }

    /// All candidate routes in insertion order.
    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.clone()
    }

    /// The entry installed in the fast path for `network`, if any.
    pub fn installed_route(&self, network: Ipv4Net) -> Result<Option<InstalledRoute>> {
        let value = self.table.get(&route_key(&network.trunc()))?;
        Ok(value.map(|v| InstalledRoute {
            port: v.port,
            nexthop: raw_to_ip(v.nexthop),
            kind: v.kind(),
        }))
    }

    /// Egress interface whose directly connected network contains `nexthop`.
    pub fn search_interface_from_nexthop(&self, nexthop: Ipv4Addr) -> Result<Interface> {
        Self::search_interface(&self.lock().routes, nexthop)
    }

    fn search_interface(routes: &[Route], nexthop: Ipv4Addr) -> Result<Interface> {
        routes
            .iter()
            .filter(|r| r.nexthop.is_connected() && r.network.prefix_len() < 32)
            .find(|r| r.network.contains(&nexthop))
            .map(|r| r.interface.clone())
            .ok_or(RouterError::UnreachableNexthop(nexthop))
    }

    /// Re-decide the installed entry of `network` after a candidate with
    /// `removed` as nexthop address went away.
    fn find_new_active_nexthop(
        &self,
        routes: &[Route],
        network: &Ipv4Net,
        removed: Ipv4Addr,
    ) -> Result<()> {
        let key = route_key(network);
        let Some(installed) = self.table.get(&key)? else {
            return Ok(());
        };
        if raw_to_ip(installed.nexthop) != removed {
            return Ok(());
        }

        let candidates: Vec<&Route> = routes.iter().filter(|r| r.network == *network).collect();

        if let Some(local) = candidates.iter().find(|r| r.nexthop.is_local()) {
            return self.install(local, &local.interface);
        }

        let best = candidates.iter().fold(None::<&Route>, |best, r| match best {
            Some(b) if b.effective_cost() <= r.effective_cost() => Some(b),
            _ => Some(*r),
        });

        match best {
            Some(best) => {
                let interface = if best.nexthop.is_connected() {
                    best.interface.clone()
                } else {
                    match Self::search_interface(routes, best.nexthop.addr()) {
                        Ok(interface) => interface,
                        Err(_) => {
                            warn!(nexthop = %best.nexthop, "Nexthop not covered by a local network, keeping configured interface");
                            best.interface.clone()
                        }
                    }
                };
                debug!(network = %network, nexthop = %best.nexthop, "New active nexthop");
                self.install(best, &interface)
            }
            None => {
                self.table.remove(&key)?;
                debug!(network = %network, "Network no longer reachable");
                Ok(())
            }
        }
    }

    fn install(&self, route: &Route, interface: &Interface) -> Result<()> {
        let kind = if route.nexthop.is_local() && route.network.prefix_len() == 32 {
            RouteKind::Local
        } else {
            RouteKind::Remote
        };
        let value = RouteValue::new(interface.index, ip_to_raw(route.nexthop.addr()), kind);
        self.table.set(route_key(&route.network), value)?;
        debug!(
            network = %route.network,
            nexthop = %route.nexthop,
            port = interface.index,
            ?kind,
            "Route installed"
        );
        Ok(())
    }
}
