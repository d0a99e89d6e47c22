//! eBPF program loading and BPF map management.
//!
//! This module loads the router fast path (a TC classifier compiled separately),
//! attaches it to router ports and exposes its maps as [`FastPathTable`]s.
//! Without an installed program the manager runs in stub mode and hands out
//! in-memory tables instead.

use crate::slowpath::PacketIn;
use crate::tables::{
    self, ArpValue, FastPathTable, FastPathTables, PortValue, RouteKey, RouteValue, TableError,
};
use aya::maps::perf::{AsyncPerfEventArray, PerfBufferError};
use aya::maps::{HashMap, LpmTrie, MapData, MapError, lpm_trie::Key};
use aya::programs::{SchedClassifier, TcAttachType, tc::TcOptions};
use aya::{Bpf, BpfLoader, Pod};
use bytes::BytesMut;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default path of the installed fast-path program.
pub const DEFAULT_PROGRAM_PATH: &str = "/usr/lib/mvirt/ebpf/router";

/// Classifier entry point inside the program.
const PROGRAM_NAME: &str = "router_ingress";

const ROUTING_TABLE: &str = "ROUTING_TABLE";
const ARP_TABLE: &str = "ARP_TABLE";
const ROUTER_PORT: &str = "ROUTER_PORT";
const CONTROLLER: &str = "CONTROLLER";

/// Per-CPU buffers handed to each perf reader.
const PERF_BUFFERS: usize = 10;
const PERF_BUFFER_SIZE: usize = 2048;

/// eBPF loader errors.
#[derive(Debug, Error)]
pub enum EbpfError {
    #[error("Failed to load eBPF program: {0}")]
    Load(#[from] aya::BpfError),

    #[error("Failed to attach TC program: {0}")]
    Attach(#[from] aya::programs::ProgramError),

    #[error("Failed to access map: {0}")]
    Map(#[from] MapError),

    #[error("Failed to open perf buffer: {0}")]
    PerfBuffer(#[from] PerfBufferError),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Map not found: {0}")]
    MapNotFound(String),

    #[error("TC error: {0}")]
    Tc(String),

    #[error("Failed to list online CPUs: {0}")]
    Cpus(String),
}

pub type Result<T> = std::result::Result<T, EbpfError>;

type SharedBpf = Arc<Mutex<Bpf>>;

fn lock(bpf: &SharedBpf) -> MutexGuard<'_, Bpf> {
    bpf.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manages the loaded router program and its maps.
pub struct EbpfManager {
    bpf: Option<SharedBpf>,
}

impl EbpfManager {
    /// Create a manager in stub mode.
    pub fn stub() -> Self {
        Self { bpf: None }
    }

    /// Load the router program from the specified path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut bpf = BpfLoader::new().load_file(path)?;

        if let Err(e) = aya_log::BpfLogger::init(&mut bpf) {
            warn!(error = %e, "eBPF logger not available");
        }

        let prog: &mut SchedClassifier = bpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| EbpfError::ProgramNotFound(PROGRAM_NAME.to_string()))?
            .try_into()?;
        prog.load()?;

        info!(path = %path.display(), "eBPF router program loaded");

        Ok(Self {
            bpf: Some(Arc::new(Mutex::new(bpf))),
        })
    }

    /// Load the router program, falling back to stub mode when it is not installed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_PROGRAM_PATH));

        if !path.exists() {
            info!(path = %path.display(), "eBPF program not found, using stub implementation");
            return Ok(Self::stub());
        }

        Self::load_from_path(path)
    }

    pub fn is_stub(&self) -> bool {
        self.bpf.is_none()
    }

    /// Attach the router classifier to a port's ingress.
    pub fn attach(&self, if_index: u32, if_name: &str) -> Result<()> {
        let Some(bpf) = &self.bpf else {
            info!(if_name, if_index, "Skipping eBPF attach (stub mode)");
            return Ok(());
        };
        let mut bpf = lock(bpf);

        // Add clsact qdisc if not present
        if let Err(e) = aya::programs::tc::qdisc_add_clsact(if_name)
            && !e.to_string().contains("exists")
        {
            return Err(EbpfError::Tc(format!(
                "Failed to add clsact qdisc to {}: {}",
                if_name, e
            )));
        }

        let prog: &mut SchedClassifier = bpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| EbpfError::ProgramNotFound(PROGRAM_NAME.to_string()))?
            .try_into()?;

        prog.attach_with_options(
            if_name,
            TcAttachType::Ingress,
            TcOptions {
                priority: 1,
                handle: 1,
            },
        )?;

        info!(if_name, if_index, "TC ingress program attached");
        Ok(())
    }

    /// Table handles for the router, backed by BPF maps or by memory in stub mode.
    pub fn tables(&self) -> FastPathTables {
        match &self.bpf {
            None => FastPathTables::in_memory(),
            Some(bpf) => FastPathTables {
                routes: Arc::new(BpfRouteTable::new(Arc::clone(bpf))),
                arp: Arc::new(BpfHashTable::<u32, ArpValue>::new(Arc::clone(bpf), ARP_TABLE)),
                ports: Arc::new(BpfHashTable::<u32, PortValue>::new(
                    Arc::clone(bpf),
                    ROUTER_PORT,
                )),
            },
        }
    }

    /// Spawn one reader per online CPU delivering punted packets to `handler`.
    ///
    /// Returns no tasks in stub mode. Must be called at most once.
    pub fn spawn_packet_in_readers<F>(&self, handler: F) -> Result<Vec<JoinHandle<()>>>
    where
        F: Fn(PacketIn) + Send + Sync + 'static,
    {
        let Some(bpf) = &self.bpf else {
            info!("No packet-in source (stub mode)");
            return Ok(Vec::new());
        };

        let map = lock(bpf)
            .take_map(CONTROLLER)
            .ok_or_else(|| EbpfError::MapNotFound(CONTROLLER.to_string()))?;
        let mut events = AsyncPerfEventArray::try_from(map)?;

        let cpus = aya::util::online_cpus().map_err(|e| EbpfError::Cpus(format!("{:?}", e)))?;
        let handler = Arc::new(handler);
        let mut tasks = Vec::with_capacity(cpus.len());

        for cpu in cpus {
            let mut buf = events.open(cpu, None)?;
            let handler = Arc::clone(&handler);

            tasks.push(tokio::spawn(async move {
                let mut buffers = (0..PERF_BUFFERS)
                    .map(|_| BytesMut::with_capacity(PERF_BUFFER_SIZE))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            error!(cpu, error = %e, "Packet-in reader failed");
                            return;
                        }
                    };
                    if events.lost > 0 {
                        warn!(cpu, lost = events.lost, "Packet-in events lost");
                    }
                    for record in buffers.iter().take(events.read) {
                        match PacketIn::decode(record) {
                            Ok(packet) => handler(packet),
                            Err(e) => warn!(cpu, error = %e, "Malformed packet-in record"),
                        }
                    }
                }
            }));
        }

        debug!(readers = tasks.len(), "Packet-in readers started");
        Ok(tasks)
    }
}

impl Default for EbpfManager {
    fn default() -> Self {
        Self::stub()
    }
}

/// A BPF hash map exposed as a fast-path table.
pub struct BpfHashTable<K, V> {
    bpf: SharedBpf,
    name: &'static str,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BpfHashTable<K, V> {
    fn new(bpf: SharedBpf, name: &'static str) -> Self {
        Self {
            bpf,
            name,
            _marker: PhantomData,
        }
    }
}

impl<K, V> FastPathTable<K, V> for BpfHashTable<K, V>
where
    K: Pod + Eq + Hash,
    V: Pod,
{
    fn get(&self, key: &K) -> tables::Result<Option<V>> {
        let bpf = lock(&self.bpf);
        let map: HashMap<&MapData, K, V> = bpf
            .map(self.name)
            .ok_or_else(|| TableError::MapNotFound(self.name.to_string()))?
            .try_into()?;

        match map.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: K, value: V) -> tables::Result<()> {
        let mut bpf = lock(&self.bpf);
        let mut map: HashMap<&mut MapData, K, V> = bpf
            .map_mut(self.name)
            .ok_or_else(|| TableError::MapNotFound(self.name.to_string()))?
            .try_into()?;

        map.insert(key, value, 0)?;
        Ok(())
    }

    fn remove(&self, key: &K) -> tables::Result<bool> {
        let mut bpf = lock(&self.bpf);
        let mut map: HashMap<&mut MapData, K, V> = bpf
            .map_mut(self.name)
            .ok_or_else(|| TableError::MapNotFound(self.name.to_string()))?
            .try_into()?;

        match map.get(key, 0) {
            Ok(_) => {}
            Err(MapError::KeyNotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        map.remove(key)?;
        Ok(true)
    }

    fn get_all(&self) -> tables::Result<Vec<(K, V)>> {
        let bpf = lock(&self.bpf);
        let map: HashMap<&MapData, K, V> = bpf
            .map(self.name)
            .ok_or_else(|| TableError::MapNotFound(self.name.to_string()))?
            .try_into()?;

        Ok(map.iter().collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// The routing LPM trie exposed as an exact-match table.
///
/// Lookups on the trie are longest-prefix matches, so exact gets scan the keys.
pub struct BpfRouteTable {
    bpf: SharedBpf,
}

impl BpfRouteTable {
    fn new(bpf: SharedBpf) -> Self {
        Self { bpf }
    }

    fn entries(bpf: &Bpf) -> tables::Result<Vec<(RouteKey, RouteValue)>> {
        let trie: LpmTrie<&MapData, u32, RouteValue> = bpf
            .map(ROUTING_TABLE)
            .ok_or_else(|| TableError::MapNotFound(ROUTING_TABLE.to_string()))?
            .try_into()?;

        let mut entries = Vec::new();
        for item in trie.iter() {
            let (key, value) = item?;
            entries.push((
                RouteKey {
                    prefix_len: key.prefix_len(),
                    network: key.data(),
                },
                value,
            ));
        }
        Ok(entries)
    }
}

impl FastPathTable<RouteKey, RouteValue> for BpfRouteTable {
    fn get(&self, key: &RouteKey) -> tables::Result<Option<RouteValue>> {
        let bpf = lock(&self.bpf);
        Ok(Self::entries(&bpf)?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    fn set(&self, key: RouteKey, value: RouteValue) -> tables::Result<()> {
        let mut bpf = lock(&self.bpf);
        let mut trie: LpmTrie<&mut MapData, u32, RouteValue> = bpf
            .map_mut(ROUTING_TABLE)
            .ok_or_else(|| TableError::MapNotFound(ROUTING_TABLE.to_string()))?
            .try_into()?;

        trie.insert(&Key::new(key.prefix_len, key.network), value, 0)?;
        Ok(())
    }

    fn remove(&self, key: &RouteKey) -> tables::Result<bool> {
        let mut bpf = lock(&self.bpf);
        if !Self::entries(&bpf)?.iter().any(|(k, _)| k == key) {
            return Ok(false);
        }

        let mut trie: LpmTrie<&mut MapData, u32, RouteValue> = bpf
            .map_mut(ROUTING_TABLE)
            .ok_or_else(|| TableError::MapNotFound(ROUTING_TABLE.to_string()))?
            .try_into()?;

        trie.remove(&Key::new(key.prefix_len, key.network))?;
        Ok(true)
    }

    fn get_all(&self) -> tables::Result<Vec<(RouteKey, RouteValue)>> {
        let bpf = lock(&self.bpf);
        Self::entries(&bpf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_uses_stub() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EbpfManager::load(Some(&dir.path().join("router"))).unwrap();
        assert!(manager.is_stub());
        assert!(manager.attach(1, "eth0").is_ok());
    }

    #[test]
    fn test_stub_tables_are_usable() {
        let tables = EbpfManager::stub().tables();
        let key = RouteKey {
            prefix_len: 24,
            network: 0x0000000a,
        };
        tables
            .routes
            .set(key, RouteValue::new(1, 0, crate::tables::RouteKind::Remote))
            .unwrap();
        assert!(tables.routes.get(&key).unwrap().is_some());
    }
}
