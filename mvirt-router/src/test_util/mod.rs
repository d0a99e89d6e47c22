//! Test utilities for mvirt-router integration tests.
//!
//! Provides ports that capture transmitted frames, a namespace stack that
//! records injected frames and packet builders for the slow path.

pub mod packets;

pub use packets::*;

use crate::config::PortConfig;
use crate::net::ip_to_raw;
use crate::port::{Port, PortIo};
use crate::router::Router;
use crate::shadow::StackInjector;
use crate::slowpath::{PacketIn, SlowPathReason};
use crate::tables::FastPathTables;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// A port transmit side that records every frame.
#[derive(Default)]
pub struct CapturePort {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CapturePort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames transmitted so far, oldest first.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Drain the captured frames.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PortIo for CapturePort {
    fn transmit(&self, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// A namespace stack that records injected frames with the port index.
#[derive(Default)]
pub struct RecordingStack {
    frames: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl RecordingStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<(u32, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }
}

impl StackInjector for RecordingStack {
    fn inject(&self, port: &Port, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().unwrap().push((port.index, frame.to_vec()));
        Ok(())
    }
}

/// A router backed by in-memory fast-path tables.
pub fn test_router() -> Router {
    Router::new("test-router", FastPathTables::in_memory())
}

/// A shadow router injecting into `stack`.
pub fn test_shadow_router(stack: Arc<RecordingStack>) -> Router {
    test_router().with_stack(stack)
}

/// Port configuration with a /24 primary address and a fixed MAC.
pub fn test_port_config(name: &str, ip: Ipv4Addr, mac: [u8; 6]) -> PortConfig {
    PortConfig {
        name: name.to_string(),
        ip: ip.to_string(),
        netmask: "255.255.255.0".to_string(),
        mac: Some(crate::net::format_mac(&mac)),
        ..Default::default()
    }
}

/// Add a /24 port whose transmitted frames are captured.
pub fn add_capture_port(
    router: &Router,
    name: &str,
    index: u32,
    ip: Ipv4Addr,
    mac: [u8; 6],
) -> (Arc<Port>, Arc<CapturePort>) {
    let capture = CapturePort::new();
    let port = router
        .add_port(&test_port_config(name, ip, mac), index, capture.clone())
        .unwrap();
    (port, capture)
}

/// Packet-in record as the fast path reports an ARP lookup miss.
pub fn arp_miss(in_port: u32, target: Ipv4Addr, out_port: u32, source: Ipv4Addr, frame: Vec<u8>) -> PacketIn {
    PacketIn::new(
        in_port,
        SlowPathReason::ArpLookupMiss,
        [ip_to_raw(target), out_port, ip_to_raw(source)],
        frame,
    )
}

/// Packet-in record for an ARP reply from `sender`.
pub fn arp_reply(in_port: u32, sender: Ipv4Addr, frame: Vec<u8>) -> PacketIn {
    PacketIn::new(in_port, SlowPathReason::ArpReply, [ip_to_raw(sender), 0, 0], frame)
}

/// Packet-in record for a datagram whose TTL ran out at `port_ip`.
pub fn ttl_exceeded(in_port: u32, port_ip: Ipv4Addr, frame: Vec<u8>) -> PacketIn {
    PacketIn::new(in_port, SlowPathReason::TtlExceeded, [ip_to_raw(port_ip), 0, 0], frame)
}

/// Packet-in record for a datagram addressed to the router.
pub fn for_router(in_port: u32, src: Ipv4Addr, dst: Ipv4Addr, protocol: u32, frame: Vec<u8>) -> PacketIn {
    PacketIn::new(
        in_port,
        SlowPathReason::PacketForRouter,
        [ip_to_raw(src), ip_to_raw(dst), protocol],
        frame,
    )
}
