//! Packets waiting for a neighbor address to be resolved.
//!
//! The first miss for a target sends one ARP request; later misses only
//! queue. Each reply releases exactly one queued packet, oldest first. Queues
//! never expire.

use crate::error::{Result, RouterError};
use crate::packet::{build_arp_request, ethernet_source, rewrite_ethernet};
use crate::port::Port;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Packets kept per unresolved target; the oldest is dropped beyond this.
pub const PENDING_CAPACITY: usize = 5;

/// Result of handing an ARP reply to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// One queued packet was sent; `remaining` are still waiting.
    Released { remaining: usize },
    /// Nothing was waiting for this address.
    NoPending,
}

/// Per-target queues of packets awaiting ARP resolution.
#[derive(Default)]
pub struct ArpResolver {
    pending: Mutex<HashMap<Ipv4Addr, VecDeque<Vec<u8>>>>,
}

impl ArpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, VecDeque<Vec<u8>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `packet` until `target` is resolved.
    ///
    /// Sends an ARP request out of `port` (sourced from `source_ip`) only when
    /// no packet was already waiting for `target`. Returns whether a request was sent.
    pub fn on_arp_miss(
        &self,
        target: Ipv4Addr,
        port: &Port,
        source_ip: Ipv4Addr,
        packet: Vec<u8>,
    ) -> Result<bool> {
        let mut pending = self.lock();

        let created = !pending.contains_key(&target);
        let queue = pending.entry(target).or_default();
        if queue.len() >= PENDING_CAPACITY {
            queue.pop_front();
            debug!(target_ip = %target, "Pending queue full, dropped oldest packet");
        }
        queue.push_back(packet);
        debug!(target_ip = %target, queued = queue.len(), "Packet queued for ARP resolution");

        if !created {
            return Ok(false);
        }

        let request = build_arp_request(port.mac, source_ip, target);
        port.transmit(&request)?;
        debug!(target_ip = %target, port = %port.name, source_ip = %source_ip, "ARP request sent");
        Ok(true)
    }

    /// Release one packet waiting for `sender`, now that `reply` resolved it.
    ///
    /// The packet leaves through `port` with the port MAC as source and the
    /// MAC learned from the reply as destination.
    pub fn on_arp_reply(&self, sender: Ipv4Addr, reply: &[u8], port: &Port) -> Result<ReplyOutcome> {
        let mut pending = self.lock();

        let Some(queue) = pending.get_mut(&sender) else {
            return Ok(ReplyOutcome::NoPending);
        };
        let learned = ethernet_source(reply)
            .ok_or_else(|| RouterError::InvalidArgument("malformed ARP reply".to_string()))?;

        let Some(mut frame) = queue.pop_front() else {
            pending.remove(&sender);
            return Ok(ReplyOutcome::NoPending);
        };
        let remaining = queue.len();
        if remaining == 0 {
            pending.remove(&sender);
        }

        rewrite_ethernet(&mut frame, port.mac, learned)
            .ok_or_else(|| RouterError::InvalidArgument("queued frame too short".to_string()))?;
        port.transmit(&frame)?;

        debug!(target_ip = %sender, remaining, "Pending packet released");
        Ok(ReplyOutcome::Released { remaining })
    }

    /// Number of packets waiting for `target`.
    pub fn pending(&self, target: Ipv4Addr) -> usize {
        self.lock().get(&target).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortIo;
    use std::io;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl PortIo for Recorder {
        fn transmit(&self, frame: &[u8]) -> io::Result<()> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    const PORT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const NEIGHBOR_MAC: [u8; 6] = [0x52, 0x54, 0, 0, 0, 5];
    const TARGET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn port(io: Arc<Recorder>) -> Port {
        Port::new("eth0", 1, PORT_MAC, "10.0.0.1/24".parse().unwrap(), io)
    }

    fn frame(tag: u8) -> Vec<u8> {
        let mut f = vec![0u8; 64];
        f[12] = 0x08;
        f[20] = tag;
        f
    }

    fn reply() -> Vec<u8> {
        let mut f = vec![0u8; 42];
        f[..6].copy_from_slice(&PORT_MAC);
        f[6..12].copy_from_slice(&NEIGHBOR_MAC);
        f[12] = 0x08;
        f[13] = 0x06;
        f
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let io = Arc::new(Recorder::default());
        let port = port(Arc::clone(&io));
        let resolver = ArpResolver::new();
        for tag in 0..7 {
            resolver.on_arp_miss(TARGET, &port, SOURCE, frame(tag)).unwrap();
        }
        assert_eq!(resolver.pending(TARGET), PENDING_CAPACITY);

        resolver.on_arp_reply(TARGET, &reply(), &port).unwrap();
        let frames = io.frames.lock().unwrap();
        // One request, then the oldest surviving packet (tag 2)
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][20], 2);
    }

    #[test]
    fn test_reply_releases_fifo_and_drops_empty_queue() {
        let io = Arc::new(Recorder::default());
        let port = port(Arc::clone(&io));
        let resolver = ArpResolver::new();
        resolver.on_arp_miss(TARGET, &port, SOURCE, frame(1)).unwrap();
        resolver.on_arp_miss(TARGET, &port, SOURCE, frame(2)).unwrap();

        assert_eq!(
            resolver.on_arp_reply(TARGET, &reply(), &port).unwrap(),
            ReplyOutcome::Released { remaining: 1 }
        );
        assert_eq!(
            resolver.on_arp_reply(TARGET, &reply(), &port).unwrap(),
            ReplyOutcome::Released { remaining: 0 }
        );
        assert_eq!(
            resolver.on_arp_reply(TARGET, &reply(), &port).unwrap(),
            ReplyOutcome::NoPending
        );

        let frames = io.frames.lock().unwrap();
        assert_eq!(frames[1][20], 1);
        assert_eq!(frames[2][20], 2);
        assert_eq!(&frames[1][..6], &NEIGHBOR_MAC);
        assert_eq!(&frames[1][6..12], &PORT_MAC);
    }

    #[test]
    fn test_new_request_after_queue_drained() {
        let io = Arc::new(Recorder::default());
        let port = port(Arc::clone(&io));
        let resolver = ArpResolver::new();
        assert!(resolver.on_arp_miss(TARGET, &port, SOURCE, frame(1)).unwrap());
        resolver.on_arp_reply(TARGET, &reply(), &port).unwrap();
        assert!(resolver.on_arp_miss(TARGET, &port, SOURCE, frame(2)).unwrap());
    }
}
