//! Packets punted by the fast path.
//!
//! Every punted packet carries a reason code and three metadata words whose
//! meaning depends on the reason. Addresses in the metadata are in network
//! byte order, as the fast path laid them out.
//!
//! | Reason            | md[0]          | md[1]          | md[2]          |
//! |-------------------|----------------|----------------|----------------|
//! | `ArpReply`        | sender ip      |                |                |
//! | `ArpLookupMiss`   | target ip      | egress port    | egress port ip |
//! | `TtlExceeded`     | ingress port ip|                |                |
//! | `PacketForRouter` | source ip      | destination ip | ip protocol    |

use crate::arp::ReplyOutcome;
use crate::error::{Result, RouterError};
use crate::net::raw_to_ip;
use crate::packet::{build_echo_reply, build_time_exceeded};
use crate::port::Port;
use crate::router::Router;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Size of the packet-in record header: in_port, reason, metadata[3].
pub const PACKET_IN_HEADER_LEN: usize = 20;

const IPPROTO_ICMP: u32 = 1;

/// Why the fast path handed a packet to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlowPathReason {
    ArpReply = 1,
    ArpLookupMiss = 2,
    TtlExceeded = 3,
    PacketForRouter = 4,
}

impl TryFrom<u32> for SlowPathReason {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            1 => Ok(SlowPathReason::ArpReply),
            2 => Ok(SlowPathReason::ArpLookupMiss),
            3 => Ok(SlowPathReason::TtlExceeded),
            4 => Ok(SlowPathReason::PacketForRouter),
            other => Err(other),
        }
    }
}

/// Packet-in record decoding errors.
#[derive(Debug, Error)]
pub enum PuntError {
    #[error("Record too short: {0} bytes")]
    Truncated(usize),
}

/// A punted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    /// Index of the port the packet arrived on
    pub in_port: u32,
    /// Raw reason code
    pub reason: u32,
    pub metadata: [u32; 3],
    /// The Ethernet frame
    pub payload: Vec<u8>,
}

impl PacketIn {
    pub fn new(in_port: u32, reason: SlowPathReason, metadata: [u32; 3], payload: Vec<u8>) -> Self {
        Self {
            in_port,
            reason: reason as u32,
            metadata,
            payload,
        }
    }

    /// Decode a record as written by the fast path: a native-endian header
    /// followed by the frame.
    pub fn decode(record: &[u8]) -> std::result::Result<Self, PuntError> {
        if record.len() < PACKET_IN_HEADER_LEN {
            return Err(PuntError::Truncated(record.len()));
        }
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&record[i * 4..i * 4 + 4]);
            u32::from_ne_bytes(buf)
        };
        Ok(Self {
            in_port: word(0),
            reason: word(1),
            metadata: [word(2), word(3), word(4)],
            payload: record[PACKET_IN_HEADER_LEN..].to_vec(),
        })
    }

    /// Encode in the fast-path record layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(PACKET_IN_HEADER_LEN + self.payload.len());
        for word in [self.in_port, self.reason]
            .into_iter()
            .chain(self.metadata)
        {
            record.extend_from_slice(&word.to_ne_bytes());
        }
        record.extend_from_slice(&self.payload);
        record
    }
}

impl Router {
    /// Handle one punted packet. Failures are logged and the packet dropped.
    pub fn packet_in(&self, packet: PacketIn) {
        let reason = match SlowPathReason::try_from(packet.reason) {
            Ok(reason) => reason,
            Err(code) => {
                error!(code, in_port = packet.in_port, "Unknown slow path reason");
                return;
            }
        };

        if let Err(e) = self.handle_packet_in(reason, packet) {
            warn!(?reason, error = %e, "Dropping punted packet");
        }
    }

    fn handle_packet_in(&self, reason: SlowPathReason, packet: PacketIn) -> Result<()> {
        let PacketIn {
            in_port,
            metadata: md,
            payload,
            ..
        } = packet;
        debug!(?reason, in_port, len = payload.len(), "Packet in");

        match reason {
            SlowPathReason::TtlExceeded => {
                let port = self.ingress(in_port)?;
                let router_ip = raw_to_ip(md[0]);
                let error = build_time_exceeded(&payload, router_ip)
                    .ok_or_else(|| malformed("TTL exceeded"))?;
                port.transmit(&error)?;
                debug!(port = %port.name, "ICMP time exceeded sent");
            }
            SlowPathReason::ArpLookupMiss => {
                let target = raw_to_ip(md[0]);
                let port = self.ingress(md[1])?;
                let source = raw_to_ip(md[2]);
                self.resolver.on_arp_miss(target, &port, source, payload)?;
            }
            SlowPathReason::ArpReply => {
                let port = self.ingress(in_port)?;
                let sender = raw_to_ip(md[0]);
                let outcome = self.resolver.on_arp_reply(sender, &payload, &port)?;
                if outcome == ReplyOutcome::NoPending {
                    match &self.stack {
                        Some(stack) => {
                            stack.inject(&port, &payload)?;
                            debug!(sender = %sender, "ARP reply forwarded to namespace");
                        }
                        None => debug!(sender = %sender, "No packet waiting for ARP reply"),
                    }
                }
            }
            SlowPathReason::PacketForRouter => {
                if md[2] != IPPROTO_ICMP {
                    debug!(protocol = md[2], "Ignoring non-ICMP packet for router");
                    return Ok(());
                }
                let port = self.ingress(in_port)?;
                let src = raw_to_ip(md[0]);
                let dst = raw_to_ip(md[1]);
                match build_echo_reply(&payload, dst, src) {
                    Some(reply) => {
                        port.transmit(&reply)?;
                        debug!(to = %src, "ICMP echo reply sent");
                    }
                    None => debug!(from = %src, "Ignoring ICMP packet other than echo request"),
                }
            }
        }
        Ok(())
    }

    fn ingress(&self, index: u32) -> Result<Arc<Port>> {
        self.ports
            .lookup_index(index)
            .ok_or_else(|| RouterError::PortNotFound(index.to_string()))
    }
}

fn malformed(what: &str) -> RouterError {
    RouterError::InvalidArgument(format!("malformed {} packet", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(SlowPathReason::try_from(1), Ok(SlowPathReason::ArpReply));
        assert_eq!(SlowPathReason::try_from(4), Ok(SlowPathReason::PacketForRouter));
        assert_eq!(SlowPathReason::try_from(9), Err(9));
    }

    #[test]
    fn test_decode_record() {
        let packet = PacketIn::new(
            3,
            SlowPathReason::ArpLookupMiss,
            [0x0500000a, 2, 0x0100000a],
            vec![0xaa; 60],
        );
        let decoded = PacketIn::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            PacketIn::decode(&[0u8; 12]),
            Err(PuntError::Truncated(12))
        ));
        assert!(PacketIn::decode(&[0u8; PACKET_IN_HEADER_LEN]).unwrap().payload.is_empty());
    }
}
