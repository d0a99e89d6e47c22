//! Frame builders and parsers for integration tests.
//!
//! Frames start with the Ethernet header, as the fast path punts them.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv4Repr, UdpPacket, UdpRepr,
};
use std::net::Ipv4Addr;

// ============================================================================
// Constants
// ============================================================================

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// ARP packet size (Ethernet + IPv4)
pub const ARP_PKT_SIZE: usize = 28;

/// ICMP time exceeded, TTL expired in transit
pub const ICMP_TIME_EXCEEDED: u8 = 11;

fn addr(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}

fn ip(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

// ============================================================================
// ARP Packets
// ============================================================================

fn create_arp(
    operation: ArpOperation,
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
    eth_dst: [u8; 6],
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + ARP_PKT_SIZE];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(sender_mac),
        dst_addr: EthernetAddress(eth_dst),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: addr(sender_ip),
        target_hardware_addr: EthernetAddress(target_mac),
        target_protocol_addr: addr(target_ip),
    };
    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    packet
}

/// Create a broadcast ARP request
pub fn create_arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    create_arp(
        ArpOperation::Request,
        sender_mac,
        sender_ip,
        [0; 6],
        target_ip,
        [0xff; 6],
    )
}

/// Create an ARP reply from `sender` to `target`
pub fn create_arp_reply(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    create_arp(
        ArpOperation::Reply,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
        target_mac,
    )
}

/// Parsed ARP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpMessage {
    pub eth_dst: [u8; 6],
    pub is_request: bool,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP request or reply
pub fn parse_arp(packet: &[u8]) -> Option<ArpMessage> {
    let eth_frame = EthernetFrame::new_checked(packet).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Arp {
        return None;
    }

    let arp_packet = ArpPacket::new_checked(eth_frame.payload()).ok()?;
    match ArpRepr::parse(&arp_packet).ok()? {
        ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpMessage {
            eth_dst: eth_frame.dst_addr().0,
            is_request: operation == ArpOperation::Request,
            sender_mac: source_hardware_addr.0,
            sender_ip: ip(source_protocol_addr),
            target_mac: target_hardware_addr.0,
            target_ip: ip(target_protocol_addr),
        }),
        _ => None,
    }
}

/// Parse an ARP request, ignoring replies
pub fn parse_arp_request(packet: &[u8]) -> Option<ArpMessage> {
    parse_arp(packet).filter(|arp| arp.is_request)
}

// ============================================================================
// IPv4 Packets
// ============================================================================

fn emit_ipv4(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    ip_repr: &Ipv4Repr,
    emit_payload: impl FnOnce(&mut Ipv4Packet<&mut [u8]>),
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + ip_repr.payload_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress(dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    emit_payload(&mut ip_packet);

    packet
}

/// Create an ICMP echo request
pub fn create_icmp_echo_request(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    id: u16,
    seq: u16,
) -> Vec<u8> {
    let data = b"ping from test!";
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident: id,
        seq_no: seq,
        data,
    };
    let ip_repr = Ipv4Repr {
        src_addr: addr(src_ip),
        dst_addr: addr(dst_ip),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    emit_ipv4(src_mac, dst_mac, &ip_repr, |ip_packet| {
        let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());
    })
}

/// Create a UDP datagram with the given TTL
pub fn create_ipv4_udp(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let ip_repr = Ipv4Repr {
        src_addr: addr(src_ip),
        dst_addr: addr(dst_ip),
        next_header: IpProtocol::Udp,
        payload_len: UDP_HDR_SIZE + payload.len(),
        hop_limit: ttl,
    };
    let udp_repr = UdpRepr {
        src_port: 40000,
        dst_port: 33434,
    };

    emit_ipv4(src_mac, dst_mac, &ip_repr, |ip_packet| {
        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            &ChecksumCapabilities::default(),
        );
    })
}

/// Parsed ICMP echo reply
#[derive(Debug)]
pub struct IcmpEchoReply {
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ttl: u8,
    pub id: u16,
    pub seq: u16,
    pub data: Vec<u8>,
}

/// Parse an ICMP echo reply packet
pub fn parse_icmp_echo_reply(packet: &[u8]) -> Option<IcmpEchoReply> {
    let eth_frame = EthernetFrame::new_checked(packet).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let ip_packet = Ipv4Packet::new_checked(eth_frame.payload()).ok()?;
    if ip_packet.next_header() != IpProtocol::Icmp || !ip_packet.verify_checksum() {
        return None;
    }

    let icmp_packet = Icmpv4Packet::new_checked(ip_packet.payload()).ok()?;
    if icmp_packet.msg_type() != Icmpv4Message::EchoReply || !icmp_packet.verify_checksum() {
        return None;
    }

    Some(IcmpEchoReply {
        eth_src: eth_frame.src_addr().0,
        eth_dst: eth_frame.dst_addr().0,
        src_ip: ip(ip_packet.src_addr()),
        dst_ip: ip(ip_packet.dst_addr()),
        ttl: ip_packet.hop_limit(),
        id: icmp_packet.echo_ident(),
        seq: icmp_packet.echo_seq_no(),
        data: icmp_packet.data().to_vec(),
    })
}

/// Parsed ICMP time exceeded error
#[derive(Debug)]
pub struct TimeExceeded {
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub code: u8,
    /// Quoted IP header and leading payload bytes of the offending datagram
    pub quoted: Vec<u8>,
}

/// Parse an ICMP time exceeded packet
pub fn parse_time_exceeded(packet: &[u8]) -> Option<TimeExceeded> {
    let eth_frame = EthernetFrame::new_checked(packet).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let ip_packet = Ipv4Packet::new_checked(eth_frame.payload()).ok()?;
    if ip_packet.next_header() != IpProtocol::Icmp || !ip_packet.verify_checksum() {
        return None;
    }

    let icmp_packet = Icmpv4Packet::new_checked(ip_packet.payload()).ok()?;
    if u8::from(icmp_packet.msg_type()) != ICMP_TIME_EXCEEDED || !icmp_packet.verify_checksum() {
        return None;
    }

    Some(TimeExceeded {
        eth_src: eth_frame.src_addr().0,
        eth_dst: eth_frame.dst_addr().0,
        src_ip: ip(ip_packet.src_addr()),
        dst_ip: ip(ip_packet.dst_addr()),
        code: icmp_packet.msg_code(),
        quoted: icmp_packet.data().to_vec(),
    })
}

/// The IP header and first 8 payload bytes of a frame, as quoted by ICMP errors
pub fn icmp_quote(packet: &[u8]) -> Vec<u8> {
    let ip = &packet[ETHERNET_HDR_SIZE..];
    ip[..(IP_HDR_SIZE + 8).min(ip.len())].to_vec()
}
