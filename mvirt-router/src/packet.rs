//! Frames the router originates: ARP requests, ICMP echo replies and
//! ICMP time-exceeded errors.
//!
//! Builders work on owned byte vectors through smoltcp's typed views and return
//! `None` when the input frame cannot be parsed.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv4Repr,
};
use std::net::Ipv4Addr;

/// Broadcast MAC address
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// TTL of packets originated by the router.
pub const DEFAULT_TTL: u8 = 64;

/// Bytes of the offending datagram's payload quoted in ICMP errors.
const ICMP_ERROR_QUOTE: usize = 8;

/// ICMP header size for error messages (type, code, checksum, unused)
const ICMP_HDR_SIZE: usize = 8;

fn to_smoltcp(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}

/// Build a broadcast ARP request asking for `target_ip`.
pub fn build_arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: to_smoltcp(sender_ip),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: to_smoltcp(target_ip),
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(sender_mac),
        dst_addr: EthernetAddress(BROADCAST_MAC),
        ethertype: EthernetProtocol::Arp,
    };

    let mut buf = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut eth_frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth_repr.emit(&mut eth_frame);
    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    buf
}

/// Source MAC of an Ethernet frame.
pub fn ethernet_source(frame: &[u8]) -> Option<[u8; 6]> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    Some(eth.src_addr().0)
}

/// Overwrite the Ethernet addresses of a frame in place.
pub fn rewrite_ethernet(frame: &mut [u8], src: [u8; 6], dst: [u8; 6]) -> Option<()> {
    let mut eth = EthernetFrame::new_checked(frame).ok()?;
    eth.set_src_addr(EthernetAddress(src));
    eth.set_dst_addr(EthernetAddress(dst));
    Some(())
}

/// Answer an ICMP echo request addressed to the router.
///
/// `src` is the router address the request was sent to, `dst` the requester.
/// Returns `None` for anything but a well-formed echo request.
pub fn build_echo_reply(frame: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Option<Vec<u8>> {
    let eth_frame = EthernetFrame::new_checked(frame).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ipv4_packet = Ipv4Packet::new_checked(eth_frame.payload()).ok()?;
    if ipv4_packet.next_header() != IpProtocol::Icmp {
        return None;
    }
    let icmp_packet = Icmpv4Packet::new_checked(ipv4_packet.payload()).ok()?;
    if icmp_packet.msg_type() != Icmpv4Message::EchoRequest {
        return None;
    }

    let icmp_repr = Icmpv4Repr::EchoReply {
        ident: icmp_packet.echo_ident(),
        seq_no: icmp_packet.echo_seq_no(),
        data: icmp_packet.data(),
    };
    let ipv4_repr = Ipv4Repr {
        src_addr: to_smoltcp(src),
        dst_addr: to_smoltcp(dst),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: DEFAULT_TTL,
    };
    let eth_repr = EthernetRepr {
        src_addr: eth_frame.dst_addr(),
        dst_addr: eth_frame.src_addr(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let total_len = eth_repr.buffer_len() + ipv4_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buffer = vec![0u8; total_len];

    let mut eth_out = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth_out);

    let mut ipv4_out = Ipv4Packet::new_unchecked(eth_out.payload_mut());
    ipv4_repr.emit(&mut ipv4_out, &ChecksumCapabilities::default());

    let mut icmp_out = Icmpv4Packet::new_unchecked(ipv4_out.payload_mut());
    icmp_repr.emit(&mut icmp_out, &ChecksumCapabilities::default());

    Some(buffer)
}

/// Build an ICMP time-exceeded (TTL expired in transit) for a punted datagram.
///
/// The error quotes the original IP header and the first 8 bytes of its payload,
/// is sourced from `router_ip` and goes back to the original sender.
pub fn build_time_exceeded(frame: &[u8], router_ip: Ipv4Addr) -> Option<Vec<u8>> {
    let eth_frame = EthernetFrame::new_checked(frame).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ipv4_packet = Ipv4Packet::new_checked(eth_frame.payload()).ok()?;

    let header_len = ipv4_packet.header_len() as usize;
    let quoted_len = header_len + ipv4_packet.payload().len().min(ICMP_ERROR_QUOTE);
    let quoted = &eth_frame.payload()[..quoted_len];

    let ipv4_repr = Ipv4Repr {
        src_addr: to_smoltcp(router_ip),
        dst_addr: ipv4_packet.src_addr(),
        next_header: IpProtocol::Icmp,
        payload_len: ICMP_HDR_SIZE + quoted_len,
        hop_limit: DEFAULT_TTL,
    };
    let eth_repr = EthernetRepr {
        src_addr: eth_frame.dst_addr(),
        dst_addr: eth_frame.src_addr(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let total_len = eth_repr.buffer_len() + ipv4_repr.buffer_len() + ipv4_repr.payload_len;
    let mut buffer = vec![0u8; total_len];

    let mut eth_out = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth_out);

    let mut ipv4_out = Ipv4Packet::new_unchecked(eth_out.payload_mut());
    ipv4_repr.emit(&mut ipv4_out, &ChecksumCapabilities::default());

    let icmp_buf = ipv4_out.payload_mut();
    icmp_buf[ICMP_HDR_SIZE..].copy_from_slice(quoted);
    let mut icmp_out = Icmpv4Packet::new_unchecked(icmp_buf);
    icmp_out.set_msg_type(Icmpv4Message::TimeExceeded);
    icmp_out.set_msg_code(0);
    icmp_out.fill_checksum();

    Some(buffer)
}
