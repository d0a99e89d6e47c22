//! ARP resolution tests.
//!
//! Punted lookup misses queue packets and trigger ARP requests; replies
//! release the queued packets with resolved Ethernet addresses.

use mvirt_router::arp::PENDING_CAPACITY;
use mvirt_router::test_util::{
    RecordingStack, add_capture_port, arp_miss, arp_reply, create_arp_reply, create_ipv4_udp,
    parse_arp_request, test_router, test_shadow_router,
};
use std::net::Ipv4Addr;

const ETH0_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const ETH1_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const ETH0_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ETH1_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);

/// Neighbor on eth0 that has not been resolved yet
const NEIGHBOR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const NEIGHBOR_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Sender behind eth1
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 7);
const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

/// A datagram from the client to the neighbor, tagged with `n` in its payload.
fn datagram(n: u8) -> Vec<u8> {
    create_ipv4_udp(CLIENT_MAC, ETH1_MAC, CLIENT_IP, NEIGHBOR_IP, 63, &[n; 16])
}

fn neighbor_reply() -> Vec<u8> {
    create_arp_reply(NEIGHBOR_MAC, NEIGHBOR_IP, ETH0_MAC, ETH0_IP)
}

/// The first miss sends one request; a second miss only queues.
#[test]
fn test_second_miss_sends_no_request() {
    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);
    let (_, eth1) = add_capture_port(&router, "eth1", 2, ETH1_IP, ETH1_MAC);

    router.packet_in(arp_miss(2, NEIGHBOR_IP, 1, ETH0_IP, datagram(1)));

    let frames = eth0.take();
    assert_eq!(frames.len(), 1, "exactly one ARP request expected");
    let request = parse_arp_request(&frames[0]).expect("should be an ARP request");
    assert_eq!(request.eth_dst, [0xff; 6]);
    assert_eq!(request.sender_mac, ETH0_MAC);
    assert_eq!(request.sender_ip, ETH0_IP);
    assert_eq!(request.target_ip, NEIGHBOR_IP);
    assert_eq!(router.resolver().pending(NEIGHBOR_IP), 1);

    router.packet_in(arp_miss(2, NEIGHBOR_IP, 1, ETH0_IP, datagram(2)));
    assert!(eth0.is_empty(), "no additional ARP request expected");
    assert_eq!(router.resolver().pending(NEIGHBOR_IP), 2);
    assert!(eth1.is_empty());
}

/// The queue keeps the most recent packets.
#[test]
fn test_queue_evicts_oldest() {
    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    let total = PENDING_CAPACITY as u8 + 3;
    for n in 0..total {
        router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, datagram(n)));
    }
    assert_eq!(router.resolver().pending(NEIGHBOR_IP), PENDING_CAPACITY);
    eth0.take();

    router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    let released = eth0.take();
    assert_eq!(released.len(), 1);
    // Oldest surviving packet is number 3
    assert_eq!(released[0][14..], datagram(3)[14..]);
}

/// Each reply releases one packet with rewritten Ethernet addresses.
#[test]
fn test_reply_releases_one_packet() {
    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    for n in 0..3 {
        router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, datagram(n)));
    }
    eth0.take();

    for n in 0..3u8 {
        router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
        let released = eth0.take();
        assert_eq!(released.len(), 1, "reply {} should release one packet", n);

        let frame = &released[0];
        assert_eq!(frame[0..6], NEIGHBOR_MAC, "destination should be the resolved MAC");
        assert_eq!(frame[6..12], ETH0_MAC, "source should be the port MAC");
        assert_eq!(frame[14..], datagram(n)[14..], "packets leave in arrival order");
        assert_eq!(router.resolver().pending(NEIGHBOR_IP), 2 - n as usize);
    }

    // Queue is gone: a new miss sends a fresh request
    router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, datagram(9)));
    let frames = eth0.take();
    assert_eq!(frames.len(), 1);
    assert!(parse_arp_request(&frames[0]).is_some());
}

/// Replies nobody waits for are dropped.
#[test]
fn test_unsolicited_reply_dropped() {
    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    assert!(eth0.is_empty());
}

/// In shadow mode unclaimed replies go to the mirrored namespace.
#[test]
fn test_unsolicited_reply_injected_in_shadow_mode() {
    let stack = RecordingStack::new();
    let router = test_shadow_router(stack.clone());
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    assert!(eth0.is_empty());
    assert_eq!(stack.frames(), vec![(1, neighbor_reply())]);

    // A reply that releases a packet is not injected
    router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, datagram(1)));
    router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    assert_eq!(stack.frames().len(), 1);
}

/// Queues are kept per target.
#[test]
fn test_targets_are_independent() {
    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);
    let other = Ipv4Addr::new(10, 0, 0, 6);

    router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, datagram(1)));
    router.packet_in(arp_miss(1, other, 1, ETH0_IP, datagram(2)));
    assert_eq!(eth0.take().len(), 2);

    router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    assert_eq!(router.resolver().pending(NEIGHBOR_IP), 0);
    assert_eq!(router.resolver().pending(other), 1);
}

/// Static ARP entries live in the fast-path cache.
#[test]
fn test_static_arp_entries() {
    let router = test_router();
    add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    router
        .add_arp_entry(NEIGHBOR_IP, NEIGHBOR_MAC, "eth0")
        .unwrap();
    let entry = router.get_arp_entry(NEIGHBOR_IP).unwrap();
    assert_eq!(entry.mac, NEIGHBOR_MAC);
    assert_eq!(entry.port, 1);

    router
        .replace_arp_entry(NEIGHBOR_IP, CLIENT_MAC, "eth0")
        .unwrap();
    assert_eq!(router.get_arp_entry(NEIGHBOR_IP).unwrap().mac, CLIENT_MAC);

    router.remove_arp_entry(NEIGHBOR_IP).unwrap();
    assert!(router.get_arp_entry(NEIGHBOR_IP).is_err());
    assert!(router.remove_arp_entry(NEIGHBOR_IP).is_err());
    assert!(router.add_arp_entry(NEIGHBOR_IP, NEIGHBOR_MAC, "eth9").is_err());
}

/// Misses and replies racing on one target keep the queue bounded and ordered.
#[test]
fn test_concurrent_misses_and_replies() {
    const THREADS: u8 = 4;
    const PER_THREAD: u8 = 40;

    let router = test_router();
    let (_, eth0) = add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);

    std::thread::scope(|s| {
        for thread in 0..THREADS {
            let router = &router;
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    let packet =
                        create_ipv4_udp(CLIENT_MAC, ETH1_MAC, CLIENT_IP, NEIGHBOR_IP, 63, &[thread, seq]);
                    router.packet_in(arp_miss(1, NEIGHBOR_IP, 1, ETH0_IP, packet));
                    assert!(router.resolver().pending(NEIGHBOR_IP) <= PENDING_CAPACITY);
                    if seq % 2 == 1 {
                        router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
                    }
                }
            });
        }
    });

    assert!(router.resolver().pending(NEIGHBOR_IP) <= PENDING_CAPACITY);
    while router.resolver().pending(NEIGHBOR_IP) > 0 {
        router.packet_in(arp_reply(1, NEIGHBOR_IP, neighbor_reply()));
    }

    let released: Vec<Vec<u8>> = eth0
        .take()
        .into_iter()
        .filter(|frame| parse_arp_request(frame).is_none())
        .collect();
    assert!(!released.is_empty());

    // Each sender's packets leave in the order they were queued
    let mut last_seq: [Option<u8>; THREADS as usize] = [None; THREADS as usize];
    for frame in &released {
        assert_eq!(frame[0..6], NEIGHBOR_MAC);
        let (thread, seq) = (frame[frame.len() - 2], frame[frame.len() - 1]);
        let last = &mut last_seq[thread as usize];
        assert!(last.map_or(true, |l| l < seq), "thread {} released out of order", thread);
        *last = Some(seq);
    }
}
