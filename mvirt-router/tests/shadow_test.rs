//! Shadow mode tests.
//!
//! Kernel notifications for the mirrored namespace are replayed through the
//! reconciliation entry point and the reconciliation loop.

use ipnet::Ipv4Net;
use mvirt_router::routing::Nexthop;
use mvirt_router::shadow::{self, KernelEvent};
use mvirt_router::test_util::{RecordingStack, add_capture_port, test_shadow_router};
use mvirt_router::Router;
use std::net::Ipv4Addr;
use std::sync::Arc;

const ETH0_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const ETH1_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const ETH0_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ETH1_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

fn shadow_router() -> Router {
    let router = test_shadow_router(RecordingStack::new());
    add_capture_port(&router, "eth0", 1, ETH0_IP, ETH0_MAC);
    add_capture_port(&router, "eth1", 2, ETH1_IP, ETH1_MAC);
    router
}

/// Route notifications for owned interfaces become routes.
#[test]
fn test_route_notifications_mirrored() {
    let router = shadow_router();
    assert!(router.is_shadow());

    router.handle_kernel_event(KernelEvent::route_added(1, "172.16.0.0/16/10.0.0.2").unwrap());
    let route = router
        .get_route(net("172.16.0.0/16"), Nexthop::Via(Ipv4Addr::new(10, 0, 0, 2)))
        .expect("route should be mirrored");
    assert_eq!(route.interface.name, "eth0");
    assert_eq!(route.cost, None);
    let installed = router.installed_route(net("172.16.0.0/16")).unwrap().unwrap();
    assert_eq!(installed.port, 1);

    router.handle_kernel_event(KernelEvent::route_deleted(1, "172.16.0.0/16/10.0.0.2").unwrap());
    assert!(router.installed_route(net("172.16.0.0/16")).unwrap().is_none());
}

/// Notifications for interfaces the router does not own are ignored.
#[test]
fn test_foreign_interface_filtered() {
    let router = shadow_router();
    let before = router.routes();

    router.handle_kernel_event(KernelEvent::route_added(7, "172.16.0.0/16/10.0.0.2").unwrap());
    router.handle_kernel_event(KernelEvent::link_deleted(7, "veth7"));
    router.handle_kernel_event(KernelEvent::new_address(7, "10.7.0.1/24").unwrap());

    assert_eq!(router.routes(), before);
    assert_eq!(router.ports().len(), 2);
}

/// Failing notifications leave the router untouched.
#[test]
fn test_rejected_notifications_swallowed() {
    let router = shadow_router();
    let before = router.routes();

    // The kernel reports the connected network too; the local route owns it
    router.handle_kernel_event(KernelEvent::route_added(1, "10.0.0.0/24/-").unwrap());
    // Deleting something never added
    router.handle_kernel_event(KernelEvent::route_deleted(2, "172.30.0.0/16/10.1.0.9").unwrap());

    assert_eq!(router.routes(), before);
}

/// A deleted link tears down its port.
#[test]
fn test_link_deleted_removes_port() {
    let router = shadow_router();
    router.handle_kernel_event(KernelEvent::route_added(2, "172.20.0.0/16/10.1.0.2").unwrap());
    router
        .add_arp_entry(Ipv4Addr::new(10, 1, 0, 2), [0x52, 0, 0, 0, 0, 2], "eth1")
        .unwrap();

    router.handle_kernel_event(KernelEvent::link_deleted(2, "eth1"));

    assert!(router.port("eth1").is_err());
    assert!(router.installed_route(net("10.1.0.0/24")).unwrap().is_none());
    assert!(router.installed_route(net("172.20.0.0/16")).unwrap().is_none());
    assert!(router.arp_entries().unwrap().is_empty());
    assert!(router.port("eth0").is_ok());
}

/// A new address replaces the interface's local routes.
#[test]
fn test_new_address_replaces_local_routes() {
    let router = shadow_router();
    router.handle_kernel_event(KernelEvent::new_address(1, "192.168.50.1/24").unwrap());

    assert_eq!(router.port("eth0").unwrap().ip(), Ipv4Addr::new(192, 168, 50, 1));
    assert!(router.installed_route(net("10.0.0.0/24")).unwrap().is_none());
    assert!(router.installed_route(net("10.0.0.1/32")).unwrap().is_none());
    let connected = router.installed_route(net("192.168.50.0/24")).unwrap().unwrap();
    assert_eq!(connected.port, 1);
}

/// Malformed notification payloads are rejected before they reach the router.
#[test]
fn test_malformed_notifications() {
    assert!(KernelEvent::route_added(1, "172.16.0.0/16").is_err());
    assert!(KernelEvent::route_added(1, "172.16.0.0/33/-").is_err());
    assert!(KernelEvent::new_address(1, "10.0.0.1").is_err());
}

/// The reconciliation loop applies queued events in order and ends with the channel.
#[tokio::test]
async fn test_reconcile_loop() {
    let router = Arc::new(shadow_router());
    let (tx, rx) = shadow::event_channel();
    let task = tokio::spawn(shadow::reconcile(Arc::clone(&router), rx));

    tx.send(KernelEvent::route_added(1, "172.16.0.0/16/10.0.0.2").unwrap())
        .await
        .unwrap();
    tx.send(KernelEvent::route_added(2, "172.16.0.0/16/10.1.0.2").unwrap())
        .await
        .unwrap();
    tx.send(KernelEvent::route_deleted(1, "172.16.0.0/16/10.0.0.2").unwrap())
        .await
        .unwrap();
    drop(tx);
    task.await.unwrap();

    let installed = router.installed_route(net("172.16.0.0/16")).unwrap().unwrap();
    assert_eq!(installed.nexthop, Ipv4Addr::new(10, 1, 0, 2));
    assert_eq!(installed.port, 2);
}
