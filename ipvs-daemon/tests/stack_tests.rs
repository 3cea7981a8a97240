//! Host stack adapter driven through the engine.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipvs_core::config::IpvsConfig;
use ipvs_daemon::stack::{HostStack, LogSink, PacketSink};
use ipvs_engine::packet::{build_tcp, build_udp, tcp_flags};
use ipvs_engine::{Hook, LoadBalancerBuilder, Packet, Route, RouteKind};

const CLIENT: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 5);
const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Sink that keeps every transmitted packet.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(Packet, Route)>>,
    icmp: Mutex<Vec<(u8, u8)>>,
}

impl PacketSink for RecordingSink {
    fn transmit(&self, pkt: Packet, route: &Route) {
        self.sent.lock().unwrap().push((pkt, *route));
    }

    fn icmp_error(&self, _offending: &Packet, icmp_type: u8, code: u8, _info: u32) {
        self.icmp.lock().unwrap().push((icmp_type, code));
    }
}

fn config(extra_dest: &str) -> IpvsConfig {
    IpvsConfig::parse(&format!(
        r#"
[metrics]
enabled = false

[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "rr"

[[services.destinations]]
address = "{extra_dest}"
port = 8080

[[services]]
protocol = "udp"
address = "10.0.0.1"
port = 53
scheduler = "rr"
"#
    ))
    .expect("config should parse")
}

#[test]
fn test_virtual_addresses_are_local() {
    let stack = HostStack::from_config(&config("192.168.1.10"), &[], Arc::new(LogSink::new()));
    assert!(stack.is_local(VIP));
    assert_eq!(stack.local_count(), 1);
}

#[test]
fn test_new_flow_is_transmitted_through_sink() {
    // Given: The engine running on the host stack
    let sink = Arc::new(RecordingSink::default());
    let cfg = config("192.168.1.10");
    let stack = HostStack::from_config(&cfg, &[], sink.clone());
    let lb = LoadBalancerBuilder::new()
        .config(cfg)
        .stack(Arc::new(stack))
        .build()
        .expect("engine should build");

    // When: A client opens a connection to the virtual service
    let syn = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::SYN, &[]);
    assert!(lb.process(Hook::LocalIn, syn).is_stolen());

    // Then: The rewritten packet reaches the sink on a unicast route
    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (pkt, route) = &sent[0];
    assert_eq!(pkt.daddr(), Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(route.kind, RouteKind::Unicast);
    assert_eq!(route.src, VIP);
}

#[test]
fn test_service_without_destination_sends_port_unreachable() {
    let sink = Arc::new(RecordingSink::default());
    let cfg = config("192.168.1.10");
    let stack = HostStack::from_config(&cfg, &[], sink.clone());
    let lb = LoadBalancerBuilder::new()
        .config(cfg)
        .stack(Arc::new(stack))
        .build()
        .expect("engine should build");

    let query = build_udp(CLIENT, 5353, VIP, 53, b"q");
    assert!(lb.process(Hook::LocalIn, query).drop_reason().is_some());
    assert_eq!(sink.icmp.lock().unwrap().as_slice(), &[(3, 3)]);
}

#[test]
fn test_extra_local_address_serves_destination_locally() {
    // Given: A destination on an address this host owns
    let sink = Arc::new(RecordingSink::default());
    let local = Ipv4Addr::new(10, 0, 0, 2);
    let cfg = config("10.0.0.2");
    let stack = HostStack::from_config(&cfg, &[local], sink.clone());
    let lb = LoadBalancerBuilder::new()
        .config(cfg)
        .stack(Arc::new(stack))
        .build()
        .expect("engine should build");

    // When/Then: The packet is accepted for local delivery, not transmitted
    let syn = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::SYN, &[]);
    assert!(lb.process(Hook::LocalIn, syn).is_accept());
    assert!(sink.sent.lock().unwrap().is_empty());
}
