//! 훅 파이프라인 통합 테스트 -- 전송 방식, 실패 경로, 동기화

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipvs_core::config::IpvsConfig;
use ipvs_core::types::Protocol;
use ipvs_engine::packet::{build_tcp, build_udp, tcp_flags};
use ipvs_engine::proto::tcp::S_ESTABLISHED;
use ipvs_engine::stats::EngineCounters;
use ipvs_engine::{
    DropReason, Hook, LoadBalancerBuilder, NetStack, PacketType, RouteKind, ServiceKey, SyncSink,
    Verdict,
};

use common::{CLIENT, LB_ADDR, MockStack, RS1, RecordingSync, VIP, endpoints, engine};

const NAT_SERVICE: &str = r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "rr"

[[services.destinations]]
address = "192.168.1.10"
port = 8080
"#;

fn service_with_forward(forward: &str) -> String {
    format!(
        r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "rr"
forward = "{forward}"

[[services.destinations]]
address = "192.168.1.10"
port = 80
"#
    )
}

fn syn(sport: u16) -> ipvs_engine::Packet {
    build_tcp(CLIENT, sport, VIP, 80, tcp_flags::SYN, &[])
}

fn nat_key() -> ServiceKey {
    ServiceKey::Addr(Protocol::Tcp, VIP, 80)
}

// ─── NAT ────────────────────────────────────────────────────────────

#[test]
fn test_nat_request_is_rewritten_to_real_server() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    let verdict = lb.process(Hook::LocalIn, syn(40000));
    assert!(verdict.is_stolen());
    assert_eq!(lb.state().conns.len(), 1);

    let sent = stack.last_sent();
    assert_eq!(endpoints(&sent), (CLIENT, 40000, RS1, 8080));
    assert!(sent.meta.ipvs_property);
    assert!(sent.ip_checksum_ok());
    assert!(common::transport_checksum_ok(&sent));
}

#[test]
fn test_nat_round_trip_without_double_nat() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);
    assert!(lb.process(Hook::LocalIn, syn(40000)).is_stolen());

    // 실서버 응답: FORWARD 체인 통과
    let reply = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::SYN | tcp_flags::ACK, b"hi");
    let verdict = lb.process_chain(&Hook::FORWARD_CHAIN, reply);
    assert!(matches!(verdict, Verdict::Stop(_)));

    let out = verdict.into_packet().unwrap();
    assert_eq!(endpoints(&out), (VIP, 80, CLIENT, 40000));
    assert!(out.meta.ipvs_property);
    assert!(out.ip_checksum_ok());
    assert!(common::transport_checksum_ok(&out));

    // 이미 처리된 패킷은 다시 재작성되지 않음
    let again = lb.process(Hook::Forward, out.clone()).into_packet().unwrap();
    assert_eq!(again.as_bytes(), out.as_bytes());

    let stats = lb.state().stats.snapshot();
    assert_eq!(stats.conns, 1);
    assert_eq!(stats.inpkts, 1);
    assert_eq!(stats.outpkts, 1);
}

#[test]
fn test_established_after_handshake() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    lb.process(Hook::LocalIn, syn(40000));
    let reply = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::SYN | tcp_flags::ACK, &[]);
    lb.process(Hook::Forward, reply);
    let ack = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
    assert!(lb.process(Hook::LocalIn, ack).is_stolen());

    let conn = lb
        .state()
        .conns
        .lookup_inbound(Protocol::Tcp, CLIENT, 40000, VIP, 80)
        .unwrap();
    assert_eq!(conn.state(), S_ESTABLISHED);
    assert_eq!(stack.sent_count(), 2);
}

#[test]
fn test_udp_nat_keeps_checksum_valid() {
    let stack = MockStack::new();
    let lb = engine(
        r#"
[[services]]
protocol = "udp"
address = "10.0.0.1"
port = 53
scheduler = "rr"

[[services.destinations]]
address = "192.168.1.10"
port = 5353
"#,
        &stack,
    );

    let query = build_udp(CLIENT, 5000, VIP, 53, b"query");
    assert!(lb.process(Hook::LocalIn, query).is_stolen());
    let sent = stack.last_sent();
    assert_eq!(endpoints(&sent), (CLIENT, 5000, RS1, 5353));
    assert!(common::transport_checksum_ok(&sent));

    let answer = build_udp(RS1, 5353, CLIENT, 5000, b"answer");
    let out = lb.process(Hook::Forward, answer).into_packet().unwrap();
    assert_eq!(endpoints(&out), (VIP, 53, CLIENT, 5000));
    assert!(common::transport_checksum_ok(&out));
}

#[test]
fn test_unrelated_traffic_passes() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    // 서비스가 없는 포트
    let other = build_tcp(CLIENT, 40000, VIP, 443, tcp_flags::SYN, &[]);
    assert!(lb.process(Hook::LocalIn, other).is_accept());

    // 연결이 없는 non-SYN 세그먼트
    let stray = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
    assert!(lb.process(Hook::LocalIn, stray).is_accept());

    // 다른 호스트로 향하는 패킷 / 루프백
    let mut promisc = syn(40001);
    promisc.meta.pkt_type = PacketType::OtherHost;
    assert!(lb.process(Hook::LocalIn, promisc).is_accept());
    let mut lo = syn(40002);
    lo.meta.loopback = true;
    assert!(lb.process(Hook::LocalIn, lo).is_accept());

    assert!(lb.state().conns.is_empty());
    assert_eq!(stack.sent_count(), 0);
}

#[test]
fn test_packet_for_local_socket_is_not_scheduled() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    let mut pkt = syn(40000);
    pkt.meta.local_socket = true;

    assert!(lb.process(Hook::LocalIn, pkt).is_accept());
    assert!(lb.state().conns.is_empty());
    assert_eq!(stack.sent_count(), 0);
}

#[test]
fn test_truncated_transport_header_is_dropped() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    // 8바이트 전송 헤더에 프로토콜만 TCP로 바꾼 패킷
    let mut pkt = build_udp(CLIENT, 40000, VIP, 80, &[]);
    pkt.bytes_mut()[9] = Protocol::Tcp.number();
    pkt.refresh_ip_checksum();

    let verdict = lb.process(Hook::LocalIn, pkt);
    assert_eq!(verdict.drop_reason(), Some(DropReason::Malformed));
    assert_eq!(EngineCounters::get(&lb.state().counters.dropped), 1);
}

#[test]
fn test_outbound_bad_checksum_is_dropped() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);
    lb.process(Hook::LocalIn, syn(40000));

    let mut reply = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::ACK, b"data");
    let csum_at = reply.header_len() + 16;
    reply.bytes_mut()[csum_at] ^= 0xff;

    let verdict = lb.process(Hook::Forward, reply);
    assert_eq!(verdict.drop_reason(), Some(DropReason::Checksum));
    assert_eq!(EngineCounters::get(&lb.state().counters.csum_errors), 1);
}

// ─── DR / 터널 ──────────────────────────────────────────────────────

#[test]
fn test_direct_route_leaves_headers_untouched() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("droute"), &stack);

    let pkt = syn(40000);
    let original = pkt.as_bytes().to_vec();
    assert!(lb.process(Hook::LocalIn, pkt).is_stolen());

    let sent = stack.last_sent();
    assert_eq!(sent.as_bytes(), original.as_slice());
    assert_eq!(sent.daddr(), VIP);

    // DR 연결의 응답은 로드밸런서를 거치지 않으므로 재작성 대상이 아님
    let reply = build_tcp(RS1, 80, CLIENT, 40000, tcp_flags::ACK, &[]);
    let out = lb.process(Hook::Forward, reply.clone()).into_packet().unwrap();
    assert_eq!(out.as_bytes(), reply.as_bytes());
}

#[test]
fn test_tunnel_encapsulates_in_ipip() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("tunnel"), &stack);

    let pkt = syn(40000);
    let inner_len = pkt.len();
    assert!(lb.process(Hook::LocalIn, pkt).is_stolen());

    let sent = stack.last_sent();
    assert_eq!(sent.protocol_number(), 4);
    assert_eq!(sent.saddr(), LB_ADDR);
    assert_eq!(sent.daddr(), RS1);
    assert_eq!(sent.len(), inner_len + 20);
    assert!(sent.ip_checksum_ok());
    // 내부 패킷의 목적지는 그대로 VIP
    assert_eq!(&sent.transport()[16..20], &VIP.octets());
}

#[test]
fn test_df_packet_over_mtu_gets_frag_needed() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("droute"), &stack);
    stack.set_route(RS1, RouteKind::Unicast, 576);

    let mut big = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::SYN, &[0u8; 1000]);
    big.set_dont_fragment(true);

    let verdict = lb.process(Hook::LocalIn, big);
    assert_eq!(verdict.drop_reason(), Some(DropReason::FragNeeded));

    let icmp = stack.icmp_requests();
    assert_eq!(icmp.len(), 1);
    assert_eq!((icmp[0].icmp_type, icmp[0].code, icmp[0].info), (3, 4, 576));
    assert_eq!(icmp[0].dst, CLIENT);
}

#[test]
fn test_tunnel_mtu_accounts_for_outer_header() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("tunnel"), &stack);
    stack.set_route(RS1, RouteKind::Unicast, 1500);

    // 1500바이트 DF 패킷은 캡슐화 후 1520바이트가 되므로 거부
    let mut pkt = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::SYN, &[0u8; 1460]);
    pkt.set_dont_fragment(true);
    assert_eq!(pkt.len(), 1500);

    let verdict = lb.process(Hook::LocalIn, pkt);
    assert_eq!(verdict.drop_reason(), Some(DropReason::FragNeeded));
    assert_eq!(stack.icmp_requests()[0].info, 1480);
}

#[test]
fn test_tunnel_drops_datagram_too_large_to_encapsulate() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("tunnel"), &stack);
    stack.set_route(RS1, RouteKind::Unicast, 70000);

    // DF 없는 최대 크기 데이터그램: 외부 헤더를 붙이면 65555바이트
    let pkt = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::SYN, &vec![0u8; 65495]);
    assert_eq!(pkt.len(), 65535);
    assert!(!pkt.dont_fragment());

    let verdict = lb.process(Hook::LocalIn, pkt);
    assert_eq!(verdict.drop_reason(), Some(DropReason::Oversize));
    assert_eq!(stack.sent_count(), 0);
    assert!(stack.icmp_requests().is_empty());
}

#[test]
fn test_routing_loop_is_dropped() {
    let stack = MockStack::new();
    let lb = engine(&service_with_forward("droute"), &stack);
    // 실서버 등록 후 주소가 로컬로 바뀐 경우
    stack.set_route(RS1, RouteKind::Local, 1500);

    let verdict = lb.process(Hook::LocalIn, syn(40000));
    assert_eq!(verdict.drop_reason(), Some(DropReason::RoutingLoop));
    assert_eq!(EngineCounters::get(&lb.state().counters.routing_loops), 1);
    assert_eq!(stack.sent_count(), 0);
}

#[test]
fn test_no_route_sends_host_unreachable() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);
    stack.remove_route(RS1);

    let verdict = lb.process(Hook::LocalIn, syn(40000));
    assert_eq!(verdict.drop_reason(), Some(DropReason::NoRoute));
    let icmp = stack.icmp_requests();
    assert_eq!((icmp[0].icmp_type, icmp[0].code), (3, 1));
}

#[test]
fn test_local_destination_is_accepted() {
    let stack = MockStack::new();
    stack.set_route(RS1, RouteKind::Local, 65535);
    let lb = engine(NAT_SERVICE, &stack);

    let verdict = lb.process(Hook::LocalIn, syn(40000));
    assert!(verdict.is_accept());
    assert_eq!(lb.state().conns.len(), 1);
    assert_eq!(stack.sent_count(), 0);
}

// ─── 스케줄 실패 경로 ───────────────────────────────────────────────

#[test]
fn test_no_destination_sends_port_unreachable() {
    let stack = MockStack::new();
    let lb = engine(
        r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
"#,
        &stack,
    );

    let verdict = lb.process(Hook::LocalIn, syn(40000));
    assert_eq!(verdict.drop_reason(), Some(DropReason::NoDestination));
    let icmp = stack.icmp_requests();
    assert_eq!((icmp[0].icmp_type, icmp[0].code), (3, 3));
    assert_eq!(EngineCounters::get(&lb.state().counters.schedule_failures), 1);
}

#[test]
fn test_ftp_service_passes_other_ports() {
    let stack = MockStack::new();
    let lb = engine(
        r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 21
scheduler = "rr"

[[services.destinations]]
address = "192.168.1.10"
port = 21
"#,
        &stack,
    );

    // 비지속성 FTP 서비스의 데이터 포트 요청은 로컬 스택으로 통과
    let active = build_tcp(CLIENT, 40000, VIP, 20, tcp_flags::SYN, &[]);
    assert!(lb.process(Hook::LocalIn, active).is_accept());
    let passive = build_tcp(CLIENT, 40001, VIP, 30000, tcp_flags::SYN, &[]);
    assert!(lb.process(Hook::LocalIn, passive).is_accept());

    assert!(stack.icmp_requests().is_empty());
    assert!(lb.state().conns.is_empty());
}

#[test]
fn test_cache_bypass_routes_to_original_destination() {
    let stack = MockStack::new();
    let lb = engine(
        r#"
[engine]
cache_bypass = true

[[services]]
protocol = "tcp"
fwmark = 7
scheduler = "rr"
"#,
        &stack,
    );
    let origin = Ipv4Addr::new(203, 0, 113, 9);

    let mut first = build_tcp(CLIENT, 40000, origin, 80, tcp_flags::SYN, &[]);
    first.meta.fwmark = 7;
    assert!(lb.process(Hook::LocalIn, first).is_stolen());
    assert_eq!(stack.last_sent().daddr(), origin);
    assert_eq!(lb.state().conns.len(), 1);

    // 같은 흐름의 다음 패킷은 바이패스 연결을 재사용
    let mut next = build_tcp(CLIENT, 40000, origin, 80, tcp_flags::ACK, &[]);
    next.meta.fwmark = 7;
    assert!(lb.process(Hook::LocalIn, next).is_stolen());
    assert_eq!(stack.sent_count(), 2);
    assert_eq!(lb.state().conns.len(), 1);
    assert!(stack.icmp_requests().is_empty());
}

#[test]
fn test_connection_table_full_drops_new_flows() {
    let stack = MockStack::new();
    let lb = engine(&format!("[engine]\nmax_connections = 1\n{NAT_SERVICE}"), &stack);

    assert!(lb.process(Hook::LocalIn, syn(40000)).is_stolen());
    let verdict = lb.process(Hook::LocalIn, syn(40001));
    assert_eq!(verdict.drop_reason(), Some(DropReason::NoMemory));
    assert_eq!(lb.state().conns.len(), 1);
}

// ─── 실서버 상태 변화 ───────────────────────────────────────────────

#[test]
fn test_removed_destination_drops_existing_flow() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);
    lb.process(Hook::LocalIn, syn(40000));

    lb.state()
        .services
        .remove_destination(&nat_key(), RS1, 8080)
        .unwrap();

    let ack = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
    let verdict = lb.process(Hook::LocalIn, ack);
    assert_eq!(verdict.drop_reason(), Some(DropReason::DestUnavailable));
    // expire_nodest_conn이 꺼져 있으면 연결은 타이머로 정리
    assert_eq!(lb.state().conns.len(), 1);
}

#[test]
fn test_unavailable_destination_keeps_existing_flow() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);
    lb.process(Hook::LocalIn, syn(40000));

    lb.state()
        .services
        .set_destination_available(&nat_key(), RS1, 8080, false)
        .unwrap();

    let ack = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
    assert!(lb.process(Hook::LocalIn, ack).is_stolen());

    // 신규 흐름은 받지 않음
    let verdict = lb.process(Hook::LocalIn, syn(40001));
    assert_eq!(verdict.drop_reason(), Some(DropReason::NoDestination));
}

#[test]
fn test_expire_nodest_conn_expires_on_next_packet() {
    let stack = MockStack::new();
    let lb = engine(
        &format!("[engine]\nexpire_nodest_conn = true\n{NAT_SERVICE}"),
        &stack,
    );
    lb.process(Hook::LocalIn, syn(40000));

    lb.state()
        .services
        .set_destination_available(&nat_key(), RS1, 8080, false)
        .unwrap();

    let ack = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
    let verdict = lb.process(Hook::LocalIn, ack);
    assert_eq!(verdict.drop_reason(), Some(DropReason::DestUnavailable));
    assert!(lb.state().conns.is_empty());
}

// ─── 연결 없는 응답 ─────────────────────────────────────────────────

#[test]
fn test_nat_icmp_send_rejects_stray_real_server_reply() {
    let stack = MockStack::new();
    let lb = engine(&format!("[engine]\nnat_icmp_send = true\n{NAT_SERVICE}"), &stack);

    let stray = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::ACK, &[]);
    let verdict = lb.process(Hook::Forward, stray);
    assert_eq!(verdict.drop_reason(), Some(DropReason::NoConnection));
    let icmp = stack.icmp_requests();
    assert_eq!((icmp[0].icmp_type, icmp[0].code, icmp[0].dst), (3, 3, RS1));

    // RST에는 응답하지 않음
    let rst = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::RST, &[]);
    assert!(lb.process(Hook::Forward, rst).is_accept());
    assert_eq!(stack.icmp_requests().len(), 1);
}

#[test]
fn test_stray_reply_passes_without_nat_icmp_send() {
    let stack = MockStack::new();
    let lb = engine(NAT_SERVICE, &stack);

    let stray = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::ACK, &[]);
    assert!(lb.process(Hook::Forward, stray).is_accept());
    assert!(stack.icmp_requests().is_empty());
}

// ─── 동기화 ─────────────────────────────────────────────────────────

#[test]
fn test_sync_fires_on_threshold_then_every_period() {
    let stack = MockStack::new();
    let sync = Arc::new(RecordingSync::default());
    let config = IpvsConfig::parse(
        r#"
[engine]
sync_master = true
sync_threshold = 3
sync_period = 50

[[services]]
protocol = "udp"
address = "10.0.0.1"
port = 53
scheduler = "rr"

[[services.destinations]]
address = "192.168.1.10"
port = 53
"#,
    )
    .unwrap();
    let lb = LoadBalancerBuilder::new()
        .config(config)
        .stack(Arc::clone(&stack) as Arc<dyn NetStack>)
        .sync_sink(Arc::clone(&sync) as Arc<dyn SyncSink>)
        .build()
        .unwrap();

    for n in 1..=53 {
        let pkt = build_udp(CLIENT, 5000, VIP, 53, b"q");
        assert!(lb.process(Hook::LocalIn, pkt).is_stolen());
        if n == 2 {
            assert_eq!(sync.count(), 0);
        }
        if n == 3 {
            assert_eq!(sync.count(), 1);
        }
    }
    assert_eq!(sync.count(), 2);
    assert_eq!(EngineCounters::get(&lb.state().counters.sync_messages), 2);
    assert_eq!(sync.synced.lock().unwrap()[0], (CLIENT, 5000));
}

#[test]
fn test_tcp_sync_waits_for_established() {
    let stack = MockStack::new();
    let sync = Arc::new(RecordingSync::default());
    let mut config = IpvsConfig::parse(NAT_SERVICE).unwrap();
    config.engine.sync_master = true;
    config.engine.sync_threshold = 1;
    config.engine.sync_period = 2;
    let lb = LoadBalancerBuilder::new()
        .config(config)
        .stack(Arc::clone(&stack) as Arc<dyn NetStack>)
        .sync_sink(Arc::clone(&sync) as Arc<dyn SyncSink>)
        .build()
        .unwrap();

    // SYN_RECV 상태의 첫 패킷은 동기화하지 않음
    lb.process(Hook::LocalIn, syn(40000));
    assert_eq!(sync.count(), 0);

    let reply = build_tcp(RS1, 8080, CLIENT, 40000, tcp_flags::SYN | tcp_flags::ACK, &[]);
    lb.process(Hook::Forward, reply);
    for _ in 0..2 {
        let ack = build_tcp(CLIENT, 40000, VIP, 80, tcp_flags::ACK, &[]);
        lb.process(Hook::LocalIn, ack);
    }
    // 세 번째 패킷 (3 % 2 == 1)에서 동기화
    assert_eq!(sync.count(), 1);
}
