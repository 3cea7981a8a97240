//! 통합 테스트 공용 헬퍼 -- 기록형 네트워크 스택과 엔진 생성

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipvs_core::config::IpvsConfig;
use ipvs_engine::checksum;
use ipvs_engine::{
    Connection, LoadBalancer, LoadBalancerBuilder, NetStack, Packet, Route, RouteKind, SyncSink,
};

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 5);
pub const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const RS1: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const RS2: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 11);
pub const LB_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

/// 스택이 받은 ICMP 에러 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpRequest {
    pub icmp_type: u8,
    pub code: u8,
    pub info: u32,
    pub dst: Ipv4Addr,
}

/// 송신 패킷과 ICMP 요청을 기록하는 스택
///
/// 기본 라우트는 MTU 1500 유니캐스트이며 주소별로 덮어쓸 수 있습니다.
pub struct MockStack {
    routes: Mutex<HashMap<Ipv4Addr, Option<Route>>>,
    sent: Mutex<Vec<(Packet, Route)>>,
    icmp: Mutex<Vec<IcmpRequest>>,
}

impl MockStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            icmp: Mutex::new(Vec::new()),
        })
    }

    pub fn set_route(&self, addr: Ipv4Addr, kind: RouteKind, mtu: u32) {
        let route = Route {
            kind,
            mtu,
            src: LB_ADDR,
        };
        self.routes.lock().unwrap().insert(addr, Some(route));
    }

    pub fn remove_route(&self, addr: Ipv4Addr) {
        self.routes.lock().unwrap().insert(addr, None);
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn last_sent(&self) -> Packet {
        self.sent.lock().unwrap().last().map(|(p, _)| p.clone()).unwrap()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn icmp_requests(&self) -> Vec<IcmpRequest> {
        self.icmp.lock().unwrap().clone()
    }
}

impl NetStack for MockStack {
    fn route(&self, daddr: Ipv4Addr) -> Option<Route> {
        match self.routes.lock().unwrap().get(&daddr) {
            Some(route) => *route,
            None => Some(Route {
                kind: RouteKind::Unicast,
                mtu: 1500,
                src: LB_ADDR,
            }),
        }
    }

    fn send(&self, pkt: Packet, route: &Route) {
        self.sent.lock().unwrap().push((pkt, *route));
    }

    fn icmp_send(&self, pkt: &Packet, icmp_type: u8, code: u8, info: u32) {
        self.icmp.lock().unwrap().push(IcmpRequest {
            icmp_type,
            code,
            info,
            dst: pkt.saddr(),
        });
    }
}

/// 동기화 요청을 기록하는 sink
#[derive(Default)]
pub struct RecordingSync {
    pub synced: Mutex<Vec<(Ipv4Addr, u16)>>,
}

impl SyncSink for RecordingSync {
    fn sync_conn(&self, conn: &Connection) {
        self.synced.lock().unwrap().push((conn.caddr, conn.cport));
    }
}

impl RecordingSync {
    pub fn count(&self) -> usize {
        self.synced.lock().unwrap().len()
    }
}

/// TOML 설정으로 엔진을 생성합니다.
pub fn engine(toml: &str, stack: &Arc<MockStack>) -> LoadBalancer {
    let config = IpvsConfig::parse(toml).unwrap();
    LoadBalancerBuilder::new()
        .config(config)
        .stack(Arc::clone(stack) as Arc<dyn NetStack>)
        .build()
        .unwrap()
}

/// 전송 계층 체크섬이 올바른지 확인합니다.
pub fn transport_checksum_ok(pkt: &Packet) -> bool {
    let seg = pkt.transport();
    let pseudo =
        checksum::pseudo_header_sum(pkt.saddr(), pkt.daddr(), pkt.protocol_number(), seg.len());
    checksum::verify(seg, pseudo)
}

/// ICMP 메시지 체크섬이 올바른지 확인합니다.
pub fn icmp_checksum_ok(pkt: &Packet) -> bool {
    checksum::verify(pkt.transport(), 0)
}

/// 패킷의 `(saddr, sport, daddr, dport)`
pub fn endpoints(pkt: &Packet) -> (Ipv4Addr, u16, Ipv4Addr, u16) {
    let (sport, dport) = pkt.ports().unwrap();
    (pkt.saddr(), sport, pkt.daddr(), dport)
}
