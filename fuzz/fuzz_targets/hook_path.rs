#![no_main]

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use ipvs_core::config::IpvsConfig;
use ipvs_engine::packet::{build_icmp_error, build_tcp, build_udp};
use ipvs_engine::{Hook, LoadBalancerState, NetStack, Packet, Route, RouteKind, Verdict};

const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const RS: [Ipv4Addr; 2] = [Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 11)];

/// 퍼징용 서비스 구성: NAT, 지속성 FTP, UDP
const CONFIG: &str = r#"
[engine]
cache_bypass = true
nat_icmp_send = true
max_connections = 4096

[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "wlc"

[[services.destinations]]
address = "192.168.1.10"
port = 8080

[[services.destinations]]
address = "192.168.1.11"
port = 8080

[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 21
scheduler = "rr"
persistent = true

[[services.destinations]]
address = "192.168.1.10"
port = 21

[[services]]
protocol = "udp"
address = "10.0.0.1"
port = 53
scheduler = "wrr"
forward = "droute"

[[services.destinations]]
address = "192.168.1.11"
port = 53
weight = 3
"#;

/// 모든 패킷을 버리는 스택
struct DiscardStack;

impl NetStack for DiscardStack {
    fn route(&self, daddr: Ipv4Addr) -> Option<Route> {
        let kind = if daddr == VIP {
            RouteKind::Local
        } else {
            RouteKind::Unicast
        };
        Some(Route {
            kind,
            mtu: 1500,
            src: VIP,
        })
    }

    fn send(&self, _pkt: Packet, _route: &Route) {}

    fn icmp_send(&self, _pkt: &Packet, _icmp_type: u8, _code: u8, _info: u32) {}
}

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 패킷 목록 (최대 32개로 제한)
    steps: Vec<FuzzStep>,
}

#[derive(Arbitrary, Debug)]
struct FuzzStep {
    hook: FuzzHook,
    packet: FuzzPacket,
}

#[derive(Arbitrary, Debug)]
enum FuzzHook {
    LocalIn,
    ForwardIcmp,
    Forward,
    PostRouting,
    ForwardChain,
}

/// 생성기가 받아들이는 범위 안으로 제한
const MAX_PAYLOAD: usize = 1400;

#[derive(Arbitrary, Debug)]
enum FuzzPacket {
    /// 임의 바이트
    Raw(Vec<u8>),
    /// 클라이언트 → 가상 서비스 TCP
    TcpIn { client: u8, sport: u16, dport: u8, flags: u8, payload: Vec<u8> },
    /// 실서버 → 클라이언트 TCP 응답
    TcpOut { rs: bool, client: u8, dport: u16, flags: u8 },
    UdpIn { client: u8, sport: u16, payload: Vec<u8> },
    /// 기존 흐름에 대한 ICMP 에러
    IcmpError { client: u8, sport: u16, icmp_type: u8, code: u8, outbound: bool },
}

impl FuzzPacket {
    fn client(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(172, 16, 0, n)
    }

    fn service_port(n: u8) -> u16 {
        match n % 4 {
            0 => 80,
            1 => 21,
            2 => 53,
            _ => u16::from(n),
        }
    }

    fn payload(payload: &[u8]) -> &[u8] {
        &payload[..payload.len().min(MAX_PAYLOAD)]
    }

    fn build(self) -> Option<Packet> {
        match self {
            Self::Raw(bytes) => Packet::from_slice(&bytes).ok(),
            Self::TcpIn { client, sport, dport, flags, payload } => Some(build_tcp(
                Self::client(client),
                sport,
                VIP,
                Self::service_port(dport),
                flags,
                Self::payload(&payload),
            )),
            Self::TcpOut { rs, client, dport, flags } => Some(build_tcp(
                RS[usize::from(rs)],
                8080,
                Self::client(client),
                dport,
                flags,
                &[],
            )),
            Self::UdpIn { client, sport, payload } => {
                Some(build_udp(Self::client(client), sport, VIP, 53, Self::payload(&payload)))
            }
            Self::IcmpError { client, sport, icmp_type, code, outbound } => {
                let client = Self::client(client);
                if outbound {
                    let offending = build_tcp(client, sport, RS[0], 8080, 0x10, &[]);
                    Some(build_icmp_error(RS[0], client, icmp_type, code, 0, &offending))
                } else {
                    let offending = build_tcp(VIP, 80, client, sport, 0x10, &[]);
                    Some(build_icmp_error(client, VIP, icmp_type, code, 0, &offending))
                }
            }
        }
    }
}

/// 입력 사이에 상태를 공유하여 테이블이 채워진 경로도 탐색한다
fn state() -> &'static LoadBalancerState {
    static STATE: OnceLock<LoadBalancerState> = OnceLock::new();
    STATE.get_or_init(|| {
        let config = IpvsConfig::parse(CONFIG).expect("fuzz config parses");
        let state = LoadBalancerState::new(
            config.clone(),
            Arc::new(DiscardStack),
            None,
            Default::default(),
        );
        state
            .apply_services(&config.services)
            .expect("fuzz services register");
        state
    })
}

fuzz_target!(|input: FuzzInput| {
    let state = state();

    for step in input.steps.into_iter().take(32) {
        let Some(pkt) = step.packet.build() else {
            continue;
        };
        // verdict는 검사하지 않는다. 패닉만 없으면 된다
        match step.hook {
            FuzzHook::LocalIn => drop(state.process(Hook::LocalIn, pkt)),
            FuzzHook::ForwardIcmp => drop(state.process(Hook::ForwardIcmp, pkt)),
            FuzzHook::Forward => drop(state.process(Hook::Forward, pkt)),
            FuzzHook::PostRouting => drop(state.process(Hook::PostRouting, pkt)),
            FuzzHook::ForwardChain => {
                let mut pkt = pkt;
                for hook in Hook::FORWARD_CHAIN {
                    match state.process(hook, pkt) {
                        Verdict::Accept(next) => pkt = next,
                        _ => break,
                    }
                }
            }
        }
    }
});
