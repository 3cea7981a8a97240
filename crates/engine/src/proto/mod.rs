//! 프로토콜 디스크립터 — 전송 계층별 조회/스케줄/상태/NAT 동작
//!
//! [`ProtocolHandler`]는 TCP, UDP, ICMP 각각에 대해 하나씩 구현되며
//! [`ProtocolRegistry`]가 프로토콜 번호로 찾아 줍니다. 지원 프로토콜 집합은
//! 고정되어 있으므로 레지스트리는 생성 시점에 모든 핸들러를 만들어 둡니다.
//!
//! # 방향
//! ```text
//! client ──Input──▶ LB ──▶ real server      (ip_vs_in)
//! client ◀──Output── LB ◀── real server      (ip_vs_out, NAT만)
//! ```
//! 응답이 로드밸런서를 거치지 않는 연결(DR/터널)은 `InputOnly` 표를 씁니다.

pub mod icmp;
pub mod tcp;
pub mod udp;

use std::net::Ipv4Addr;
use std::time::Duration;

use ipvs_core::config::TimeoutConfig;
use ipvs_core::types::Protocol;

use crate::checksum;
use crate::conn::{ConnHandle, ConnTable, Connection};
use crate::packet::{InnerHeader, Packet};
use crate::pipeline::Verdict;
use crate::state::LoadBalancerState;

pub use icmp::IcmpHandler;
pub use tcp::TcpHandler;
pub use udp::UdpHandler;

/// 패킷에서 추출한 흐름 식별자 (패킷 방향 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub protocol: Protocol,
    pub saddr: Ipv4Addr,
    pub sport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

impl FlowTuple {
    /// 패킷 헤더에서 흐름을 추출합니다. TCP/UDP는 포트가 있어야 합니다.
    pub fn from_packet(pkt: &Packet) -> Option<Self> {
        let protocol = pkt.protocol()?;
        let (sport, dport) = match protocol {
            Protocol::Tcp | Protocol::Udp => pkt.ports()?,
            _ => (0, 0),
        };
        Some(Self {
            protocol,
            saddr: pkt.saddr(),
            sport,
            daddr: pkt.daddr(),
            dport,
        })
    }

    /// ICMP 에러에 실린 원본 헤더에서 흐름을 추출합니다.
    pub fn from_inner(inner: &InnerHeader) -> Option<Self> {
        let protocol = Protocol::from_number(inner.protocol)?;
        let (sport, dport) = match protocol {
            Protocol::Tcp | Protocol::Udp => inner.ports?,
            _ => (0, 0),
        };
        Some(Self {
            protocol,
            saddr: inner.saddr,
            sport,
            daddr: inner.daddr,
            dport,
        })
    }
}

/// 상태 전이 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 클라이언트 → 실서버
    Input,
    /// 실서버 → 클라이언트
    Output,
    /// 응답이 보이지 않는 연결의 입력
    InputOnly,
}

/// 신규 흐름 스케줄 결과
pub enum ScheduleOutcome {
    /// 연결이 생성됨 (또는 동시 생성된 기존 연결)
    Conn(Packet, ConnHandle),
    /// 로드밸런싱 대상이 아님 — 그대로 통과
    Pass(Packet),
    /// 처리 종료 (leave 경로의 통과/드롭/송신)
    Verdict(Verdict),
}

/// 전송 계층 프로토콜 디스크립터
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn name(&self) -> &'static str {
        self.protocol().as_str()
    }

    /// 처리에 필요한 최소 전송 헤더 길이
    fn min_header_len(&self) -> usize;

    /// 단편 상태로 처리할 수 있는지 (아니면 재조립 필요)
    fn tolerates_fragments(&self) -> bool {
        false
    }

    /// 클라이언트 → 가상 서비스 방향 조회
    ///
    /// `inverse`면 흐름이 반대 방향(ICMP에 실린 원본 헤더)입니다.
    fn conn_in_get(&self, table: &ConnTable, flow: &FlowTuple, inverse: bool) -> Option<ConnHandle> {
        if inverse {
            table.lookup_inbound(flow.protocol, flow.daddr, flow.dport, flow.saddr, flow.sport)
        } else {
            table.lookup_inbound(flow.protocol, flow.saddr, flow.sport, flow.daddr, flow.dport)
        }
    }

    /// 실서버 → 클라이언트 방향 조회
    fn conn_out_get(&self, table: &ConnTable, flow: &FlowTuple, inverse: bool) -> Option<ConnHandle> {
        if inverse {
            table.lookup_outbound(flow.protocol, flow.daddr, flow.dport, flow.saddr, flow.sport)
        } else {
            table.lookup_outbound(flow.protocol, flow.saddr, flow.sport, flow.daddr, flow.dport)
        }
    }

    /// 연결 테이블에 없는 인바운드 패킷을 스케줄합니다.
    fn conn_schedule(&self, state: &LoadBalancerState, pkt: Packet, flow: &FlowTuple) -> ScheduleOutcome;

    /// 새 연결의 초기 상태
    fn initial_state(&self) -> u8;

    fn timeout(&self, state: u8) -> Duration;

    fn state_name(&self, state: u8) -> &'static str;

    /// 패킷에 따라 연결 상태를 전이합니다. 전이가 일어나면 `true`.
    fn state_transition(&self, conn: &Connection, dir: Direction, pkt: &Packet) -> bool;

    /// 전송 계층 체크섬 검증
    fn csum_check(&self, pkt: &Packet) -> bool;

    /// 응답의 출발지 포트를 가상 포트로 바꾸고 체크섬을 맞춥니다.
    ///
    /// 호출 후 IP 출발지 주소는 호출자가 `vaddr`로 바꿉니다.
    fn snat_handler(&self, _pkt: &mut Packet, _conn: &Connection) -> bool {
        true
    }

    /// 요청의 목적지 포트를 실서버 포트로 바꾸고 체크섬을 맞춥니다.
    ///
    /// 호출 후 IP 목적지 주소는 호출자가 `daddr`로 바꿉니다.
    fn dnat_handler(&self, _pkt: &mut Packet, _conn: &Connection) -> bool {
        true
    }
}

/// TCP/UDP 공통 NAT 재작성 파라미터
pub(crate) struct PortRewrite {
    /// 전송 헤더 내 포트 오프셋 (0 = sport, 2 = dport)
    pub port_off: usize,
    /// 전송 헤더 내 체크섬 오프셋
    pub csum_off: usize,
    pub old_addr: Ipv4Addr,
    pub new_addr: Ipv4Addr,
    pub new_port: u16,
    /// 체크섬 0은 "체크섬 없음" (UDP)
    pub zero_means_none: bool,
    /// 재작성 후 IP 주소 (전체 재계산용)
    pub final_src: Ipv4Addr,
    pub final_dst: Ipv4Addr,
}

/// 포트를 재작성하고 전송 계층 체크섬을 갱신합니다.
///
/// 페이로드가 바뀐 패킷은 전체 재계산, 그 외에는 RFC 1624 증분 갱신을 씁니다.
pub(crate) fn rewrite_port(pkt: &mut Packet, rw: PortRewrite) -> bool {
    let Some(old_port) = pkt.transport_u16(rw.port_off) else {
        return false;
    };
    let Some(old_check) = pkt.transport_u16(rw.csum_off) else {
        return false;
    };
    pkt.set_transport_u16(rw.port_off, rw.new_port);

    if rw.zero_means_none && old_check == 0 {
        return true;
    }

    let mut check = if pkt.meta.payload_mangled {
        pkt.set_transport_u16(rw.csum_off, 0);
        checksum::transport_checksum(
            rw.final_src,
            rw.final_dst,
            pkt.protocol_number(),
            pkt.transport(),
        )
    } else {
        let c = checksum::csum_replace4(old_check, u32::from(rw.old_addr), u32::from(rw.new_addr));
        checksum::csum_replace2(c, old_port, rw.new_port)
    };
    if rw.zero_means_none && check == 0 {
        check = 0xffff;
    }
    pkt.set_transport_u16(rw.csum_off, check);
    true
}

/// 전송 계층 체크섬 검증 (pseudo-header 포함)
pub(crate) fn verify_transport(pkt: &Packet) -> bool {
    let pseudo = checksum::pseudo_header_sum(
        pkt.saddr(),
        pkt.daddr(),
        pkt.protocol_number(),
        pkt.transport().len(),
    );
    checksum::verify(pkt.transport(), pseudo)
}

/// 프로토콜 번호 → 핸들러
pub struct ProtocolRegistry {
    tcp: TcpHandler,
    udp: UdpHandler,
    icmp: IcmpHandler,
}

impl ProtocolRegistry {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            tcp: TcpHandler::new(timeouts),
            udp: UdpHandler::new(timeouts),
            icmp: IcmpHandler::new(),
        }
    }

    pub fn get(&self, protocol: u8) -> Option<&dyn ProtocolHandler> {
        match Protocol::from_number(protocol)? {
            Protocol::Tcp => Some(&self.tcp),
            Protocol::Udp => Some(&self.udp),
            Protocol::Icmp => Some(&self.icmp),
            Protocol::Ip => None,
        }
    }

    pub fn tcp(&self) -> &TcpHandler {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpHandler {
        &self.udp
    }

    pub fn icmp(&self) -> &IcmpHandler {
        &self.icmp
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new(&TimeoutConfig::default())
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries([self.tcp.name(), self.udp.name(), self.icmp.name()])
            .finish()
    }
}
