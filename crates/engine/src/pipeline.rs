//! 패킷 파이프라인 — 훅별 패킷 처리
//!
//! 호스트 패킷 경로의 네 지점에 해당하는 [`Hook`]마다 처리 함수가 있으며,
//! 모든 처리는 [`Verdict`]를 반환합니다. 실패는 에러가 아니라 드롭 사유로
//! 표현되고 메트릭으로 집계됩니다.
//!
//! # 훅 순서
//! ```text
//!                ┌──────────┐
//!   ──▶ routing ─┤ LocalIn  ├──▶ (ip_vs_in: 스케줄 + 전송)
//!                └──────────┘
//!                ┌─────────────┐   ┌─────────┐   ┌─────────────┐
//!       forward ─┤ ForwardIcmp ├──▶│ Forward ├──▶│ PostRouting ├──▶ out
//!                └─────────────┘   └─────────┘   └─────────────┘
//!                  (in_icmp)        (ip_vs_out)    (처리된 패킷 Stop)
//! ```
//!
//! NAT 응답은 `Forward`에서 SNAT되고 `ipvs_property`가 표시됩니다. 표시된 패킷은
//! 이후 어느 훅에서도 다시 재작성되지 않습니다.

use std::fmt;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use ipvs_core::metrics as m;
use ipvs_core::types::{ForwardMethod, Protocol};

use crate::conn::Connection;
use crate::packet::{Packet, PacketType, tcp_flags};
use crate::proto::icmp::{ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, is_related_error};
use crate::proto::tcp::S_ESTABLISHED;
use crate::proto::{Direction, FlowTuple, ProtocolHandler, ScheduleOutcome};
use crate::state::LoadBalancerState;
use crate::stats::EngineCounters;
use crate::xmit;

// ─── 판정 ───────────────────────────────────────────────────────────

/// 훅 처리 결과
#[derive(Debug)]
pub enum Verdict {
    /// 다음 훅/스택으로 계속 진행
    Accept(Packet),
    /// 이 훅 체인의 나머지를 건너뛰고 진행
    Stop(Packet),
    /// 로드밸런서가 패킷을 소비함 (송신 또는 재조립 대기)
    Stolen,
    /// 패킷 폐기
    Drop(DropReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    pub fn is_stolen(&self) -> bool {
        matches!(self, Self::Stolen)
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Self::Drop(reason) => Some(*reason),
            _ => None,
        }
    }

    /// 계속 진행하는 패킷 (Accept / Stop)
    pub fn packet(&self) -> Option<&Packet> {
        match self {
            Self::Accept(pkt) | Self::Stop(pkt) => Some(pkt),
            _ => None,
        }
    }

    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Self::Accept(pkt) | Self::Stop(pkt) => Some(pkt),
            _ => None,
        }
    }
}

/// 드롭 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// 헤더가 잘리거나 형식이 잘못됨
    Malformed,
    /// 체크섬 불일치
    Checksum,
    /// 선택 가능한 실서버 없음 (ICMP port-unreachable 전송됨)
    NoDestination,
    /// 연결 테이블 용량 초과
    NoMemory,
    /// 연결의 실서버가 제거되었거나 사용 불가
    DestUnavailable,
    /// 실서버로 가는 경로 없음
    NoRoute,
    /// DF 패킷이 경로 MTU 초과
    FragNeeded,
    /// 캡슐화하면 IPv4 최대 길이를 넘음
    Oversize,
    /// DR/터널 목적지가 이 호스트로 라우팅됨
    RoutingLoop,
    /// NAT 재작성 실패
    Mangle,
    /// 연결 없는 실서버 응답 (nat_icmp_send)
    NoConnection,
}

impl DropReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Checksum => "checksum",
            Self::NoDestination => "no_destination",
            Self::NoMemory => "no_memory",
            Self::DestUnavailable => "dest_unavailable",
            Self::NoRoute => "no_route",
            Self::FragNeeded => "frag_needed",
            Self::Oversize => "oversize",
            Self::RoutingLoop => "routing_loop",
            Self::Mangle => "mangle",
            Self::NoConnection => "no_connection",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── 훅 ─────────────────────────────────────────────────────────────

/// 패킷 처리 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// 로컬 전달 결정 후, 로컬 입력 전
    LocalIn,
    /// 포워딩 중, 다른 ICMP 처리 전
    ForwardIcmp,
    /// 포워딩 중, NAT 전
    Forward,
    /// post-routing NAT 직전
    PostRouting,
}

impl Hook {
    /// 처리 순서
    pub const ORDER: [Hook; 4] = [Self::LocalIn, Self::ForwardIcmp, Self::Forward, Self::PostRouting];

    /// 포워딩 경로의 훅 체인
    pub const FORWARD_CHAIN: [Hook; 3] = [Self::ForwardIcmp, Self::Forward, Self::PostRouting];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalIn => "local_in",
            Self::ForwardIcmp => "forward_icmp",
            Self::Forward => "forward",
            Self::PostRouting => "post_routing",
        }
    }
}

/// 훅 하나를 실행합니다.
pub fn process(state: &LoadBalancerState, hook: Hook, pkt: Packet) -> Verdict {
    let verdict = match hook {
        Hook::LocalIn => ip_vs_in(state, pkt),
        Hook::ForwardIcmp => forward_icmp(state, pkt),
        Hook::Forward => ip_vs_out(state, pkt),
        Hook::PostRouting => post_routing(pkt),
    };

    if let Verdict::Drop(reason) = &verdict {
        EngineCounters::bump(&state.counters.dropped);
        metrics::counter!(m::PACKETS_DROPPED_TOTAL, m::LABEL_REASON => reason.as_str()).increment(1);
        trace!(hook = hook.as_str(), %reason, "packet dropped");
    }
    verdict
}

/// 훅을 순서대로 실행합니다. `Accept`가 아닌 판정에서 멈춥니다.
pub fn process_chain(state: &LoadBalancerState, hooks: &[Hook], pkt: Packet) -> Verdict {
    let mut pkt = pkt;
    for &hook in hooks {
        match process(state, hook, pkt) {
            Verdict::Accept(next) => pkt = next,
            other => return other,
        }
    }
    Verdict::Accept(pkt)
}

// ─── 인바운드 (ip_vs_in) ────────────────────────────────────────────

/// 클라이언트 → 가상 서비스 패킷 처리
pub fn ip_vs_in(state: &LoadBalancerState, pkt: Packet) -> Verdict {
    if pkt.meta.pkt_type != PacketType::Host
        || pkt.meta.loopback
        || pkt.meta.local_socket
        || pkt.meta.ipvs_property
    {
        return Verdict::Accept(pkt);
    }

    if pkt.protocol() == Some(Protocol::Icmp) {
        return in_icmp(state, pkt);
    }

    let Some(pp) = state.protocols.get(pkt.protocol_number()) else {
        return Verdict::Accept(pkt);
    };

    let pkt = match gather(state, pkt, pp) {
        Some(pkt) => pkt,
        None => return Verdict::Stolen,
    };
    if pkt.transport().len() < pp.min_header_len() {
        return Verdict::Drop(DropReason::Malformed);
    }
    let Some(flow) = FlowTuple::from_packet(&pkt) else {
        return Verdict::Accept(pkt);
    };

    let (pkt, mut conn) = match pp.conn_in_get(&state.conns, &flow, false) {
        Some(conn) => (pkt, conn),
        None => match pp.conn_schedule(state, pkt, &flow) {
            ScheduleOutcome::Conn(pkt, conn) => (pkt, conn),
            ScheduleOutcome::Pass(pkt) => return Verdict::Accept(pkt),
            ScheduleOutcome::Verdict(verdict) => return verdict,
        },
    };

    trace!(conn = ?*conn, "inbound packet");

    if let Some(dest) = conn.dest() {
        let removed = !dest.is_in_service();
        let unavailable = !dest.is_available();
        let expire = state.config.engine.expire_nodest_conn;
        if removed || (unavailable && expire) {
            if expire {
                state.conns.expire_now(&conn);
            }
            conn.skip_refresh();
            debug!(conn = ?*conn, removed, "destination unavailable, dropping");
            return Verdict::Drop(DropReason::DestUnavailable);
        }
    }

    record_in(state, &conn, pkt.len());
    pp.state_transition(&conn, Direction::Input, &pkt);

    let verdict = xmit::transmit(state, pkt, &conn, pp);
    let pkts = conn.bump_in_pkts();
    maybe_sync(state, &conn, pkts);
    verdict
}

/// 클라이언트 쪽에서 온 ICMP 에러를 실서버로 중계합니다.
fn in_icmp(state: &LoadBalancerState, pkt: Packet) -> Verdict {
    let Some((icmp_type, _)) = pkt.icmp_type_code() else {
        return Verdict::Drop(DropReason::Malformed);
    };
    if !is_related_error(icmp_type) {
        return Verdict::Accept(pkt);
    }

    let pkt = if pkt.is_fragment() {
        match state.stack.gather_frags(pkt) {
            Some(pkt) => pkt,
            None => return Verdict::Stolen,
        }
    } else {
        pkt
    };

    let Some(inner) = pkt.icmp_inner() else {
        return Verdict::Accept(pkt);
    };
    let Some(pp) = state.protocols.get(inner.protocol) else {
        return Verdict::Accept(pkt);
    };
    if inner.fragment_offset != 0 && !pp.tolerates_fragments() {
        return Verdict::Accept(pkt);
    }
    let Some(flow) = FlowTuple::from_inner(&inner) else {
        return Verdict::Accept(pkt);
    };
    let Some(conn) = pp.conn_in_get(&state.conns, &flow, true) else {
        return Verdict::Accept(pkt);
    };

    let icmp = state.protocols.icmp();
    if !icmp.csum_check(&pkt) {
        checksum_failed(state, &pkt, "incoming");
        return Verdict::Drop(DropReason::Checksum);
    }

    record_in(state, &conn, pkt.len());
    relayed(state, "in");
    xmit::icmp_xmit(state, pkt, &conn, pp)
}

fn forward_icmp(state: &LoadBalancerState, pkt: Packet) -> Verdict {
    if pkt.protocol() != Some(Protocol::Icmp) || pkt.meta.ipvs_property {
        return Verdict::Accept(pkt);
    }
    in_icmp(state, pkt)
}

// ─── 아웃바운드 (ip_vs_out) ─────────────────────────────────────────

/// 실서버 → 클라이언트 응답 처리 (NAT 연결만 재작성)
pub fn ip_vs_out(state: &LoadBalancerState, pkt: Packet) -> Verdict {
    if pkt.meta.ipvs_property {
        return Verdict::Accept(pkt);
    }

    let pkt = if pkt.protocol() == Some(Protocol::Icmp) {
        match out_icmp(state, pkt) {
            Ok(verdict) => return verdict,
            Err(pkt) => pkt,
        }
    } else {
        pkt
    };

    let Some(pp) = state.protocols.get(pkt.protocol_number()) else {
        return Verdict::Accept(pkt);
    };
    let pkt = match gather(state, pkt, pp) {
        Some(pkt) => pkt,
        None => return Verdict::Stolen,
    };
    if pkt.transport().len() < pp.min_header_len() {
        return Verdict::Accept(pkt);
    }
    let Some(flow) = FlowTuple::from_packet(&pkt) else {
        return Verdict::Accept(pkt);
    };

    let Some(conn) = pp.conn_out_get(&state.conns, &flow, false) else {
        return no_connection(state, pkt, &flow);
    };

    if conn.forward() != ForwardMethod::Masq {
        return Verdict::Accept(pkt);
    }

    let mut pkt = pkt;
    if !pp.csum_check(&pkt) {
        checksum_failed(state, &pkt, "outgoing");
        return Verdict::Drop(DropReason::Checksum);
    }
    if !pp.snat_handler(&mut pkt, &conn) {
        return Verdict::Drop(DropReason::Mangle);
    }
    pkt.set_saddr(conn.vaddr);

    trace!(conn = ?*conn, "outbound packet after SNAT");

    record_out(state, &conn, pkt.len());
    pp.state_transition(&conn, Direction::Output, &pkt);
    pkt.meta.ipvs_property = true;
    Verdict::Accept(pkt)
}

/// 실서버 쪽에서 온 ICMP 에러를 클라이언트 방향으로 재작성합니다.
///
/// 로드밸런싱된 연결과 관련 없는 패킷은 `Err`로 돌려줍니다.
fn out_icmp(state: &LoadBalancerState, pkt: Packet) -> Result<Verdict, Packet> {
    let Some((icmp_type, _)) = pkt.icmp_type_code() else {
        return Err(pkt);
    };
    if !is_related_error(icmp_type) {
        return Err(pkt);
    }

    let pkt = if pkt.is_fragment() {
        match state.stack.gather_frags(pkt) {
            Some(pkt) => pkt,
            None => return Ok(Verdict::Stolen),
        }
    } else {
        pkt
    };

    let Some(inner) = pkt.icmp_inner() else {
        return Ok(Verdict::Accept(pkt));
    };
    let Some(pp) = state.protocols.get(inner.protocol) else {
        return Ok(Verdict::Accept(pkt));
    };
    if inner.fragment_offset != 0 && !pp.tolerates_fragments() {
        return Ok(Verdict::Accept(pkt));
    }
    let Some(flow) = FlowTuple::from_inner(&inner) else {
        return Ok(Verdict::Accept(pkt));
    };
    let Some(conn) = pp.conn_out_get(&state.conns, &flow, true) else {
        return Ok(Verdict::Accept(pkt));
    };

    if conn.forward() != ForwardMethod::Masq {
        warn!(conn = ?*conn, "outgoing ICMP for a half connection");
    }

    if !state.protocols.icmp().csum_check(&pkt) {
        checksum_failed(state, &pkt, "outgoing");
        return Ok(Verdict::Drop(DropReason::Checksum));
    }

    let mut pkt = pkt;
    if !xmit::nat_icmp(&mut pkt, &conn, true) {
        return Ok(Verdict::Drop(DropReason::Malformed));
    }
    record_out(state, &conn, pkt.len());
    relayed(state, "out");
    pkt.meta.ipvs_property = true;
    Ok(Verdict::Accept(pkt))
}

/// 연결이 없는 응답: 실서버가 보낸 것이면 port-unreachable로 알립니다.
fn no_connection(state: &LoadBalancerState, pkt: Packet, flow: &FlowTuple) -> Verdict {
    if state.config.engine.nat_icmp_send
        && matches!(flow.protocol, Protocol::Tcp | Protocol::Udp)
        && state
            .services
            .lookup_real_service(flow.protocol, flow.saddr, flow.sport)
    {
        let is_rst = flow.protocol == Protocol::Tcp
            && pkt.tcp_flags().is_some_and(|f| f & tcp_flags::RST != 0);
        if !is_rst {
            state
                .stack
                .icmp_send(&pkt, ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, 0);
            return Verdict::Drop(DropReason::NoConnection);
        }
    }
    trace!(src = %flow.saddr, sport = flow.sport, "outbound packet continues as normal");
    Verdict::Accept(pkt)
}

// ─── post-routing ───────────────────────────────────────────────────

/// 로드밸런서가 처리한 패킷은 이후의 NAT 처리를 건너뜁니다.
fn post_routing(pkt: Packet) -> Verdict {
    if pkt.meta.ipvs_property {
        Verdict::Stop(pkt)
    } else {
        Verdict::Accept(pkt)
    }
}

// ─── 공통 ───────────────────────────────────────────────────────────

/// 프로토콜이 단편을 다룰 수 없으면 재조립을 요청합니다.
fn gather(state: &LoadBalancerState, pkt: Packet, pp: &dyn ProtocolHandler) -> Option<Packet> {
    if pkt.is_fragment() && !pp.tolerates_fragments() {
        state.stack.gather_frags(pkt)
    } else {
        Some(pkt)
    }
}

fn record_in(state: &LoadBalancerState, conn: &Connection, len: usize) {
    if let Some(dest) = conn.dest() {
        dest.stats.record_in(len);
        dest.service_stats().record_in(len);
    }
    state.stats.record_in(len);
    count_packet("in", conn.protocol, len);
}

fn record_out(state: &LoadBalancerState, conn: &Connection, len: usize) {
    if let Some(dest) = conn.dest() {
        dest.stats.record_out(len);
        dest.service_stats().record_out(len);
    }
    state.stats.record_out(len);
    count_packet("out", conn.protocol, len);
}

fn count_packet(direction: &'static str, protocol: Protocol, len: usize) {
    metrics::counter!(
        m::PACKETS_TOTAL,
        m::LABEL_DIRECTION => direction,
        m::LABEL_PROTOCOL => protocol.as_str()
    )
    .increment(1);
    metrics::counter!(
        m::BYTES_TOTAL,
        m::LABEL_DIRECTION => direction,
        m::LABEL_PROTOCOL => protocol.as_str()
    )
    .increment(len as u64);
}

fn relayed(state: &LoadBalancerState, direction: &'static str) {
    EngineCounters::bump(&state.counters.icmp_relayed);
    metrics::counter!(m::ICMP_RELAYED_TOTAL, m::LABEL_DIRECTION => direction).increment(1);
}

/// 체크섬 실패를 집계합니다. 로그는 1, 2, 4, 8... 번째 실패에만 남깁니다.
fn checksum_failed(state: &LoadBalancerState, pkt: &Packet, direction: &str) {
    let n = state.counters.csum_errors.fetch_add(1, Ordering::Relaxed) + 1;
    if n.is_power_of_two() {
        warn!(
            direction,
            src = %pkt.saddr(),
            dst = %pkt.daddr(),
            failures = n,
            "checksum verification failed"
        );
    }
}

/// master 모드에서 `sync_period`개 패킷마다 연결 상태를 동기화합니다.
fn maybe_sync(state: &LoadBalancerState, conn: &Connection, pkts: u64) {
    let Some(sink) = &state.sync else {
        return;
    };
    let engine = &state.config.engine;
    if !engine.sync_master {
        return;
    }
    if conn.protocol == Protocol::Tcp && conn.state() != S_ESTABLISHED {
        return;
    }
    let period = u64::from(engine.sync_period.max(1));
    if pkts % period != u64::from(engine.sync_threshold) {
        return;
    }

    sink.sync_conn(conn);
    EngineCounters::bump(&state.counters.sync_messages);
    metrics::counter!(m::SYNC_MESSAGES_TOTAL).increment(1);
}
