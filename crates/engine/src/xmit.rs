//! 전송 — 연결의 포워딩 방식별 패킷 송신
//!
//! | 방식          | 동작                                              |
//! |---------------|---------------------------------------------------|
//! | `Masq`        | DNAT 후 실서버로 라우팅                            |
//! | `DirectRoute` | 헤더 변경 없이 실서버로 라우팅                      |
//! | `Tunnel`      | IP-in-IP 캡슐화 후 실서버로 라우팅                  |
//! | `Local`       | 로컬 스택으로 계속 진행 (`Accept`)                  |
//! | `Bypass`      | 원래 목적지로 그대로 라우팅                          |
//!
//! 송신에 성공하면 패킷 소유권은 스택으로 넘어가고 `Stolen`을 반환합니다.

use tracing::{debug, warn};

use ipvs_core::metrics as m;
use ipvs_core::types::ForwardMethod;

use crate::checksum;
use crate::conn::Connection;
use crate::packet::{IPV4_HEADER_LEN, Packet};
use crate::pipeline::{DropReason, Verdict};
use crate::proto::ProtocolHandler;
use crate::proto::icmp::{ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED, ICMP_HOST_UNREACH};
use crate::stack::Route;
use crate::state::LoadBalancerState;
use crate::stats::EngineCounters;

/// IPv4 최소 MTU
const MIN_MTU: u32 = 68;

/// 연결의 포워딩 방식으로 패킷을 송신합니다.
pub fn transmit(
    state: &LoadBalancerState,
    pkt: Packet,
    conn: &Connection,
    pp: &dyn ProtocolHandler,
) -> Verdict {
    let verdict = match conn.forward() {
        ForwardMethod::Masq => nat_xmit(state, pkt, conn, pp),
        ForwardMethod::DirectRoute => dr_xmit(state, pkt, conn),
        ForwardMethod::Tunnel => tunnel_xmit(state, pkt, conn),
        ForwardMethod::Local => Verdict::Accept(pkt),
        ForwardMethod::Bypass => bypass_xmit(state, pkt),
    };
    if matches!(verdict, Verdict::Stolen) {
        metrics::counter!(m::XMIT_TOTAL, m::LABEL_FORWARD => conn.forward().as_str()).increment(1);
    }
    verdict
}

fn nat_xmit(
    state: &LoadBalancerState,
    mut pkt: Packet,
    conn: &Connection,
    pp: &dyn ProtocolHandler,
) -> Verdict {
    let route = match route_to(state, &pkt, conn.daddr) {
        Ok(route) => route,
        Err(verdict) => return verdict,
    };
    if let Err(verdict) = check_mtu(state, &pkt, route.mtu) {
        return verdict;
    }

    if !pp.dnat_handler(&mut pkt, conn) {
        return Verdict::Drop(DropReason::Mangle);
    }
    pkt.set_daddr(conn.daddr);
    pkt.meta.ipvs_property = true;

    state.stack.send(pkt, &route);
    Verdict::Stolen
}

fn dr_xmit(state: &LoadBalancerState, mut pkt: Packet, conn: &Connection) -> Verdict {
    let route = match route_to(state, &pkt, conn.daddr) {
        Ok(route) => route,
        Err(verdict) => return verdict,
    };
    if route.is_local() {
        return routing_loop(state, conn);
    }
    if let Err(verdict) = check_mtu(state, &pkt, route.mtu) {
        return verdict;
    }

    // 재조립된 패킷일 수 있으므로 헤더 체크섬을 다시 계산
    pkt.refresh_ip_checksum();
    pkt.meta.ipvs_property = true;
    state.stack.send(pkt, &route);
    Verdict::Stolen
}

fn tunnel_xmit(state: &LoadBalancerState, mut pkt: Packet, conn: &Connection) -> Verdict {
    let route = match route_to(state, &pkt, conn.daddr) {
        Ok(route) => route,
        Err(verdict) => return verdict,
    };
    if route.is_local() {
        return routing_loop(state, conn);
    }

    let mtu = route.mtu.saturating_sub(IPV4_HEADER_LEN as u32);
    if mtu < MIN_MTU {
        warn!(dest = %conn.daddr, mtu = route.mtu, "tunnel route mtu too small");
        return Verdict::Drop(DropReason::FragNeeded);
    }
    if let Err(verdict) = check_mtu(state, &pkt, mtu) {
        return verdict;
    }

    if let Err(err) = pkt.encapsulate_ipip(route.src, conn.daddr) {
        debug!(dest = %conn.daddr, error = %err, "cannot encapsulate");
        return Verdict::Drop(DropReason::Oversize);
    }
    pkt.meta.ipvs_property = true;
    state.stack.send(pkt, &route);
    Verdict::Stolen
}

fn bypass_xmit(state: &LoadBalancerState, pkt: Packet) -> Verdict {
    let daddr = pkt.daddr();
    let route = match route_to(state, &pkt, daddr) {
        Ok(route) => route,
        Err(verdict) => return verdict,
    };
    if let Err(verdict) = check_mtu(state, &pkt, route.mtu) {
        return verdict;
    }
    state.stack.send(pkt, &route);
    Verdict::Stolen
}

/// ICMP 에러를 연결의 실서버 쪽으로 중계합니다.
///
/// NAT 이외의 연결은 일반 전송 경로를 그대로 씁니다. NAT 연결은 외부 목적지와
/// 내장 헤더의 출발지(주소, 포트)를 실서버 값으로 바꾼 뒤 송신합니다.
pub fn icmp_xmit(
    state: &LoadBalancerState,
    mut pkt: Packet,
    conn: &Connection,
    pp: &dyn ProtocolHandler,
) -> Verdict {
    if conn.forward() != ForwardMethod::Masq {
        let verdict = transmit(state, pkt, conn, pp);
        conn.bump_in_pkts();
        return verdict;
    }

    let route = match route_to(state, &pkt, conn.daddr) {
        Ok(route) => route,
        Err(verdict) => return verdict,
    };
    if let Err(verdict) = check_mtu(state, &pkt, route.mtu) {
        return verdict;
    }

    if !nat_icmp(&mut pkt, conn, false) {
        return Verdict::Drop(DropReason::Malformed);
    }
    pkt.meta.ipvs_property = true;
    state.stack.send(pkt, &route);
    metrics::counter!(m::XMIT_TOTAL, m::LABEL_FORWARD => conn.forward().as_str()).increment(1);
    Verdict::Stolen
}

/// ICMP 에러 패킷의 외부 헤더와 내장 헤더를 연결에 맞게 재작성합니다.
///
/// - `outbound == false` (클라이언트 → 실서버): 외부 daddr, 내장 saddr/sport를 실서버로
/// - `outbound == true` (실서버 → 클라이언트): 외부 saddr, 내장 daddr/dport를 가상 서비스로
pub fn nat_icmp(pkt: &mut Packet, conn: &Connection, outbound: bool) -> bool {
    let Some(inner) = pkt.icmp_inner() else {
        return false;
    };

    if outbound {
        pkt.set_saddr(conn.vaddr);
    } else {
        pkt.set_daddr(conn.daddr);
    }

    let (addr_off, port_off, addr, port) = if outbound {
        (inner.offset + 16, inner.transport_offset() + 2, conn.vaddr, conn.vport)
    } else {
        (inner.offset + 12, inner.transport_offset(), conn.daddr, conn.dport)
    };

    let has_ports = inner.ports.is_some();
    let buf = pkt.bytes_mut();
    buf[addr_off..addr_off + 4].copy_from_slice(&addr.octets());

    // 내장 IP 헤더 체크섬
    let ihl_end = inner.offset + inner.header_len;
    buf[inner.offset + 10..inner.offset + 12].copy_from_slice(&[0, 0]);
    let check = checksum::internet_checksum(&buf[inner.offset..ihl_end]);
    buf[inner.offset + 10..inner.offset + 12].copy_from_slice(&check.to_be_bytes());

    if has_ports && matches!(inner.protocol, 6 | 17) {
        buf[port_off..port_off + 2].copy_from_slice(&port.to_be_bytes());
    }

    crate::proto::icmp::refresh_checksum(pkt);
    true
}

// ─── 공통 ───────────────────────────────────────────────────────────

fn route_to(
    state: &LoadBalancerState,
    pkt: &Packet,
    daddr: std::net::Ipv4Addr,
) -> Result<Route, Verdict> {
    match state.stack.route(daddr) {
        Some(route) => Ok(route),
        None => {
            debug!(%daddr, "no route to destination");
            state
                .stack
                .icmp_send(pkt, ICMP_DEST_UNREACH, ICMP_HOST_UNREACH, 0);
            Err(Verdict::Drop(DropReason::NoRoute))
        }
    }
}

/// DF가 설정된 패킷이 MTU를 넘으면 frag-needed를 보내고 드롭합니다.
fn check_mtu(state: &LoadBalancerState, pkt: &Packet, mtu: u32) -> Result<(), Verdict> {
    if pkt.dont_fragment() && pkt.len() > mtu as usize {
        state
            .stack
            .icmp_send(pkt, ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED, mtu);
        debug!(len = pkt.len(), mtu, "fragmentation needed");
        return Err(Verdict::Drop(DropReason::FragNeeded));
    }
    Ok(())
}

fn routing_loop(state: &LoadBalancerState, conn: &Connection) -> Verdict {
    EngineCounters::bump(&state.counters.routing_loops);
    warn!(
        dest = %conn.daddr,
        forward = %conn.forward(),
        "destination routes back to this host, dropping"
    );
    Verdict::Drop(DropReason::RoutingLoop)
}
