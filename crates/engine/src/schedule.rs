//! 스케줄링 코어 — 신규 흐름에 실서버를 배정하고 연결을 생성
//!
//! 서비스의 지속성 설정에 따라 두 경로로 나뉩니다.
//!
//! # 비지속성
//! ```text
//! 포트 확인 ──▶ Scheduler::schedule ──▶ insert_new(client → dest)
//! ```
//!
//! # 지속성
//! ```text
//! snet = saddr & netmask
//!   │
//!   ▼
//! 템플릿 키 결정 ──▶ lookup_template ──┬─ 유효 ──▶ 템플릿의 실서버 재사용
//!                                      └─ 없음/무효 ──▶ Scheduler::schedule
//!                                                        └▶ 새 템플릿 (timeout = svc.timeout)
//!   │
//!   ▼
//! insert_new(client → dest) + set_control(template)
//! ```
//!
//! | 서비스                    | 템플릿 키                           |
//! |---------------------------|--------------------------------------|
//! | 일반 포트, 같은 포트 요청 | `<proto, snet, 0, vaddr, vport>`     |
//! | FTP(21), 같은 포트 요청   | `<proto, snet, 0, vaddr, 0>`         |
//! | fwmark                    | `<IP, snet, 0, fwmark, 0>`           |
//! | 그 외 (포트 0, FTP 데이터) | `<proto, snet, 0, vaddr, 0>`        |
//!
//! 서비스의 실서버 풀 읽기 가드는 스케줄러 호출부터 연결 생성까지 유지됩니다.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use ipvs_core::metrics as m;
use ipvs_core::types::{ForwardMethod, Protocol};

use crate::conn::{ConnError, ConnHandle, NewConn, flags};
use crate::packet::Packet;
use crate::pipeline::{DropReason, Verdict};
use crate::proto::icmp::{ICMP_DEST_UNREACH, ICMP_PORT_UNREACH};
use crate::proto::{Direction, FlowTuple, ScheduleOutcome};
use crate::service::{Destination, FTP_PORT, Service};
use crate::stack::RouteKind;
use crate::state::LoadBalancerState;
use crate::stats::EngineCounters;
use crate::xmit;

/// 스케줄링 실패
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// 주소 기반 비지속성 서비스의 포트와 패킷 포트가 다름
    #[error("packet port {port} does not match service port {service_port}")]
    PortMismatch { port: u16, service_port: u16 },

    /// 선택 가능한 실서버 없음
    #[error("no destination available")]
    NoDestination,

    /// 연결/템플릿 생성 실패
    #[error(transparent)]
    Conn(#[from] ConnError),
}

/// 서비스에 대해 흐름을 스케줄하고 연결을 생성합니다.
pub fn schedule(
    state: &LoadBalancerState,
    svc: &Service,
    flow: &FlowTuple,
) -> Result<ConnHandle, ScheduleError> {
    let result = if svc.persistent {
        schedule_persistent(state, svc, flow)
    } else {
        schedule_plain(state, svc, flow)
    };

    if let Err(err) = &result {
        EngineCounters::bump(&state.counters.schedule_failures);
        metrics::counter!(
            m::SCHEDULE_FAILURES_TOTAL,
            m::LABEL_SERVICE => svc.key.to_string()
        )
        .increment(1);
        debug!(service = %svc.key, client = %flow.saddr, error = %err, "schedule failed");
    }
    result
}

fn schedule_plain(
    state: &LoadBalancerState,
    svc: &Service,
    flow: &FlowTuple,
) -> Result<ConnHandle, ScheduleError> {
    if svc.fwmark == 0 && flow.dport != svc.port {
        if svc.port == 0 {
            error!(
                service = %svc.key,
                "port zero is only supported by persistent services"
            );
        }
        return Err(ScheduleError::PortMismatch {
            port: flow.dport,
            service_port: svc.port,
        });
    }

    let pool = svc.pool();
    let dest = svc
        .scheduler()
        .schedule(&pool, flow)
        .ok_or(ScheduleError::NoDestination)?;

    let dport = if dest.port != 0 { dest.port } else { flow.dport };
    let (conn, fresh) = insert_conn(state, flow, &dest, dport)?;
    drop(pool);

    if fresh {
        record_conn_stats(state, &dest);
    }
    Ok(conn)
}

fn schedule_persistent(
    state: &LoadBalancerState,
    svc: &Service,
    flow: &FlowTuple,
) -> Result<ConnHandle, ScheduleError> {
    let snet = mask(flow.saddr, svc.netmask);
    let same_port = flow.dport == svc.port;

    let (tmpl_proto, tmpl_vaddr, tmpl_vport) = if same_port {
        let vport = if svc.port == FTP_PORT { 0 } else { flow.dport };
        (flow.protocol, flow.daddr, vport)
    } else if svc.fwmark != 0 {
        (Protocol::Ip, Ipv4Addr::from(svc.fwmark), 0)
    } else {
        (flow.protocol, flow.daddr, 0)
    };

    let pool = svc.pool();

    let template = state
        .conns
        .lookup_template(tmpl_proto, snet, tmpl_vaddr, tmpl_vport)
        .and_then(|ct| check_template(state, ct));

    let (template, dest) = match template {
        Some(ct) => {
            let Some(dest) = ct.dest().cloned() else {
                return Err(ScheduleError::NoDestination);
            };
            (ct, dest)
        }
        None => {
            let dest = svc
                .scheduler()
                .schedule(&pool, flow)
                .ok_or(ScheduleError::NoDestination)?;
            let tmpl_dport = if same_port && svc.port != FTP_PORT {
                dest.port
            } else {
                0
            };
            let (ct, _) = insert_or_existing(
                state,
                NewConn {
                    protocol: tmpl_proto,
                    caddr: snet,
                    cport: 0,
                    vaddr: tmpl_vaddr,
                    vport: tmpl_vport,
                    daddr: dest.addr,
                    dport: tmpl_dport,
                    flags: flags::TEMPLATE,
                    forward: dest.forward(),
                    dest: Some(Arc::clone(&dest)),
                    state: 0,
                    timeout: svc.timeout,
                },
            )?;
            debug!(
                service = %svc.key,
                %snet,
                dest = %format_args!("{}:{}", dest.addr, dest.port),
                "persistence template created"
            );
            (ct, dest)
        }
    };

    let dport = if flow.dport == svc.port && dest.port != 0 {
        dest.port
    } else {
        flow.dport
    };
    let (conn, fresh) = insert_conn(state, flow, &dest, dport)?;
    if fresh {
        conn.set_control(template.arc());
        record_conn_stats(state, &dest);
    }
    drop(template);
    drop(pool);
    Ok(conn)
}

/// 템플릿의 실서버가 여전히 쓸 수 있는지 확인합니다.
///
/// 쓸 수 없으면 템플릿을 테이블에서 제거하고 타이머를 재장전하지 않습니다.
fn check_template(state: &LoadBalancerState, mut ct: ConnHandle) -> Option<ConnHandle> {
    let valid = ct.dest().is_some_and(|dest| {
        dest.is_usable()
            && !(state.config.engine.expire_quiescent_template && dest.weight() == 0)
    });
    if valid {
        return Some(ct);
    }

    state.conns.expire_now(&ct);
    ct.skip_refresh();
    debug!(template = ?*ct, "persistence template invalidated");
    None
}

fn insert_conn(
    state: &LoadBalancerState,
    flow: &FlowTuple,
    dest: &Arc<Destination>,
    dport: u16,
) -> Result<(ConnHandle, bool), ConnError> {
    let (initial, timeout) = initial_state(state, flow.protocol);
    insert_or_existing(
        state,
        NewConn {
            protocol: flow.protocol,
            caddr: flow.saddr,
            cport: flow.sport,
            vaddr: flow.daddr,
            vport: flow.dport,
            daddr: dest.addr,
            dport,
            flags: 0,
            forward: dest.forward(),
            dest: Some(Arc::clone(dest)),
            state: initial,
            timeout,
        },
    )
}

/// 연결을 삽입합니다. 다른 스레드가 먼저 같은 식별자를 삽입했으면 그 연결을 반환합니다.
///
/// 두 번째 값은 이번 호출이 실제로 삽입했는지 여부입니다.
fn insert_or_existing(
    state: &LoadBalancerState,
    new: NewConn,
) -> Result<(ConnHandle, bool), ConnError> {
    let (protocol, caddr, cport, vaddr, vport) =
        (new.protocol, new.caddr, new.cport, new.vaddr, new.vport);
    let template = new.flags & flags::TEMPLATE != 0;

    match state.conns.insert_new(new) {
        Err(ConnError::Exists) => {
            let existing = if template {
                state.conns.lookup_template(protocol, caddr, vaddr, vport)
            } else {
                state.conns.lookup_inbound(protocol, caddr, cport, vaddr, vport)
            };
            existing.map(|conn| (conn, false)).ok_or(ConnError::Exists)
        }
        inserted => inserted.map(|conn| (conn, true)),
    }
}

fn initial_state(state: &LoadBalancerState, protocol: Protocol) -> (u8, Duration) {
    match state.protocols.get(protocol.number()) {
        Some(pp) => {
            let initial = pp.initial_state();
            (initial, pp.timeout(initial))
        }
        None => (0, Duration::from_secs(60)),
    }
}

fn record_conn_stats(state: &LoadBalancerState, dest: &Destination) {
    dest.stats.record_conn();
    dest.service_stats().record_conn();
    state.stats.record_conn();
}

fn mask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(netmask))
}

// ─── 실패 처리 ──────────────────────────────────────────────────────

/// 스케줄링 결과를 파이프라인이 소비할 형태로 바꿉니다.
///
/// 연결 생성 실패는 패킷 하나의 드롭이며, 나머지 실패는 [`leave`]로 넘어갑니다.
pub fn schedule_or_leave(
    state: &LoadBalancerState,
    svc: &Service,
    pkt: Packet,
    flow: &FlowTuple,
) -> ScheduleOutcome {
    match schedule(state, svc, flow) {
        Ok(conn) => ScheduleOutcome::Conn(pkt, conn),
        Err(ScheduleError::Conn(err)) => {
            warn!(service = %svc.key, error = %err, "connection allocation failed");
            ScheduleOutcome::Verdict(Verdict::Drop(DropReason::NoMemory))
        }
        Err(_) => ScheduleOutcome::Verdict(leave(state, svc, pkt, flow)),
    }
}

/// 서비스는 찾았지만 연결을 만들지 못한 패킷을 처리합니다.
///
/// 1. 캐시 바이패스가 켜져 있고 fwmark 서비스이며 원래 목적지가 유니캐스트면
///    목적지 없는 바이패스 연결을 만들어 원래 목적지로 보냅니다.
/// 2. FTP 서비스가 있는 VIP의 다른 포트로 온 패킷은 그대로 통과시킵니다.
/// 3. 그 외에는 ICMP port-unreachable을 보내고 드롭합니다.
pub fn leave(state: &LoadBalancerState, svc: &Service, pkt: Packet, flow: &FlowTuple) -> Verdict {
    if state.config.engine.cache_bypass && svc.fwmark != 0 {
        let unicast = state
            .stack
            .route(flow.daddr)
            .is_some_and(|rt| rt.kind == RouteKind::Unicast);
        if unicast {
            return bypass(state, pkt, flow);
        }
    }

    if svc.port == FTP_PORT && flow.dport != FTP_PORT {
        return Verdict::Accept(pkt);
    }

    state
        .stack
        .icmp_send(&pkt, ICMP_DEST_UNREACH, ICMP_PORT_UNREACH, 0);
    Verdict::Drop(DropReason::NoDestination)
}

fn bypass(state: &LoadBalancerState, pkt: Packet, flow: &FlowTuple) -> Verdict {
    let Some(pp) = state.protocols.get(flow.protocol.number()) else {
        return Verdict::Accept(pkt);
    };
    let initial = pp.initial_state();
    let new = NewConn {
        protocol: flow.protocol,
        caddr: flow.saddr,
        cport: flow.sport,
        vaddr: flow.daddr,
        vport: flow.dport,
        daddr: Ipv4Addr::UNSPECIFIED,
        dport: 0,
        flags: flags::BYPASS,
        forward: ForwardMethod::Bypass,
        dest: None,
        state: initial,
        timeout: pp.timeout(initial),
    };
    let conn = match insert_or_existing(state, new) {
        Ok((conn, _)) => conn,
        Err(err) => {
            warn!(error = %err, "bypass connection allocation failed");
            return Verdict::Drop(DropReason::NoMemory);
        }
    };

    state.stats.record_in(pkt.len());
    pp.state_transition(&conn, Direction::Input, &pkt);
    let verdict = xmit::transmit(state, pkt, &conn, pp);
    conn.bump_in_pkts();
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_applies_netmask() {
        assert_eq!(
            mask(Ipv4Addr::new(192, 168, 1, 9), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 0)
        );
        assert_eq!(
            mask(Ipv4Addr::new(192, 168, 1, 9), Ipv4Addr::BROADCAST),
            Ipv4Addr::new(192, 168, 1, 9)
        );
    }

    mod race {
        use std::sync::Arc;

        use ipvs_core::config::IpvsConfig;

        use super::*;
        use crate::sched::SchedulerRegistry;
        use crate::stack::{NetStack, Route};

        struct NullStack;

        impl NetStack for NullStack {
            fn route(&self, _daddr: Ipv4Addr) -> Option<Route> {
                None
            }

            fn send(&self, _pkt: Packet, _route: &Route) {}

            fn icmp_send(&self, _pkt: &Packet, _icmp_type: u8, _code: u8, _info: u32) {}
        }

        fn state(persistent: bool) -> LoadBalancerState {
            let persistence = if persistent { "persistent = true" } else { "" };
            let config = IpvsConfig::parse(&format!(
                r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "rr"
{persistence}

[[services.destinations]]
address = "192.168.1.10"
port = 8080
"#
            ))
            .unwrap();
            let state = LoadBalancerState::new(
                config.clone(),
                Arc::new(NullStack),
                None,
                SchedulerRegistry::default(),
            );
            state.apply_services(&config.services).unwrap();
            state
        }

        fn flow() -> FlowTuple {
            FlowTuple {
                protocol: Protocol::Tcp,
                saddr: Ipv4Addr::new(172, 16, 0, 5),
                sport: 40000,
                daddr: Ipv4Addr::new(10, 0, 0, 1),
                dport: 80,
            }
        }

        fn assert_counted_once(persistent: bool) {
            let state = state(persistent);
            let svc = state
                .services
                .match_service(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80, 0)
                .unwrap();

            let first = schedule(&state, &svc, &flow()).unwrap();
            // 같은 흐름을 다시 스케줄하면 먼저 삽입된 연결을 받는다
            let second = schedule(&state, &svc, &flow()).unwrap();
            assert!(Arc::ptr_eq(first.arc(), second.arc()));

            assert_eq!(state.stats.snapshot().conns, 1);
            assert_eq!(svc.stats.snapshot().conns, 1);
            let pool = svc.pool();
            assert_eq!(pool[0].stats.snapshot().conns, 1);
        }

        #[test]
        fn lost_insert_race_is_not_counted() {
            assert_counted_once(false);
        }

        #[test]
        fn lost_insert_race_is_not_counted_for_persistent_service() {
            assert_counted_once(true);
        }
    }

    #[test]
    fn error_display() {
        let err = ScheduleError::PortMismatch {
            port: 81,
            service_port: 80,
        };
        assert_eq!(err.to_string(), "packet port 81 does not match service port 80");
        let err: ScheduleError = ConnError::NoMemory { max: 4 }.into();
        assert_eq!(err.to_string(), "connection table full (4 entries)");
    }
}
