//! UDP 디스크립터
//!
//! 상태는 NORMAL 하나뿐이며 모든 패킷이 신규 흐름을 스케줄할 수 있습니다.
//! 체크섬 0은 "체크섬 없음"으로 그대로 둡니다.

use std::time::Duration;

use ipvs_core::config::TimeoutConfig;
use ipvs_core::types::Protocol;

use super::{
    Direction, FlowTuple, PortRewrite, ProtocolHandler, ScheduleOutcome, rewrite_port,
    verify_transport,
};
use crate::conn::Connection;
use crate::packet::{Packet, UDP_HEADER_LEN};
use crate::schedule;
use crate::state::LoadBalancerState;

pub const S_NORMAL: u8 = 0;

/// UDP 프로토콜 디스크립터
#[derive(Debug, Clone)]
pub struct UdpHandler {
    timeout: Duration,
}

impl UdpHandler {
    pub fn new(cfg: &TimeoutConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.udp_secs),
        }
    }
}

impl ProtocolHandler for UdpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn min_header_len(&self) -> usize {
        UDP_HEADER_LEN
    }

    fn conn_schedule(&self, state: &LoadBalancerState, pkt: Packet, flow: &FlowTuple) -> ScheduleOutcome {
        match state
            .services
            .match_service(Protocol::Udp, flow.daddr, flow.dport, pkt.meta.fwmark)
        {
            Some(svc) => schedule::schedule_or_leave(state, &svc, pkt, flow),
            None => ScheduleOutcome::Pass(pkt),
        }
    }

    fn initial_state(&self) -> u8 {
        S_NORMAL
    }

    fn timeout(&self, _state: u8) -> Duration {
        self.timeout
    }

    fn state_name(&self, state: u8) -> &'static str {
        if state == S_NORMAL { "UDP" } else { "ERR!" }
    }

    fn state_transition(&self, conn: &Connection, _dir: Direction, _pkt: &Packet) -> bool {
        conn.set_state(S_NORMAL, self.timeout, false);
        true
    }

    fn csum_check(&self, pkt: &Packet) -> bool {
        if pkt.meta.csum_verified || pkt.transport_u16(6) == Some(0) {
            return true;
        }
        verify_transport(pkt)
    }

    fn snat_handler(&self, pkt: &mut Packet, conn: &Connection) -> bool {
        let daddr = pkt.daddr();
        rewrite_port(
            pkt,
            PortRewrite {
                port_off: 0,
                csum_off: 6,
                old_addr: conn.daddr,
                new_addr: conn.vaddr,
                new_port: conn.vport,
                zero_means_none: true,
                final_src: conn.vaddr,
                final_dst: daddr,
            },
        )
    }

    fn dnat_handler(&self, pkt: &mut Packet, conn: &Connection) -> bool {
        let saddr = pkt.saddr();
        rewrite_port(
            pkt,
            PortRewrite {
                port_off: 2,
                csum_off: 6,
                old_addr: conn.vaddr,
                new_addr: conn.daddr,
                new_port: conn.dport,
                zero_means_none: true,
                final_src: saddr,
                final_dst: conn.daddr,
            },
        )
    }
}
