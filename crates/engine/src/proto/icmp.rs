//! ICMP 디스크립터
//!
//! ICMP 자체는 로드밸런싱되지 않습니다. 로드밸런싱된 연결에 관한 ICMP 에러는
//! 파이프라인의 ICMP 중계 경로가 내장 헤더로 연결을 찾아 처리합니다.

use std::time::Duration;

use ipvs_core::types::Protocol;

use super::{Direction, FlowTuple, ProtocolHandler, ScheduleOutcome};
use crate::checksum;
use crate::conn::{ConnHandle, ConnTable, Connection};
use crate::packet::{ICMP_HEADER_LEN, Packet};
use crate::state::LoadBalancerState;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// DEST_UNREACH 코드
pub const ICMP_HOST_UNREACH: u8 = 1;
pub const ICMP_PORT_UNREACH: u8 = 3;
pub const ICMP_FRAG_NEEDED: u8 = 4;

const TIMEOUT: Duration = Duration::from_secs(60);

/// 연결 관련 ICMP 에러 유형인지
pub fn is_related_error(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_DEST_UNREACH | ICMP_SOURCE_QUENCH | ICMP_TIME_EXCEEDED
    )
}

/// ICMP 프로토콜 디스크립터
#[derive(Debug, Clone, Default)]
pub struct IcmpHandler;

impl IcmpHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolHandler for IcmpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Icmp
    }

    fn min_header_len(&self) -> usize {
        ICMP_HEADER_LEN
    }

    fn conn_in_get(&self, _table: &ConnTable, _flow: &FlowTuple, _inverse: bool) -> Option<ConnHandle> {
        None
    }

    fn conn_out_get(&self, _table: &ConnTable, _flow: &FlowTuple, _inverse: bool) -> Option<ConnHandle> {
        None
    }

    fn conn_schedule(&self, _state: &LoadBalancerState, pkt: Packet, _flow: &FlowTuple) -> ScheduleOutcome {
        ScheduleOutcome::Pass(pkt)
    }

    fn initial_state(&self) -> u8 {
        0
    }

    fn timeout(&self, _state: u8) -> Duration {
        TIMEOUT
    }

    fn state_name(&self, _state: u8) -> &'static str {
        "ICMP"
    }

    fn state_transition(&self, conn: &Connection, _dir: Direction, _pkt: &Packet) -> bool {
        conn.set_state(0, TIMEOUT, false);
        true
    }

    fn csum_check(&self, pkt: &Packet) -> bool {
        pkt.meta.csum_verified || checksum::verify(pkt.transport(), 0)
    }
}

/// ICMP 메시지 체크섬을 다시 계산합니다.
pub fn refresh_checksum(pkt: &mut Packet) {
    let t = pkt.transport_mut();
    if t.len() < ICMP_HEADER_LEN {
        return;
    }
    t[2..4].copy_from_slice(&[0, 0]);
    let check = checksum::internet_checksum(t);
    t[2..4].copy_from_slice(&check.to_be_bytes());
}
