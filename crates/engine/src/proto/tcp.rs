//! TCP 디스크립터 — 상태 표, 타임아웃, NAT
//!
//! 상태 표는 방향(INPUT / OUTPUT / INPUT_ONLY)과 플래그(syn / fin / ack / rst)로
//! 색인되며, 플래그 우선순위는 rst > syn > fin > ack 입니다. 플래그가 전혀 없는
//! 세그먼트는 CLOSE로 전이합니다.

use std::time::Duration;

use ipvs_core::config::TimeoutConfig;
use ipvs_core::types::Protocol;

use super::{
    Direction, FlowTuple, PortRewrite, ProtocolHandler, ScheduleOutcome, rewrite_port,
    verify_transport,
};
use crate::conn::{Connection, flags};
use crate::packet::{Packet, TCP_HEADER_LEN, tcp_flags};
use crate::schedule;
use crate::state::LoadBalancerState;

// ─── 상태 ───────────────────────────────────────────────────────────

pub const S_NONE: u8 = 0;
pub const S_ESTABLISHED: u8 = 1;
pub const S_SYN_SENT: u8 = 2;
pub const S_SYN_RECV: u8 = 3;
pub const S_FIN_WAIT: u8 = 4;
pub const S_TIME_WAIT: u8 = 5;
pub const S_CLOSE: u8 = 6;
pub const S_CLOSE_WAIT: u8 = 7;
pub const S_LAST_ACK: u8 = 8;
pub const S_LISTEN: u8 = 9;
pub const S_SYNACK: u8 = 10;

const STATE_COUNT: usize = 11;

const STATE_NAMES: [&str; STATE_COUNT] = [
    "NONE",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "SYNACK",
];

const ES: u8 = S_ESTABLISHED;
const SS: u8 = S_SYN_SENT;
const SR: u8 = S_SYN_RECV;
const FW: u8 = S_FIN_WAIT;
const TW: u8 = S_TIME_WAIT;
const CL: u8 = S_CLOSE;
const CW: u8 = S_CLOSE_WAIT;
const LA: u8 = S_LAST_ACK;
const LI: u8 = S_LISTEN;

type Row = [u8; STATE_COUNT];

// 플래그 행 순서: syn, fin, ack, rst
// 열 순서:   NO  ES  SS  SR  FW  TW  CL  CW  LA  LI  SA
const INPUT: [Row; 4] = [
    [SR, ES, ES, SR, SR, SR, SR, SR, SR, SR, SR],
    [CL, CW, SS, TW, TW, TW, CL, CW, LA, LI, TW],
    [CL, ES, SS, ES, FW, TW, CL, CW, CL, LI, ES],
    [CL, CL, CL, SR, CL, CL, CL, CL, LA, LI, SR],
];

const OUTPUT: [Row; 4] = [
    [SS, ES, SS, SR, SS, SS, SS, SS, SS, LI, SR],
    [TW, FW, SS, TW, FW, TW, CL, TW, LA, LI, TW],
    [ES, ES, SS, ES, FW, TW, CL, CW, LA, ES, ES],
    [CL, CL, SS, CL, CL, TW, CL, CL, CL, CL, CL],
];

const INPUT_ONLY: [Row; 4] = [
    [SR, ES, ES, SR, SR, SR, SR, SR, SR, SR, SR],
    [CL, FW, SS, TW, FW, TW, CL, CW, LA, LI, TW],
    [CL, ES, SS, ES, FW, TW, CL, CW, CL, LI, ES],
    [CL, CL, CL, SR, CL, CL, CL, CL, LA, LI, CL],
];

/// 플래그 → 표 행 인덱스
fn flag_index(flags: u8) -> Option<usize> {
    if flags & tcp_flags::RST != 0 {
        Some(3)
    } else if flags & tcp_flags::SYN != 0 {
        Some(0)
    } else if flags & tcp_flags::FIN != 0 {
        Some(1)
    } else if flags & tcp_flags::ACK != 0 {
        Some(2)
    } else {
        None
    }
}

/// 현재 상태, 방향, 플래그로 다음 상태를 구합니다.
pub fn next_state(current: u8, dir: Direction, flags: u8) -> u8 {
    let Some(row) = flag_index(flags) else {
        return S_CLOSE;
    };
    let table = match dir {
        Direction::Input => &INPUT,
        Direction::Output => &OUTPUT,
        Direction::InputOnly => &INPUT_ONLY,
    };
    let col = usize::from(current).min(STATE_COUNT - 1);
    table[row][col]
}

// ─── 핸들러 ─────────────────────────────────────────────────────────

/// TCP 프로토콜 디스크립터
#[derive(Debug, Clone)]
pub struct TcpHandler {
    timeouts: [Duration; STATE_COUNT],
}

impl TcpHandler {
    pub fn new(cfg: &TimeoutConfig) -> Self {
        let secs = Duration::from_secs;
        Self {
            timeouts: [
                secs(2),
                secs(cfg.tcp_secs),
                secs(120),
                secs(60),
                secs(cfg.tcp_fin_secs),
                secs(120),
                secs(10),
                secs(60),
                secs(30),
                secs(120),
                secs(120),
            ],
        }
    }
}

impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn min_header_len(&self) -> usize {
        TCP_HEADER_LEN
    }

    fn conn_schedule(&self, state: &LoadBalancerState, pkt: Packet, flow: &FlowTuple) -> ScheduleOutcome {
        let syn = pkt
            .tcp_flags()
            .is_some_and(|f| f & tcp_flags::SYN != 0);
        if !syn {
            return ScheduleOutcome::Pass(pkt);
        }
        match state
            .services
            .match_service(Protocol::Tcp, flow.daddr, flow.dport, pkt.meta.fwmark)
        {
            Some(svc) => schedule::schedule_or_leave(state, &svc, pkt, flow),
            None => ScheduleOutcome::Pass(pkt),
        }
    }

    fn initial_state(&self) -> u8 {
        S_NONE
    }

    fn timeout(&self, state: u8) -> Duration {
        self.timeouts[usize::from(state).min(STATE_COUNT - 1)]
    }

    fn state_name(&self, state: u8) -> &'static str {
        STATE_NAMES.get(usize::from(state)).copied().unwrap_or("ERR!")
    }

    fn state_transition(&self, conn: &Connection, dir: Direction, pkt: &Packet) -> bool {
        let Some(tcp_flags) = pkt.tcp_flags() else {
            return false;
        };

        let mut dir = dir;
        if conn.has_flag(flags::NO_OUTPUT) {
            if dir == Direction::Output {
                conn.clear_flag(flags::NO_OUTPUT);
            } else {
                dir = Direction::InputOnly;
            }
        }

        let new_state = next_state(conn.state(), dir, tcp_flags);
        conn.set_state(new_state, self.timeout(new_state), new_state == S_ESTABLISHED);
        true
    }

    fn csum_check(&self, pkt: &Packet) -> bool {
        pkt.meta.csum_verified || verify_transport(pkt)
    }

    fn snat_handler(&self, pkt: &mut Packet, conn: &Connection) -> bool {
        let daddr = pkt.daddr();
        rewrite_port(
            pkt,
            PortRewrite {
                port_off: 0,
                csum_off: 16,
                old_addr: conn.daddr,
                new_addr: conn.vaddr,
                new_port: conn.vport,
                zero_means_none: false,
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
                csum_off: 16,
                old_addr: conn.vaddr,
                new_addr: conn.daddr,
                new_port: conn.dport,
                zero_means_none: false,
                final_src: saddr,
                final_dst: conn.daddr,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcp_flags::{ACK, FIN, RST, SYN};

    #[test]
    fn three_way_handshake_through_nat() {
        let mut s = S_NONE;
        s = next_state(s, Direction::Input, SYN);
        assert_eq!(s, S_SYN_RECV);
        s = next_state(s, Direction::Output, SYN | ACK);
        assert_eq!(s, S_SYN_RECV);
        s = next_state(s, Direction::Input, ACK);
        assert_eq!(s, S_ESTABLISHED);
    }

    #[test]
    fn active_close_from_client() {
        let mut s = S_ESTABLISHED;
        s = next_state(s, Direction::Input, FIN | ACK);
        assert_eq!(s, S_CLOSE_WAIT);
        s = next_state(s, Direction::Output, FIN | ACK);
        assert_eq!(s, S_TIME_WAIT);
    }

    #[test]
    fn rst_has_priority_over_syn() {
        assert_eq!(
            next_state(S_ESTABLISHED, Direction::Input, RST | SYN),
            S_CLOSE
        );
    }

    #[test]
    fn input_only_fin_goes_to_fin_wait() {
        assert_eq!(next_state(S_ESTABLISHED, Direction::InputOnly, FIN), S_FIN_WAIT);
        assert_eq!(next_state(S_SYNACK, Direction::InputOnly, RST), S_CLOSE);
        assert_eq!(next_state(S_SYNACK, Direction::Input, RST), S_SYN_RECV);
    }

    #[test]
    fn no_flags_closes() {
        assert_eq!(next_state(S_ESTABLISHED, Direction::Input, 0), S_CLOSE);
    }

    #[test]
    fn timeouts_follow_config() {
        let cfg = TimeoutConfig {
            tcp_secs: 3600,
            tcp_fin_secs: 30,
            udp_secs: 300,
        };
        let tcp = TcpHandler::new(&cfg);
        assert_eq!(tcp.timeout(S_ESTABLISHED), Duration::from_secs(3600));
        assert_eq!(tcp.timeout(S_FIN_WAIT), Duration::from_secs(30));
        assert_eq!(tcp.timeout(S_NONE), Duration::from_secs(2));
        assert_eq!(tcp.timeout(S_CLOSE), Duration::from_secs(10));
        assert_eq!(tcp.timeout(S_LAST_ACK), Duration::from_secs(30));
    }

    #[test]
    fn state_names() {
        let tcp = TcpHandler::new(&TimeoutConfig::default());
        assert_eq!(tcp.state_name(S_ESTABLISHED), "ESTABLISHED");
        assert_eq!(tcp.state_name(S_SYNACK), "SYNACK");
        assert_eq!(tcp.state_name(42), "ERR!");
    }
}
