//! 호스트 네트워크 스택 경계
//!
//! 로드밸런서는 라우팅 조회, 패킷 송신, ICMP 에러 생성, 단편 재조립을
//! 직접 수행하지 않고 [`NetStack`] 구현에 위임합니다. 연결 동기화 전송은
//! [`SyncSink`]가 담당합니다.

use std::net::Ipv4Addr;

use crate::conn::Connection;
use crate::packet::Packet;

/// 라우트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// 목적지가 이 호스트의 주소
    Local,
    Unicast,
    Broadcast,
    Multicast,
}

/// 라우팅 조회 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub kind: RouteKind,
    /// 출력 경로 MTU
    pub mtu: u32,
    /// 출력 인터페이스의 선호 출발지 주소
    pub src: Ipv4Addr,
}

impl Route {
    pub fn is_local(&self) -> bool {
        self.kind == RouteKind::Local
    }
}

/// 호스트 네트워크 스택
///
/// 모든 메서드는 여러 패킷 처리 스레드에서 동시에 호출될 수 있습니다.
pub trait NetStack: Send + Sync {
    /// `daddr`로 가는 라우트를 조회합니다. 경로가 없으면 `None`.
    fn route(&self, daddr: Ipv4Addr) -> Option<Route>;

    /// 재작성된 패킷을 주어진 라우트로 내보냅니다.
    fn send(&self, pkt: Packet, route: &Route);

    /// `pkt`에 대한 ICMP 에러를 원래 송신자에게 보냅니다.
    ///
    /// `info`는 ICMP 헤더의 두 번째 4바이트입니다 (frag-needed의 경우 MTU).
    fn icmp_send(&self, pkt: &Packet, icmp_type: u8, code: u8, info: u32);

    /// 단편을 재조립합니다. 재조립이 끝나지 않았으면 `None`을 반환하며
    /// 이때 스택이 단편의 소유권을 가집니다.
    fn gather_frags(&self, _pkt: Packet) -> Option<Packet> {
        None
    }
}

/// 연결 동기화 메시지 전송 대상 (master 모드)
pub trait SyncSink: Send + Sync {
    fn sync_conn(&self, conn: &Connection);
}
