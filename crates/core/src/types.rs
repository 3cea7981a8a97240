//! 도메인 타입 — 엔진, 설정, 데몬이 공유하는 공통 타입
//!
//! 프로토콜 번호와 포워딩 방식처럼 설정 파일과 패킷 처리 경로 양쪽에서
//! 사용되는 값 타입을 정의합니다.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 로드밸런싱 대상 L4 프로토콜
///
/// `Ip`는 실제 패킷 프로토콜이 아니라 fwmark 템플릿 키에서
/// "모든 프로토콜"을 나타내는 용도로만 사용됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// 프로토콜 와일드카드 (IPPROTO_IP = 0)
    Ip,
    /// ICMP (1)
    Icmp,
    /// TCP (6)
    Tcp,
    /// UDP (17)
    Udp,
}

impl Protocol {
    /// IP 헤더의 프로토콜 번호를 반환합니다.
    pub const fn number(self) -> u8 {
        match self {
            Self::Ip => 0,
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// 프로토콜 번호에서 변환합니다. 지원하지 않는 번호는 `None`입니다.
    pub const fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Ip),
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    /// 메트릭 레이블 등에 쓰는 소문자 이름
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "IP"),
            Self::Icmp => write!(f, "ICMP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// 패킷 포워딩 방식
///
/// 연결 생성 시 한 번 결정되며 연결 수명 동안 바뀌지 않습니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardMethod {
    /// NAT (masquerading) — 목적지 주소/포트를 실서버로 재작성
    #[default]
    #[serde(rename = "masq")]
    Masq,
    /// 실서버가 로컬 호스트 — 패킷을 로컬 스택으로 전달
    #[serde(rename = "local")]
    Local,
    /// IP-in-IP 터널링
    #[serde(rename = "tunnel")]
    Tunnel,
    /// Direct routing — L2 재전송, 헤더 변경 없음
    #[serde(rename = "droute")]
    DirectRoute,
    /// 캐시 바이패스 — 원래 목적지로 그대로 라우팅
    #[serde(rename = "bypass")]
    Bypass,
}

impl ForwardMethod {
    /// 설정 파일에서 쓰는 이름
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Masq => "masq",
            Self::Local => "local",
            Self::Tunnel => "tunnel",
            Self::DirectRoute => "droute",
            Self::Bypass => "bypass",
        }
    }

    /// 문자열에서 포워딩 방식을 파싱합니다.
    ///
    /// 대소문자를 구분하지 않으며 ipvsadm 스타일 별칭(`nat`, `dr`, `ipip`)을 허용합니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "masq" | "nat" | "masquerade" => Some(Self::Masq),
            "local" | "localnode" => Some(Self::Local),
            "tunnel" | "ipip" | "tun" => Some(Self::Tunnel),
            "droute" | "dr" | "gatewaying" => Some(Self::DirectRoute),
            "bypass" => Some(Self::Bypass),
            _ => None,
        }
    }
}

impl fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Masq => write!(f, "Masq"),
            Self::Local => write!(f, "Local"),
            Self::Tunnel => write!(f, "Tunnel"),
            Self::DirectRoute => write!(f, "Route"),
            Self::Bypass => write!(f, "Bypass"),
        }
    }
}
