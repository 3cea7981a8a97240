//! 패킷 뷰 — IPv4 데이터그램 파싱, 필드 접근, 재작성, 생성
//!
//! 훅 경로는 소유권을 가진 [`Packet`]을 주고받습니다. 헤더 필드는 매번 버퍼에서
//! 직접 읽으므로 재작성 직후에도 접근자가 항상 최신 값을 반환합니다.
//!
//! # 버퍼 레이아웃
//!
//! ```text
//! +-----------------+-----------------------------+
//! | IPv4 header     | transport (TCP/UDP/ICMP)    |
//! | header_len()    | transport() / transport_mut |
//! +-----------------+-----------------------------+
//! |<-------------- total_len() ------------------>|
//! ```

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use ipvs_core::types::Protocol;

use crate::checksum;

// ─── 헤더 상수 ──────────────────────────────────────────────────────

/// IPv4 최소 헤더 길이
pub const IPV4_HEADER_LEN: usize = 20;

/// TCP 최소 헤더 길이
pub const TCP_HEADER_LEN: usize = 20;

/// UDP 헤더 길이
pub const UDP_HEADER_LEN: usize = 8;

/// ICMP 헤더 길이 (type, code, checksum, rest-of-header)
pub const ICMP_HEADER_LEN: usize = 8;

/// IP-in-IP 프로토콜 번호
pub const IPPROTO_IPIP: u8 = 4;

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;
const DEFAULT_TTL: u8 = 64;

/// TCP 플래그
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

// ─── 에러 ───────────────────────────────────────────────────────────

/// 패킷 파싱 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("not an IPv4 packet (version {0})")]
    BadVersion(u8),

    #[error("invalid header length: {0}")]
    BadHeaderLen(usize),

    #[error("invalid total length {total} for buffer of {len} bytes")]
    BadTotalLen { total: usize, len: usize },

    #[error("datagram of {0} bytes exceeds the IPv4 maximum")]
    TooLong(usize),
}

// ─── 메타데이터 ─────────────────────────────────────────────────────

/// 링크 계층 수신 유형
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketType {
    /// 이 호스트로 향하는 패킷
    #[default]
    Host,
    Broadcast,
    Multicast,
    /// 다른 호스트로 향하는 패킷 (promiscuous)
    OtherHost,
}

/// 스택이 패킷에 붙여 전달하는 메타데이터
#[derive(Debug, Clone, Default)]
pub struct PacketMeta {
    pub pkt_type: PacketType,
    /// 루프백 장치로 수신됨
    pub loopback: bool,
    /// 로컬 소켓이 이미 연결되어 있음
    pub local_socket: bool,
    /// 방화벽 마크 (0 = 없음)
    pub fwmark: u32,
    /// 로드밸런서가 이미 처리한 패킷 표시
    pub ipvs_property: bool,
    /// 하드웨어/상위 계층이 체크섬을 검증했음
    pub csum_verified: bool,
    /// 페이로드가 변경되어 증분 체크섬 갱신을 쓸 수 없음
    pub payload_mangled: bool,
}

// ─── Packet ─────────────────────────────────────────────────────────

/// 소유권을 가진 IPv4 패킷
#[derive(Debug, Clone)]
pub struct Packet {
    buf: BytesMut,
    pub meta: PacketMeta,
}

impl Packet {
    /// 버퍼를 IPv4 패킷으로 파싱합니다.
    ///
    /// total length 뒤의 여분 바이트(링크 계층 패딩)는 잘라냅니다.
    pub fn parse(buf: impl Into<BytesMut>) -> Result<Self, PacketError> {
        let mut buf = buf.into();
        let len = buf.len();
        if len < IPV4_HEADER_LEN {
            return Err(PacketError::Truncated { len });
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::BadVersion(version));
        }

        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN || ihl > len {
            return Err(PacketError::BadHeaderLen(ihl));
        }

        let total = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total < ihl || total > len {
            return Err(PacketError::BadTotalLen { total, len });
        }
        buf.truncate(total);

        Ok(Self {
            buf,
            meta: PacketMeta::default(),
        })
    }

    /// 슬라이스를 복사하여 파싱합니다.
    pub fn from_slice(data: &[u8]) -> Result<Self, PacketError> {
        Self::parse(BytesMut::from(data))
    }

    /// 메타데이터를 지정합니다.
    pub fn with_meta(mut self, meta: PacketMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// 전체 길이 (바이트)
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    // --- IPv4 헤더 필드 ---

    pub fn header_len(&self) -> usize {
        usize::from(self.buf[0] & 0x0f) * 4
    }

    pub fn total_len(&self) -> usize {
        usize::from(self.read_u16(2))
    }

    pub fn protocol_number(&self) -> u8 {
        self.buf[9]
    }

    /// 지원하는 L4 프로토콜이면 `Some`
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_number(self.protocol_number())
    }

    pub fn ttl(&self) -> u8 {
        self.buf[8]
    }

    pub fn saddr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.read_u32(12))
    }

    pub fn daddr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.read_u32(16))
    }

    fn frag_field(&self) -> u16 {
        self.read_u16(6)
    }

    /// 단편(fragment) 여부: MF 플래그 또는 0이 아닌 오프셋
    pub fn is_fragment(&self) -> bool {
        self.frag_field() & (FLAG_MF | FRAG_OFFSET_MASK) != 0
    }

    pub fn dont_fragment(&self) -> bool {
        self.frag_field() & FLAG_DF != 0
    }

    /// DF 비트를 설정/해제하고 헤더 체크섬을 갱신합니다.
    pub fn set_dont_fragment(&mut self, df: bool) {
        let field = if df {
            self.frag_field() | FLAG_DF
        } else {
            self.frag_field() & !FLAG_DF
        };
        self.write_u16(6, field);
        self.refresh_ip_checksum();
    }

    /// IP 헤더 체크섬이 올바른지 확인합니다.
    pub fn ip_checksum_ok(&self) -> bool {
        checksum::verify(&self.buf[..self.header_len()], 0)
    }

    /// 출발지 주소를 변경하고 IP 헤더 체크섬을 다시 계산합니다.
    pub fn set_saddr(&mut self, addr: Ipv4Addr) {
        self.write_u32(12, u32::from(addr));
        self.refresh_ip_checksum();
    }

    /// 목적지 주소를 변경하고 IP 헤더 체크섬을 다시 계산합니다.
    pub fn set_daddr(&mut self, addr: Ipv4Addr) {
        self.write_u32(16, u32::from(addr));
        self.refresh_ip_checksum();
    }

    /// IP 헤더 체크섬 재계산
    pub fn refresh_ip_checksum(&mut self) {
        let hl = self.header_len();
        self.buf[10..12].copy_from_slice(&[0, 0]);
        let check = checksum::internet_checksum(&self.buf[..hl]);
        self.buf[10..12].copy_from_slice(&check.to_be_bytes());
    }

    // --- 전송 계층 ---

    pub fn transport(&self) -> &[u8] {
        &self.buf[self.header_len()..]
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        let hl = self.header_len();
        &mut self.buf[hl..]
    }

    /// TCP/UDP 포트 `(sport, dport)`
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.protocol() {
            Some(Protocol::Tcp) | Some(Protocol::Udp) => {
                let t = self.transport();
                (t.len() >= 4).then(|| {
                    (
                        u16::from_be_bytes([t[0], t[1]]),
                        u16::from_be_bytes([t[2], t[3]]),
                    )
                })
            }
            _ => None,
        }
    }

    /// TCP 플래그 바이트 (TCP가 아니거나 헤더가 잘렸으면 `None`)
    pub fn tcp_flags(&self) -> Option<u8> {
        if self.protocol() != Some(Protocol::Tcp) {
            return None;
        }
        self.transport().get(13).copied()
    }

    /// 전송 계층 시작 기준 오프셋의 u16
    pub fn transport_u16(&self, off: usize) -> Option<u16> {
        let t = self.transport();
        (t.len() >= off + 2).then(|| u16::from_be_bytes([t[off], t[off + 1]]))
    }

    /// 전송 계층 시작 기준 오프셋에 u16 기록
    pub fn set_transport_u16(&mut self, off: usize, value: u16) {
        let t = self.transport_mut();
        if t.len() >= off + 2 {
            t[off..off + 2].copy_from_slice(&value.to_be_bytes());
        }
    }

    // --- ICMP 내장 헤더 ---

    /// ICMP `(type, code)`
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        if self.protocol() != Some(Protocol::Icmp) {
            return None;
        }
        let t = self.transport();
        (t.len() >= 2).then(|| (t[0], t[1]))
    }

    /// ICMP 에러 메시지에 포함된 원본 IP 헤더 뷰
    pub fn icmp_inner(&self) -> Option<InnerHeader> {
        self.icmp_type_code()?;
        let offset = self.header_len() + ICMP_HEADER_LEN;
        let inner = self.buf.get(offset..)?;
        if inner.len() < IPV4_HEADER_LEN || inner[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(inner[0] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN || ihl > inner.len() {
            return None;
        }
        let frag = u16::from_be_bytes([inner[6], inner[7]]);
        let ports = inner
            .get(ihl..ihl + 4)
            .map(|p| (u16::from_be_bytes([p[0], p[1]]), u16::from_be_bytes([p[2], p[3]])));
        Some(InnerHeader {
            offset,
            header_len: ihl,
            protocol: inner[9],
            saddr: Ipv4Addr::new(inner[12], inner[13], inner[14], inner[15]),
            daddr: Ipv4Addr::new(inner[16], inner[17], inner[18], inner[19]),
            fragment_offset: frag & FRAG_OFFSET_MASK,
            ports,
        })
    }

    /// 패킷 버퍼 전체에 대한 가변 접근 (절대 오프셋 재작성용)
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    // --- 캡슐화 ---

    /// IP-in-IP 외부 헤더를 앞에 붙입니다.
    ///
    /// 외부 헤더는 내부 패킷의 TTL과 DF 비트를 복사합니다.
    /// 결과가 65535바이트를 넘으면 패킷을 바꾸지 않고 `TooLong`을 반환합니다.
    pub fn encapsulate_ipip(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Result<(), PacketError> {
        let outer_len = IPV4_HEADER_LEN + self.buf.len();
        let total = u16::try_from(outer_len).map_err(|_| PacketError::TooLong(outer_len))?;
        let mut outer = BytesMut::with_capacity(outer_len);
        let flags = if self.dont_fragment() { FLAG_DF } else { 0 };
        put_ipv4_header(&mut outer, src, dst, IPPROTO_IPIP, self.ttl(), flags, total);
        outer.extend_from_slice(&self.buf);
        self.buf = outer;
        self.refresh_ip_checksum();
        Ok(())
    }

    // --- 내부 헬퍼 ---

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.buf[off], self.buf[off + 1]])
    }

    fn read_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        self.buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// ICMP 에러 안에 실린 원본 패킷 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerHeader {
    /// 패킷 버퍼 기준 내장 IP 헤더 시작 오프셋
    pub offset: usize,
    pub header_len: usize,
    pub protocol: u8,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub fragment_offset: u16,
    /// 내장 TCP/UDP 포트 (8바이트가 실려 있을 때만)
    pub ports: Option<(u16, u16)>,
}

impl InnerHeader {
    /// 내장 전송 헤더 시작 오프셋 (패킷 버퍼 기준)
    pub fn transport_offset(&self) -> usize {
        self.offset + self.header_len
    }
}

// ─── 패킷 생성 ──────────────────────────────────────────────────────

fn put_ipv4_header(
    buf: &mut BytesMut,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    flags: u16,
    total: u16,
) {
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total);
    buf.put_u16(0); // id
    buf.put_u16(flags);
    buf.put_u8(ttl);
    buf.put_u8(protocol);
    buf.put_u16(0); // checksum
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
}

/// 생성기용 전체 길이. 65535바이트를 넘는 페이로드는 panic 합니다.
fn built_total_len(payload_len: usize) -> u16 {
    let total = IPV4_HEADER_LEN + payload_len;
    assert!(
        total <= usize::from(u16::MAX),
        "built datagram of {total} bytes exceeds the IPv4 maximum"
    );
    total as u16
}

fn finish(buf: BytesMut) -> Packet {
    let mut pkt = Packet {
        buf,
        meta: PacketMeta::default(),
    };
    pkt.refresh_ip_checksum();
    pkt
}

/// 체크섬이 채워진 TCP 세그먼트를 생성합니다.
pub fn build_tcp(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    flags: u8,
    payload: &[u8],
) -> Packet {
    let seg_len = TCP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + seg_len);
    put_ipv4_header(&mut buf, src, dst, Protocol::Tcp.number(), DEFAULT_TTL, 0, built_total_len(seg_len));
    buf.put_u16(sport);
    buf.put_u16(dport);
    buf.put_u32(1); // seq
    buf.put_u32(0); // ack
    buf.put_u8(0x50); // data offset = 5
    buf.put_u8(flags);
    buf.put_u16(65535); // window
    buf.put_u16(0); // checksum
    buf.put_u16(0); // urgent
    buf.put_slice(payload);

    let check =
        checksum::transport_checksum(src, dst, Protocol::Tcp.number(), &buf[IPV4_HEADER_LEN..]);
    buf[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&check.to_be_bytes());
    finish(buf)
}

/// 체크섬이 채워진 UDP 데이터그램을 생성합니다.
pub fn build_udp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Packet {
    let seg_len = UDP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + seg_len);
    put_ipv4_header(&mut buf, src, dst, Protocol::Udp.number(), DEFAULT_TTL, 0, built_total_len(seg_len));
    buf.put_u16(sport);
    buf.put_u16(dport);
    buf.put_u16(seg_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);

    let mut check =
        checksum::transport_checksum(src, dst, Protocol::Udp.number(), &buf[IPV4_HEADER_LEN..]);
    if check == 0 {
        check = 0xffff;
    }
    buf[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&check.to_be_bytes());
    finish(buf)
}

/// ICMP 메시지를 생성합니다. `rest`는 헤더의 두 번째 4바이트입니다.
pub fn build_icmp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    icmp_type: u8,
    code: u8,
    rest: u32,
    payload: &[u8],
) -> Packet {
    let msg_len = ICMP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + msg_len);
    put_ipv4_header(&mut buf, src, dst, Protocol::Icmp.number(), DEFAULT_TTL, 0, built_total_len(msg_len));
    buf.put_u8(icmp_type);
    buf.put_u8(code);
    buf.put_u16(0);
    buf.put_u32(rest);
    buf.put_slice(payload);

    let check = checksum::internet_checksum(&buf[IPV4_HEADER_LEN..]);
    buf[IPV4_HEADER_LEN + 2..IPV4_HEADER_LEN + 4].copy_from_slice(&check.to_be_bytes());
    finish(buf)
}

/// `offending` 패킷에 대한 ICMP 에러를 생성합니다.
///
/// 에러 본문은 원본 IP 헤더와 전송 계층 앞 8바이트입니다.
pub fn build_icmp_error(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    icmp_type: u8,
    code: u8,
    rest: u32,
    offending: &Packet,
) -> Packet {
    let quote_len = (offending.header_len() + 8).min(offending.len());
    build_icmp(
        src,
        dst,
        icmp_type,
        code,
        rest,
        &offending.as_bytes()[..quote_len],
    )
}
