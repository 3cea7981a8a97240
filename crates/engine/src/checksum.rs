//! 인터넷 체크섬 — 전체 계산과 RFC 1624 증분 갱신
//!
//! NAT 경로에서는 주소/포트만 바뀌므로 증분 갱신(`csum_replace*`)을 사용하고,
//! 페이로드가 변경된 경우와 ICMP 중계 경로에서는 전체 재계산을 사용합니다.

use std::net::Ipv4Addr;

/// 16비트 워드 단위 1의 보수 합을 누적합니다 (fold 전).
pub fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
        // 32비트 오버플로 방지를 위해 주기적으로 접기
        if sum & 0x8000_0000 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// 32비트 누적 합을 16비트로 접습니다 (보수 적용 전).
pub fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// RFC 1071 인터넷 체크섬
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// 체크섬 필드를 포함한 데이터가 유효한지 확인합니다.
pub fn verify(data: &[u8], initial: u32) -> bool {
    fold(sum_words(data, initial)) == 0xffff
}

/// TCP/UDP pseudo-header 합
pub fn pseudo_header_sum(saddr: Ipv4Addr, daddr: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = sum_words(&saddr.octets(), 0);
    sum = sum_words(&daddr.octets(), sum);
    sum = sum.wrapping_add(u32::from(protocol));
    // 세그먼트 길이는 IP total length(u16) 범위 안에 있음
    sum.wrapping_add(len as u32 & 0xffff)
}

/// pseudo-header를 포함한 전송 계층 체크섬
///
/// `segment`의 체크섬 필드는 0으로 채워져 있어야 합니다.
pub fn transport_checksum(saddr: Ipv4Addr, daddr: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let pseudo = pseudo_header_sum(saddr, daddr, protocol, segment.len());
    !fold(sum_words(segment, pseudo))
}

/// 16비트 필드 변경에 따른 체크섬 증분 갱신 (RFC 1624, eqn. 3)
///
/// `HC' = ~(~HC + ~m + m')`
pub fn csum_replace2(check: u16, old: u16, new: u16) -> u16 {
    let sum = u32::from(!check) + u32::from(!old) + u32::from(new);
    !fold(sum)
}

/// 32비트 필드(IPv4 주소) 변경에 따른 체크섬 증분 갱신
pub fn csum_replace4(check: u16, old: u32, new: u32) -> u16 {
    let sum = u32::from(!check)
        + u32::from(!((old >> 16) as u16))
        + u32::from(!(old as u16))
        + u32::from((new >> 16) as u16)
        + u32::from(new as u16);
    !fold(sum)
}
