#![no_main]

use ipvs_engine::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // 크래시나 패닉 없이 Ok 또는 Err을 반환해야 한다
    let Ok(pkt) = Packet::from_slice(data) else {
        return;
    };

    let _ = pkt.ports();
    let _ = pkt.tcp_flags();
    let _ = pkt.icmp_type_code();
    if let Some(inner) = pkt.icmp_inner() {
        assert!(inner.offset + inner.header_len <= pkt.len());
    }
    let _ = pkt.ip_checksum_ok();
});
