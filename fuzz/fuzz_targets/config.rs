#![no_main]

use ipvs_core::config::IpvsConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // 파싱과 검증 모두 패닉 없이 끝나야 한다
    if let Ok(config) = IpvsConfig::parse(text) {
        let _ = config.validate();
    }
});
