//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 엔진과 데몬은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `ipvs_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(ipvs_core::metrics::CONNECTIONS_CREATED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 프로토콜 레이블 키 (tcp, udp, icmp)
pub const LABEL_PROTOCOL: &str = "protocol";

/// 드롭 사유 레이블 키
pub const LABEL_REASON: &str = "reason";

/// 가상 서비스 레이블 키 (예: "TCP 10.0.0.1:80")
pub const LABEL_SERVICE: &str = "service";

/// 방향 레이블 키 (in, out)
pub const LABEL_DIRECTION: &str = "direction";

/// 포워딩 방식 레이블 키 (masq, droute, tunnel, local, bypass)
pub const LABEL_FORWARD: &str = "forward";

// ─── 연결 테이블 메트릭 ─────────────────────────────────────────────

/// 생성된 연결 수 (counter, label: protocol)
pub const CONNECTIONS_CREATED_TOTAL: &str = "ipvs_connections_created_total";

/// 만료되어 제거된 연결 수 (counter)
pub const CONNECTIONS_EXPIRED_TOTAL: &str = "ipvs_connections_expired_total";

/// 현재 연결 테이블 엔트리 수 (gauge)
pub const CONNECTIONS_ACTIVE: &str = "ipvs_connections_active";

/// 현재 지속성 템플릿 수 (gauge)
pub const TEMPLATES_ACTIVE: &str = "ipvs_templates_active";

/// 만료 스윕 소요 시간 (histogram, 초)
pub const SWEEP_DURATION_SECONDS: &str = "ipvs_sweep_duration_seconds";

// ─── 패킷 경로 메트릭 ───────────────────────────────────────────────

/// 처리된 패킷 수 (counter, labels: direction, protocol)
pub const PACKETS_TOTAL: &str = "ipvs_packets_total";

/// 처리된 바이트 수 (counter, labels: direction, protocol)
pub const BYTES_TOTAL: &str = "ipvs_bytes_total";

/// 드롭된 패킷 수 (counter, label: reason)
pub const PACKETS_DROPPED_TOTAL: &str = "ipvs_packets_dropped_total";

/// 스케줄링 실패 수 (counter, label: service)
pub const SCHEDULE_FAILURES_TOTAL: &str = "ipvs_schedule_failures_total";

/// 중계된 ICMP 에러 수 (counter, label: direction)
pub const ICMP_RELAYED_TOTAL: &str = "ipvs_icmp_relayed_total";

/// 전송된 패킷 수 (counter, label: forward)
pub const XMIT_TOTAL: &str = "ipvs_xmit_total";

/// 연결 동기화 메시지 수 (counter)
pub const SYNC_MESSAGES_TOTAL: &str = "ipvs_sync_messages_total";

// ─── rate 추정 메트릭 ───────────────────────────────────────────────

/// 초당 신규 연결 수 (gauge)
pub const CONNECTIONS_PER_SECOND: &str = "ipvs_connections_per_second";

/// 초당 패킷 수 (gauge, label: direction)
pub const PACKETS_PER_SECOND: &str = "ipvs_packets_per_second";

/// 초당 비트 수 (gauge, label: direction)
pub const BITS_PER_SECOND: &str = "ipvs_bits_per_second";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "ipvs_daemon_uptime_seconds";

/// Daemon: 등록된 가상 서비스 수 (gauge)
pub const DAEMON_SERVICES_CONFIGURED: &str = "ipvs_daemon_services_configured";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "ipvs_daemon_build_info";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 만료 스윕 소요 시간 히스토그램 버킷 (초)
///
/// 10us ~ 1s 범위. 테이블 크기에 비례합니다.
pub const SWEEP_DURATION_BUCKETS: [f64; 9] = [
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.1, 1.0,
];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
/// 일반적으로 `ipvs-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Connection table
    describe_counter!(
        CONNECTIONS_CREATED_TOTAL,
        "Total number of connection entries created (templates included)"
    );
    describe_counter!(
        CONNECTIONS_EXPIRED_TOTAL,
        "Total number of connection entries removed by expiry"
    );
    describe_gauge!(
        CONNECTIONS_ACTIVE,
        "Current number of entries in the connection table"
    );
    describe_gauge!(
        TEMPLATES_ACTIVE,
        "Current number of persistence templates in the connection table"
    );
    describe_histogram!(
        SWEEP_DURATION_SECONDS,
        "Time to run one expiry sweep over the connection table in seconds"
    );

    // Packet path
    describe_counter!(PACKETS_TOTAL, "Packets handled per direction and protocol");
    describe_counter!(BYTES_TOTAL, "Bytes handled per direction and protocol");
    describe_counter!(PACKETS_DROPPED_TOTAL, "Packets dropped, by reason");
    describe_counter!(
        SCHEDULE_FAILURES_TOTAL,
        "New flows for which no destination could be scheduled"
    );
    describe_counter!(
        ICMP_RELAYED_TOTAL,
        "ICMP errors relayed for load-balanced connections"
    );
    describe_counter!(XMIT_TOTAL, "Packets transmitted, by forwarding method");
    describe_counter!(
        SYNC_MESSAGES_TOTAL,
        "Connection updates handed to the sync sink"
    );

    // Rate estimator
    describe_gauge!(
        CONNECTIONS_PER_SECOND,
        "Estimated new connections per second"
    );
    describe_gauge!(PACKETS_PER_SECOND, "Estimated packets per second");
    describe_gauge!(BITS_PER_SECOND, "Estimated throughput in bits per second");

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "IPVS daemon uptime in seconds");
    describe_gauge!(
        DAEMON_SERVICES_CONFIGURED,
        "Number of virtual services loaded from configuration"
    );
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        CONNECTIONS_CREATED_TOTAL,
        CONNECTIONS_EXPIRED_TOTAL,
        CONNECTIONS_ACTIVE,
        TEMPLATES_ACTIVE,
        SWEEP_DURATION_SECONDS,
        PACKETS_TOTAL,
        BYTES_TOTAL,
        PACKETS_DROPPED_TOTAL,
        SCHEDULE_FAILURES_TOTAL,
        ICMP_RELAYED_TOTAL,
        XMIT_TOTAL,
        SYNC_MESSAGES_TOTAL,
        CONNECTIONS_PER_SECOND,
        PACKETS_PER_SECOND,
        BITS_PER_SECOND,
        DAEMON_UPTIME_SECONDS,
        DAEMON_SERVICES_CONFIGURED,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_ipvs_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("ipvs_"),
                "Metric '{}' does not start with 'ipvs_' prefix",
                name
            );
        }
    }

    #[test]
    fn counters_end_with_total() {
        for name in [
            CONNECTIONS_CREATED_TOTAL,
            CONNECTIONS_EXPIRED_TOTAL,
            PACKETS_TOTAL,
            BYTES_TOTAL,
            PACKETS_DROPPED_TOTAL,
            SCHEDULE_FAILURES_TOTAL,
            ICMP_RELAYED_TOTAL,
            XMIT_TOTAL,
            SYNC_MESSAGES_TOTAL,
        ] {
            assert!(name.ends_with("_total"), "counter '{}' lacks _total", name);
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn describe_all_does_not_panic() {
        // describe_all() should not panic even without a recorder installed
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        let labels = [
            LABEL_PROTOCOL,
            LABEL_REASON,
            LABEL_SERVICE,
            LABEL_DIRECTION,
            LABEL_FORWARD,
        ];
        for label in &labels {
            assert_eq!(
                label.to_lowercase(),
                *label,
                "Label key '{}' should be lowercase",
                label
            );
        }
    }

    #[test]
    fn sweep_duration_buckets_are_sorted() {
        let buckets = SWEEP_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(
                buckets[i] > buckets[i - 1],
                "Bucket values must be in ascending order"
            );
        }
    }
}
