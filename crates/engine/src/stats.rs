//! 통계 수집 — 목적지/서비스/전역 카운터와 rate 추정
//!
//! [`Stats`]는 패킷 경로에서 갱신되는 누적 카운터 묶음입니다. 목적지, 서비스,
//! 전역 통계가 각각 하나씩 있으며 항상 이 순서로 갱신됩니다. 각 갱신은 자기
//! 잠금 하나만 잡으므로 잠금이 중첩되지 않습니다.
//!
//! # 데이터 흐름
//! ```text
//! packet path ──record_*──▶ Stats (Mutex<StatsSnapshot>)
//!                                │ snapshot()
//!                                ▼
//!            stats task ──update──▶ RateEstimator (EWMA cps/pps/bps)
//!                                │
//!                                ▼
//!                         metrics::gauge!/counter!
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// 누적 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// 스케줄된 연결 수
    pub conns: u64,
    pub inpkts: u64,
    pub outpkts: u64,
    pub inbytes: u64,
    pub outbytes: u64,
}

/// 누적 카운터 + rate 추정 상태
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<StatsSnapshot>,
    estimator: Mutex<RateEstimator>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 신규 연결 1건을 기록합니다.
    pub fn record_conn(&self) {
        self.with(|c| c.conns += 1);
    }

    /// 인바운드 패킷 1건을 기록합니다.
    pub fn record_in(&self, bytes: usize) {
        self.with(|c| {
            c.inpkts += 1;
            c.inbytes += bytes as u64;
        });
    }

    /// 아웃바운드 패킷 1건을 기록합니다.
    pub fn record_out(&self, bytes: usize) {
        self.with(|c| {
            c.outpkts += 1;
            c.outbytes += bytes as u64;
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 카운터와 추정기를 0으로 되돌립니다.
    pub fn reset(&self) {
        self.with(|c| *c = StatsSnapshot::default());
        *self.estimator.lock().unwrap_or_else(|e| e.into_inner()) = RateEstimator::new();
    }

    /// 현재 카운터로 rate 추정을 한 단계 진행합니다.
    pub fn estimate(&self, now: Instant) -> RateSnapshot {
        let raw = self.snapshot();
        let mut est = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        est.update_at(raw, now);
        est.rates()
    }

    /// 마지막 추정 결과
    pub fn rates(&self) -> RateSnapshot {
        self.estimator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rates()
    }

    fn with(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        let mut guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

/// 초당 rate 추정값
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub cps: f64,
    pub inpps: f64,
    pub outpps: f64,
    pub inbps: f64,
    pub outbps: f64,
}

/// 지수 가중 이동 평균 rate 추정기
///
/// 매 호출마다 이전 스냅샷과의 delta를 경과 시간으로 나눈 순간 rate를 구하고
/// `rate += (sample - rate) / 4`로 평활합니다. 첫 호출은 누적값만 저장합니다.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    rates: RateSnapshot,
    last_poll: Option<Instant>,
    prev_raw: Option<StatsSnapshot>,
}

/// EWMA 가중치 (1/4)
const EWMA_WEIGHT: f64 = 0.25;

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rates(&self) -> RateSnapshot {
        self.rates
    }

    pub fn update(&mut self, raw: StatsSnapshot) {
        self.update_at(raw, Instant::now());
    }

    pub fn update_at(&mut self, raw: StatsSnapshot, now: Instant) {
        if let (Some(prev), Some(last)) = (self.prev_raw, self.last_poll) {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let r = &mut self.rates;
                smooth(&mut r.cps, raw.conns, prev.conns, elapsed, 1.0);
                smooth(&mut r.inpps, raw.inpkts, prev.inpkts, elapsed, 1.0);
                smooth(&mut r.outpps, raw.outpkts, prev.outpkts, elapsed, 1.0);
                // bytes → bits
                smooth(&mut r.inbps, raw.inbytes, prev.inbytes, elapsed, 8.0);
                smooth(&mut r.outbps, raw.outbytes, prev.outbytes, elapsed, 8.0);
            }
        }

        self.prev_raw = Some(raw);
        self.last_poll = Some(now);
    }
}

#[allow(clippy::cast_precision_loss)]
fn smooth(rate: &mut f64, current: u64, prev: u64, elapsed: f64, scale: f64) {
    let sample = current.saturating_sub(prev) as f64 * scale / elapsed;
    *rate += (sample - *rate) * EWMA_WEIGHT;
}

/// 엔진 전역 이벤트 카운터
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// 로컬 주소로 되돌아가 드롭된 DR/터널 패킷
    pub routing_loops: AtomicU64,
    /// 체크섬 검증 실패
    pub csum_errors: AtomicU64,
    /// 목적지를 고르지 못한 신규 흐름
    pub schedule_failures: AtomicU64,
    /// 중계된 ICMP 에러
    pub icmp_relayed: AtomicU64,
    /// 동기화 전송
    pub sync_messages: AtomicU64,
    /// 드롭된 패킷
    pub dropped: AtomicU64,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
