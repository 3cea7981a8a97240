//! Weighted Least Connection
//!
//! `overhead / weight`가 가장 작은 실서버를 선택합니다. 나눗셈 대신
//! `loh * dw > doh * lw` 교차 곱으로 비교합니다.

use std::sync::Arc;

use super::{Scheduler, overhead};
use crate::proto::FlowTuple;
use crate::service::Destination;

/// 가중 최소 연결 스케줄러
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedLeastConnection;

impl Scheduler for WeightedLeastConnection {
    fn name(&self) -> &'static str {
        "wlc"
    }

    fn schedule(&self, dests: &[Arc<Destination>], _flow: &FlowTuple) -> Option<Arc<Destination>> {
        let mut candidates = dests.iter().filter(|d| d.is_schedulable());
        let mut least = candidates.next()?;
        let mut loh = overhead(least);

        for dest in candidates {
            let doh = overhead(dest);
            // weight > 0은 is_schedulable이 보장
            let lw = least.weight() as u64;
            let dw = dest.weight() as u64;
            if u128::from(loh) * u128::from(dw) > u128::from(doh) * u128::from(lw) {
                least = dest;
                loh = doh;
            }
        }
        Some(Arc::clone(least))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testing::{flow, octet, pool};

    #[test]
    fn weight_scales_capacity() {
        // D1 weight 1 with 1 inactive (1/1), D2 weight 3 with 2 inactive (2/3)
        let dests = pool("wlc", &[1, 3]);
        dests[0].bind_inactive();
        dests[1].bind_inactive();
        dests[1].bind_inactive();
        assert_eq!(
            octet(&WeightedLeastConnection.schedule(&dests, &flow()).unwrap()),
            2
        );

        // D2 3 inactive → 3/3 == 1/1, 먼저 나온 D1 유지
        dests[1].bind_inactive();
        assert_eq!(
            octet(&WeightedLeastConnection.schedule(&dests, &flow()).unwrap()),
            1
        );
    }

    #[test]
    fn empty_pool_first_pick() {
        let dests = pool("wlc", &[2, 1]);
        assert_eq!(
            octet(&WeightedLeastConnection.schedule(&dests, &flow()).unwrap()),
            1
        );
    }

    #[test]
    fn none_when_all_unavailable() {
        let dests = pool("wlc", &[1, 1]);
        for d in &dests {
            d.set_available(false);
        }
        assert!(WeightedLeastConnection.schedule(&dests, &flow()).is_none());
    }
}
