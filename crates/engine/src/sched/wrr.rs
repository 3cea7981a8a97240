//! Weighted Round Robin
//!
//! 현재 weight 문턱(`cw`)을 최대 weight에서 시작해 weight들의 최대공약수만큼
//! 내려가며, 문턱 이상의 weight를 가진 실서버를 순서대로 선택합니다.
//! weight 3, 1이면 `D1 D1 D1 D2`가 반복됩니다.

use std::sync::{Arc, Mutex};

use super::Scheduler;
use crate::proto::FlowTuple;
use crate::service::Destination;

#[derive(Debug)]
struct WrrState {
    /// 현재 위치. `dests.len()`은 리스트 머리(head)를 뜻합니다.
    pos: usize,
    /// 현재 weight 문턱
    cw: i32,
}

/// 가중 라운드 로빈 스케줄러
#[derive(Debug)]
pub struct WeightedRoundRobin {
    state: Mutex<WrrState>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WrrState {
                pos: usize::MAX,
                cw: 0,
            }),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

fn gcd(mut a: i32, mut b: i32) -> i32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl Scheduler for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "wrr"
    }

    fn update_service(&self, _dests: &[Arc<Destination>]) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.pos = usize::MAX;
        st.cw = 0;
    }

    fn schedule(&self, dests: &[Arc<Destination>], _flow: &FlowTuple) -> Option<Arc<Destination>> {
        let n = dests.len();
        let weights = dests
            .iter()
            .filter(|d| d.is_schedulable())
            .map(|d| d.weight());
        let (mw, di) = weights.fold((0, 0), |(mw, di), w| (mw.max(w), gcd(di, w)));
        if mw <= 0 {
            return None;
        }

        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.pos > n {
            st.pos = n;
        }
        st.cw = st.cw.min(mw);

        // 최악의 경우 모든 문턱 단계 × 전체 풀을 한 번씩 본다
        let bound = (n + 1) * (mw / di) as usize + n + 1;
        for _ in 0..bound {
            if st.pos == n {
                st.pos = 0;
                st.cw -= di;
                if st.cw <= 0 {
                    st.cw = mw;
                }
            } else {
                st.pos += 1;
                if st.pos == n {
                    continue;
                }
            }

            let dest = &dests[st.pos];
            if dest.is_schedulable() && dest.weight() >= st.cw {
                return Some(Arc::clone(dest));
            }
        }
        None
    }
}
