//! Round Robin

use std::sync::{Arc, Mutex};

use super::Scheduler;
use crate::proto::FlowTuple;
use crate::service::Destination;

/// 선택 가능한 실서버를 풀 순서대로 돌아가며 선택합니다.
#[derive(Debug, Default)]
pub struct RoundRobin {
    /// 마지막으로 선택한 인덱스
    last: Mutex<Option<usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "rr"
    }

    fn update_service(&self, _dests: &[Arc<Destination>]) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn schedule(&self, dests: &[Arc<Destination>], _flow: &FlowTuple) -> Option<Arc<Destination>> {
        let n = dests.len();
        if n == 0 {
            return None;
        }

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let start = last.map_or(0, |i| (i + 1) % n);
        let picked = (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| dests[i].is_schedulable())?;
        *last = Some(picked);
        Some(Arc::clone(&dests[picked]))
    }
}
