//! Least Connection

use std::sync::Arc;

use super::{Scheduler, overhead};
use crate::proto::FlowTuple;
use crate::service::Destination;

/// 부하(`active * 256 + inactive`)가 가장 작은 실서버를 선택합니다.
/// 동률이면 풀에서 앞선 실서버가 선택됩니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastConnection;

impl Scheduler for LeastConnection {
    fn name(&self) -> &'static str {
        "lc"
    }

    fn schedule(&self, dests: &[Arc<Destination>], _flow: &FlowTuple) -> Option<Arc<Destination>> {
        dests
            .iter()
            .filter(|d| d.is_schedulable())
            .min_by_key(|d| overhead(d))
            .cloned()
    }
}
