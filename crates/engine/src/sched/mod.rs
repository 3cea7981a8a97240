//! 스케줄러 — 신규 흐름의 실서버 선택 전략
//!
//! [`Scheduler`] 구현은 서비스마다 하나씩 생성되어 서비스가 소유합니다.
//! 호출자는 서비스의 실서버 풀 읽기 가드를 잡은 채로 [`Scheduler::schedule`]을
//! 호출하므로, 스케줄러는 풀이 도중에 바뀌지 않는다고 가정할 수 있습니다.
//!
//! 선택 가능한 실서버는 [`Destination::is_schedulable`]을 만족하는 것뿐입니다.

pub mod lc;
pub mod rr;
pub mod wlc;
pub mod wrr;

use std::collections::BTreeMap;
use std::sync::Arc;

use ipvs_core::error::ServiceError;

use crate::proto::FlowTuple;
use crate::service::Destination;

pub use lc::LeastConnection;
pub use rr::RoundRobin;
pub use wlc::WeightedLeastConnection;
pub use wrr::WeightedRoundRobin;

/// 실서버 선택 전략
pub trait Scheduler: Send + Sync {
    /// 스케줄러 이름 (`rr`, `wrr`, ...)
    fn name(&self) -> &'static str;

    /// 실서버 풀 또는 weight가 바뀐 뒤 호출됩니다.
    fn update_service(&self, _dests: &[Arc<Destination>]) {}

    /// 실서버를 선택합니다. 선택 가능한 실서버가 없으면 `None`.
    fn schedule(&self, dests: &[Arc<Destination>], flow: &FlowTuple) -> Option<Arc<Destination>>;
}

type Factory = fn() -> Box<dyn Scheduler>;

/// 이름 → 스케줄러 생성자
#[derive(Clone)]
pub struct SchedulerRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl SchedulerRegistry {
    /// 빈 레지스트리
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// rr, wrr, lc, wlc가 등록된 레지스트리
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("rr", || Box::new(RoundRobin::new()));
        registry.register("wrr", || Box::new(WeightedRoundRobin::new()));
        registry.register("lc", || Box::new(LeastConnection));
        registry.register("wlc", || Box::new(WeightedLeastConnection));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: Factory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Scheduler>, ServiceError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ServiceError::UnknownScheduler(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// 연결 부하: active 연결에 inactive보다 256배 가중치
pub(crate) fn overhead(dest: &Destination) -> u64 {
    (u64::from(dest.active_conns()) << 8) + u64::from(dest.inactive_conns())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_known_schedulers() {
        let registry = SchedulerRegistry::with_defaults();
        for name in ["rr", "wrr", "lc", "wlc"] {
            assert_eq!(registry.create(name).unwrap().name(), name);
        }
        assert_eq!(registry.names().collect::<Vec<_>>(), ["lc", "rr", "wlc", "wrr"]);
    }

    #[test]
    fn registry_rejects_unknown_name() {
        let err = SchedulerRegistry::with_defaults().create("sh").err().unwrap();
        assert!(matches!(err, ServiceError::UnknownScheduler(ref n) if n == "sh"));
    }
}
