//! 로드밸런서 상태 — 모든 훅이 공유하는 테이블과 레지스트리
//!
//! [`LoadBalancerState`]는 시작 시 한 번 생성되어 `Arc`로 공유됩니다.
//! 전역 변수나 지연 초기화 없이 모든 패킷 처리 함수가 이 구조체를 인자로 받습니다.
//!
//! # 구성
//! ```text
//! LoadBalancerState
//!   ├── config      (IpvsConfig, 불변)
//!   ├── conns       (ConnTable)
//!   ├── services    (ServiceTable)
//!   ├── stats       (전역 Stats)
//!   ├── protocols   (ProtocolRegistry: tcp / udp / icmp)
//!   ├── schedulers  (SchedulerRegistry: rr / wrr / lc / wlc)
//!   ├── stack       (Arc<dyn NetStack>)
//!   ├── sync        (Option<Arc<dyn SyncSink>>)
//!   └── counters    (EngineCounters)
//! ```

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use ipvs_core::config::{IpvsConfig, ServiceConfig};
use ipvs_core::metrics as m;

use crate::conn::{ConnTable, SweepReport};
use crate::error::EngineError;
use crate::packet::Packet;
use crate::pipeline::{self, Hook, Verdict};
use crate::proto::ProtocolRegistry;
use crate::sched::SchedulerRegistry;
use crate::service::{DestSpec, Destination, Service, ServiceKey, ServiceSpec, ServiceTable};
use crate::stack::{NetStack, SyncSink};
use crate::stats::{EngineCounters, RateSnapshot, Stats};

/// 로드밸런서 공유 상태
pub struct LoadBalancerState {
    pub config: IpvsConfig,
    pub conns: ConnTable,
    pub services: ServiceTable,
    /// 전역 통계
    pub stats: Stats,
    pub protocols: ProtocolRegistry,
    pub schedulers: SchedulerRegistry,
    pub stack: Arc<dyn NetStack>,
    pub sync: Option<Arc<dyn SyncSink>>,
    pub counters: EngineCounters,
}

impl LoadBalancerState {
    pub fn new(
        config: IpvsConfig,
        stack: Arc<dyn NetStack>,
        sync: Option<Arc<dyn SyncSink>>,
        schedulers: SchedulerRegistry,
    ) -> Self {
        let engine = &config.engine;
        let conns = ConnTable::new(engine.conn_tab_bits, engine.max_connections);
        let protocols = ProtocolRegistry::new(&engine.timeouts);
        Self {
            conns,
            services: ServiceTable::new(),
            stats: Stats::new(),
            protocols,
            schedulers,
            stack,
            sync,
            counters: EngineCounters::default(),
            config,
        }
    }

    /// 훅 하나로 패킷을 처리합니다.
    pub fn process(&self, hook: Hook, pkt: Packet) -> Verdict {
        pipeline::process(self, hook, pkt)
    }

    // --- 서비스 관리 ---

    /// 가상 서비스를 등록합니다. 스케줄러는 이름으로 레지스트리에서 생성합니다.
    pub fn add_service(&self, spec: ServiceSpec) -> Result<Arc<Service>, EngineError> {
        let scheduler = self.schedulers.create(&spec.scheduler)?;
        Ok(self.services.add_service(spec, scheduler)?)
    }

    /// 실서버를 추가합니다. 주소가 로컬로 라우팅되면 로컬 전달로 설정됩니다.
    pub fn add_destination(
        &self,
        key: &ServiceKey,
        spec: DestSpec,
    ) -> Result<Arc<Destination>, EngineError> {
        let local = self.is_local_addr(spec.addr);
        Ok(self.services.add_destination(key, spec, local)?)
    }

    fn is_local_addr(&self, addr: Ipv4Addr) -> bool {
        self.stack.route(addr).is_some_and(|rt| rt.is_local())
    }

    /// 설정 파일의 서비스 목록을 등록합니다.
    pub fn apply_services(&self, services: &[ServiceConfig]) -> Result<usize, EngineError> {
        for svc_cfg in services {
            let svc = self.add_service(ServiceSpec::from_config(svc_cfg))?;
            for dest_cfg in &svc_cfg.destinations {
                self.add_destination(&svc.key, DestSpec::from_config(dest_cfg))?;
            }
        }
        let count = self.services.len();
        metrics::gauge!(m::DAEMON_SERVICES_CONFIGURED).set(count as f64);
        info!(services = count, "services configured");
        Ok(count)
    }

    // --- 주기 작업 ---

    /// 만료된 연결을 정리합니다.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let started = Instant::now();
        let report = self.conns.sweep(now);
        let elapsed = started.elapsed();

        metrics::histogram!(m::SWEEP_DURATION_SECONDS).record(elapsed.as_secs_f64());
        metrics::gauge!(m::CONNECTIONS_ACTIVE).set(self.conns.len() as f64);
        metrics::gauge!(m::TEMPLATES_ACTIVE).set(self.conns.template_count() as f64);

        if report.expired > 0 {
            debug!(
                expired = report.expired,
                rearmed = report.rearmed,
                remaining = report.remaining,
                elapsed_us = elapsed.as_micros() as u64,
                "expiry sweep"
            );
        }
        report
    }

    /// 모든 통계의 rate 추정을 갱신하고 전역 rate를 메트릭으로 내보냅니다.
    pub fn publish_metrics(&self, now: Instant) -> RateSnapshot {
        for svc in self.services.services() {
            svc.stats.estimate(now);
            for dest in svc.pool().iter() {
                dest.stats.estimate(now);
            }
        }

        let rates = self.stats.estimate(now);
        metrics::gauge!(m::CONNECTIONS_PER_SECOND).set(rates.cps);
        metrics::gauge!(m::PACKETS_PER_SECOND, m::LABEL_DIRECTION => "in").set(rates.inpps);
        metrics::gauge!(m::PACKETS_PER_SECOND, m::LABEL_DIRECTION => "out").set(rates.outpps);
        metrics::gauge!(m::BITS_PER_SECOND, m::LABEL_DIRECTION => "in").set(rates.inbps);
        metrics::gauge!(m::BITS_PER_SECOND, m::LABEL_DIRECTION => "out").set(rates.outbps);
        rates
    }

    /// 엔진 카운터 스냅샷 (JSON 출력용)
    pub fn counters_snapshot(&self) -> serde_json::Value {
        let c = &self.counters;
        serde_json::json!({
            "connections": self.conns.len(),
            "templates": self.conns.template_count(),
            "routing_loops": EngineCounters::get(&c.routing_loops),
            "csum_errors": EngineCounters::get(&c.csum_errors),
            "schedule_failures": EngineCounters::get(&c.schedule_failures),
            "icmp_relayed": EngineCounters::get(&c.icmp_relayed),
            "sync_messages": EngineCounters::get(&c.sync_messages),
            "dropped": EngineCounters::get(&c.dropped),
            "stats": self.stats.snapshot(),
        })
    }
}

impl std::fmt::Debug for LoadBalancerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerState")
            .field("conns", &self.conns)
            .field("services", &self.services)
            .field("protocols", &self.protocols)
            .field("schedulers", &self.schedulers)
            .field("sync", &self.sync.is_some())
            .finish()
    }
}
