//! 로드밸런서 엔진 — 공유 상태와 백그라운드 유지보수 태스크의 생명주기
//!
//! [`LoadBalancer`]는 core의 [`Pipeline`](ipvs_core::pipeline::Pipeline) trait을 구현하여
//! `ipvs-daemon`에서 start/stop/health_check로 관리됩니다. 패킷 처리 자체는
//! 호출자 스레드에서 동기적으로 수행되며, 엔진이 스폰하는 태스크는 주기 작업만 담당합니다.
//!
//! # 내부 아키텍처
//! ```text
//! NetStack hooks ──> LoadBalancer::process() ──> pipeline ──> Verdict
//!                            │
//!                   Arc<LoadBalancerState>
//!                            │
//!        maintenance task ───┴── sweep (sweep_interval_ms)
//!                             └─ rate estimation (stats_interval_secs)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ipvs_core::config::IpvsConfig;
use ipvs_core::error::{IpvsError, PipelineError};
use ipvs_core::pipeline::{HealthStatus, Pipeline};

use crate::packet::Packet;
use crate::pipeline::{self, Hook, Verdict};
use crate::sched::SchedulerRegistry;
use crate::stack::{NetStack, SyncSink};
use crate::state::LoadBalancerState;

/// 연결 테이블 사용률이 이 값을 넘으면 Degraded
const TABLE_PRESSURE: f64 = 0.9;

/// 엔진 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 로드밸런서 엔진
///
/// # 사용 예시
/// ```ignore
/// use ipvs_engine::{Hook, LoadBalancerBuilder};
///
/// let mut lb = LoadBalancerBuilder::new()
///     .config(config)
///     .stack(stack)
///     .build()?;
///
/// lb.start().await?;
/// let verdict = lb.process(Hook::LocalIn, pkt);
/// ```
pub struct LoadBalancer {
    shared: Arc<LoadBalancerState>,
    state: EngineState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LoadBalancer {
    /// 공유 상태 (서비스 관리, 통계 조회용)
    pub fn state(&self) -> &Arc<LoadBalancerState> {
        &self.shared
    }

    /// 현재 실행 상태 이름
    pub fn state_name(&self) -> &'static str {
        match self.state {
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        }
    }

    /// 훅 하나로 패킷을 처리합니다.
    pub fn process(&self, hook: Hook, pkt: Packet) -> Verdict {
        self.shared.process(hook, pkt)
    }

    /// 여러 훅을 순서대로 통과시킵니다. `Accept`가 아닌 첫 verdict에서 멈춥니다.
    pub fn process_chain(&self, hooks: &[Hook], pkt: Packet) -> Verdict {
        pipeline::process_chain(&self.shared, hooks, pkt)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let sweep_every = Duration::from_millis(shared.config.engine.sweep_interval_ms);
        let stats_every = Duration::from_secs(shared.config.engine.stats_interval_secs);

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut stats = tokio::time::interval(stats_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        shared.sweep(Instant::now());
                    }
                    _ = stats.tick() => {
                        shared.publish_metrics(Instant::now());
                    }
                }
            }
            debug!("maintenance task exited");
        })
    }

    fn table_utilization(&self) -> f64 {
        let max = self.shared.config.engine.max_connections.max(1);
        self.shared.conns.len() as f64 / max as f64
    }
}

impl Pipeline for LoadBalancer {
    async fn start(&mut self) -> Result<(), IpvsError> {
        if self.state == EngineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("starting load balancer");

        // 정지 후 재시작하면 이전 토큰은 이미 취소된 상태
        self.cancel = CancellationToken::new();
        let task = self.spawn_maintenance();
        self.tasks.push(task);

        self.state = EngineState::Running;
        info!(
            services = self.shared.services.len(),
            buckets = self.shared.conns.bucket_count(),
            "load balancer started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IpvsError> {
        if self.state != EngineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping load balancer");

        // 1. 주기 작업 중단
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }

        // 2. 남은 연결 정리
        let flushed = self.shared.conns.flush();
        if flushed > 0 {
            info!(count = flushed, "flushed remaining connections");
        }

        self.state = EngineState::Stopped;
        info!("load balancer stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            EngineState::Running => {
                let utilization = self.table_utilization();
                if utilization > TABLE_PRESSURE {
                    return HealthStatus::Degraded(format!(
                        "connection table utilization high: {:.1}%",
                        utilization * 100.0
                    ));
                }

                let idle: Vec<String> = self
                    .shared
                    .services
                    .services()
                    .iter()
                    .filter(|svc| !svc.has_schedulable())
                    .map(|svc| svc.key.to_string())
                    .collect();
                if idle.is_empty() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded(format!(
                        "no schedulable destination: {}",
                        idle.join(", ")
                    ))
                }
            }
            EngineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            EngineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("state", &self.state_name())
            .field("shared", &self.shared)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// 로드밸런서 빌더
///
/// 네트워크 스택은 필수이며, 동기화 대상과 스케줄러 레지스트리는 선택입니다.
pub struct LoadBalancerBuilder {
    config: IpvsConfig,
    stack: Option<Arc<dyn NetStack>>,
    sync: Option<Arc<dyn SyncSink>>,
    schedulers: SchedulerRegistry,
}

impl LoadBalancerBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: IpvsConfig::default(),
            stack: None,
            sync: None,
            schedulers: SchedulerRegistry::with_defaults(),
        }
    }

    /// 엔진 설정과 정적 서비스 목록을 지정합니다.
    pub fn config(mut self, config: IpvsConfig) -> Self {
        self.config = config;
        self
    }

    /// 호스트 네트워크 스택을 지정합니다.
    pub fn stack(mut self, stack: Arc<dyn NetStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// 연결 동기화 대상을 지정합니다 (`engine.sync_master`가 켜져 있을 때만 사용).
    pub fn sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync = Some(sink);
        self
    }

    /// 스케줄러 레지스트리를 교체합니다.
    pub fn schedulers(mut self, schedulers: SchedulerRegistry) -> Self {
        self.schedulers = schedulers;
        self
    }

    /// 설정을 검증하고 정적 서비스를 등록한 엔진을 생성합니다.
    pub fn build(self) -> Result<LoadBalancer, IpvsError> {
        self.config.validate()?;

        let stack = self.stack.ok_or_else(|| {
            IpvsError::Pipeline(PipelineError::InitFailed(
                "network stack is required".to_owned(),
            ))
        })?;

        if self.config.engine.sync_master && self.sync.is_none() {
            warn!("sync_master is enabled but no sync sink was provided");
        }

        let services = self.config.services.clone();
        let shared = Arc::new(LoadBalancerState::new(
            self.config,
            stack,
            self.sync,
            self.schedulers,
        ));
        shared.apply_services(&services)?;

        Ok(LoadBalancer {
            shared,
            state: EngineState::Initialized,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }
}

impl Default for LoadBalancerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::stack::{Route, RouteKind};

    struct NullStack;

    impl NetStack for NullStack {
        fn route(&self, _daddr: Ipv4Addr) -> Option<Route> {
            Some(Route {
                kind: RouteKind::Unicast,
                mtu: 1500,
                src: Ipv4Addr::new(10, 0, 0, 254),
            })
        }

        fn send(&self, _pkt: Packet, _route: &Route) {}

        fn icmp_send(&self, _pkt: &Packet, _icmp_type: u8, _code: u8, _info: u32) {}
    }

    fn builder() -> LoadBalancerBuilder {
        LoadBalancerBuilder::new().stack(Arc::new(NullStack))
    }

    const ONE_SERVICE: &str = r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 80
scheduler = "rr"

[[services.destinations]]
address = "192.168.1.10"
port = 8080
"#;

    #[test]
    fn builder_creates_engine() {
        let lb = builder().build().unwrap();
        assert_eq!(lb.state_name(), "initialized");
        assert!(lb.state().services.is_empty());
    }

    #[test]
    fn builder_requires_stack() {
        let err = LoadBalancerBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("network stack is required"));
    }

    #[test]
    fn builder_with_invalid_config_fails() {
        let mut config = IpvsConfig::default();
        config.engine.conn_tab_bits = 30;
        assert!(builder().config(config).build().is_err());
    }

    #[test]
    fn builder_registers_configured_services() {
        let config = IpvsConfig::parse(ONE_SERVICE).unwrap();
        let lb = builder().config(config).build().unwrap();
        assert_eq!(lb.state().services.len(), 1);
        let svc = &lb.state().services.services()[0];
        assert_eq!(svc.dest_count(), 1);
        assert_eq!(svc.scheduler().name(), "rr");
    }

    #[tokio::test]
    async fn pipeline_lifecycle() {
        let mut lb = builder().build().unwrap();

        // Before start
        assert!(lb.health_check().await.is_unhealthy());
        assert!(lb.stop().await.is_err());

        lb.start().await.unwrap();
        assert_eq!(lb.state_name(), "running");
        assert!(lb.health_check().await.is_healthy());
        assert!(lb.start().await.is_err());

        lb.stop().await.unwrap();
        assert_eq!(lb.state_name(), "stopped");
        assert_eq!(
            lb.health_check().await,
            HealthStatus::Unhealthy("stopped".to_owned())
        );

        // Restart after stop
        lb.start().await.unwrap();
        lb.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_degraded_without_schedulable_destination() {
        let config = IpvsConfig::parse(ONE_SERVICE).unwrap();
        let mut lb = builder().config(config).build().unwrap();
        lb.start().await.unwrap();

        let svc = lb.state().services.services()[0].clone();
        svc.pool()[0].set_weight(0);

        match lb.health_check().await {
            HealthStatus::Degraded(msg) => assert!(msg.contains("TCP 10.0.0.1:80")),
            other => panic!("expected degraded, got {other:?}"),
        }
        lb.stop().await.unwrap();
    }
}
