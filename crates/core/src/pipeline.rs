//! 파이프라인 trait — 장기 실행 컴포넌트의 라이프사이클 정의

use serde::Serialize;

use crate::error::IpvsError;

/// 컴포넌트 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 일부 기능이 저하됨 (예: 가용 실서버가 없는 서비스)
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 동작 불가 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// 시작/정지/상태 확인이 가능한 장기 실행 컴포넌트
///
/// 로드밸런서 엔진은 이 trait을 구현하여 데몬이 동일한 방식으로
/// 백그라운드 태스크(만료 스윕, 통계 추정)를 관리할 수 있게 합니다.
#[allow(async_fn_in_trait)]
pub trait Pipeline {
    /// 백그라운드 태스크를 시작합니다.
    async fn start(&mut self) -> Result<(), IpvsError>;

    /// 백그라운드 태스크를 정지하고 리소스를 정리합니다.
    async fn stop(&mut self) -> Result<(), IpvsError>;

    /// 현재 상태를 반환합니다.
    async fn health_check(&self) -> HealthStatus;
}
