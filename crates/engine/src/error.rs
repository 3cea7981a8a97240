//! 엔진 에러 타입
//!
//! [`EngineError`]는 엔진 구성 및 관리 경로에서 발생하는 에러를 표현합니다.
//! `From<EngineError> for IpvsError` 변환이 구현되어 있어 데몬에서 `?`로
//! 전파할 수 있습니다. 패킷 경로의 실패는 에러가 아니라
//! [`Verdict::Drop`](crate::pipeline::Verdict::Drop)으로 표현됩니다.

use ipvs_core::error::{IpvsError, PipelineError, ServiceError};

use crate::conn::ConnError;
use crate::packet::PacketError;

/// 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 연결 테이블 삽입 실패
    #[error("connection table: {0}")]
    Conn(#[from] ConnError),

    /// 패킷 파싱 실패
    #[error("packet: {0}")]
    Packet(#[from] PacketError),

    /// 서비스 관리 실패
    #[error("service: {0}")]
    Service(#[from] ServiceError),

    /// 엔진 설정 에러
    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },
}

impl From<EngineError> for IpvsError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Service(e) => IpvsError::Service(e),
            other => IpvsError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
