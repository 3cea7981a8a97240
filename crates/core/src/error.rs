//! 에러 타입 — 도메인별 에러 정의
//!
//! 패킷 처리 경로의 실패는 에러가 아니라 verdict(Drop 등)로 표현됩니다.
//! 이 모듈의 에러는 설정, 서비스 관리, 라이프사이클 경로에서만 발생합니다.

/// IPVS 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum IpvsError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 라이프사이클 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 가상 서비스 / 실서버 관리 에러
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 라이프사이클 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,
}

/// 가상 서비스 관리 에러
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// 동일한 키의 서비스가 이미 존재
    #[error("service already exists: {0}")]
    AlreadyExists(String),

    /// 서비스를 찾을 수 없음
    #[error("service not found: {0}")]
    NotFound(String),

    /// 동일한 실서버가 이미 등록됨
    #[error("destination {dest} already exists in {service}")]
    DestinationExists { service: String, dest: String },

    /// 실서버를 찾을 수 없음
    #[error("destination {dest} not found in {service}")]
    DestinationNotFound { service: String, dest: String },

    /// 등록되지 않은 스케줄러 이름
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),

    /// 유효하지 않은 인자
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_converts_into_top_level() {
        let err: IpvsError = ServiceError::UnknownScheduler("sed".to_owned()).into();
        assert!(matches!(err, IpvsError::Service(_)));
        assert_eq!(err.to_string(), "service error: unknown scheduler: sed");
    }

    #[test]
    fn config_error_display_includes_field() {
        let err = ConfigError::InvalidValue {
            field: "engine.conn_tab_bits".to_owned(),
            reason: "must be between 8 and 20".to_owned(),
        };
        assert!(err.to_string().contains("engine.conn_tab_bits"));
    }
}
