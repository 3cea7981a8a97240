//! 설정 관리 — ipvs.toml 파싱 및 런타임 설정
//!
//! [`IpvsConfig`]는 엔진 튜닝 값, 메트릭 엔드포인트, 정적 가상 서비스 목록을
//! 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`IPVS_ENGINE_CONN_TAB_BITS=16` 형식)
//! 3. 설정 파일 (`ipvs.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), ipvs_core::error::IpvsError> {
//! use ipvs_core::config::IpvsConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = IpvsConfig::load("ipvs.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = IpvsConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, IpvsError};
use crate::types::{ForwardMethod, Protocol};

/// 지원하는 스케줄러 이름
pub const SCHEDULER_NAMES: [&str; 4] = ["rr", "wrr", "lc", "wlc"];

/// IPVS 통합 설정
///
/// `ipvs.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpvsConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 엔진 튜닝 설정
    #[serde(default)]
    pub engine: EngineConfig,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 정적 가상 서비스 목록
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl IpvsConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    ///
    /// 설정 로딩 순서:
    /// 1. TOML 파일 파싱
    /// 2. 환경변수 오버라이드 적용
    /// 3. 유효성 검증
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IpvsError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, IpvsError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IpvsError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                IpvsError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, IpvsError> {
        toml::from_str(toml_str).map_err(|e| {
            IpvsError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `IPVS_{SECTION}_{FIELD}`
    /// 예: `IPVS_ENGINE_EXPIRE_NODEST_CONN=true`
    ///
    /// 서비스 목록은 구조가 중첩되어 있어 환경변수로 덮어쓰지 않습니다.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "IPVS_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "IPVS_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "IPVS_GENERAL_PID_FILE");

        // Engine
        override_u32(
            &mut self.engine.conn_tab_bits,
            "IPVS_ENGINE_CONN_TAB_BITS",
        );
        override_usize(
            &mut self.engine.max_connections,
            "IPVS_ENGINE_MAX_CONNECTIONS",
        );
        override_bool(
            &mut self.engine.expire_nodest_conn,
            "IPVS_ENGINE_EXPIRE_NODEST_CONN",
        );
        override_bool(
            &mut self.engine.expire_quiescent_template,
            "IPVS_ENGINE_EXPIRE_QUIESCENT_TEMPLATE",
        );
        override_bool(&mut self.engine.cache_bypass, "IPVS_ENGINE_CACHE_BYPASS");
        override_bool(&mut self.engine.nat_icmp_send, "IPVS_ENGINE_NAT_ICMP_SEND");
        override_bool(&mut self.engine.sync_master, "IPVS_ENGINE_SYNC_MASTER");
        override_u32(
            &mut self.engine.sync_threshold,
            "IPVS_ENGINE_SYNC_THRESHOLD",
        );
        override_u32(&mut self.engine.sync_period, "IPVS_ENGINE_SYNC_PERIOD");
        override_u64(
            &mut self.engine.sweep_interval_ms,
            "IPVS_ENGINE_SWEEP_INTERVAL_MS",
        );
        override_u64(
            &mut self.engine.stats_interval_secs,
            "IPVS_ENGINE_STATS_INTERVAL_SECS",
        );

        // Timeouts
        override_u64(
            &mut self.engine.timeouts.tcp_secs,
            "IPVS_ENGINE_TIMEOUT_TCP_SECS",
        );
        override_u64(
            &mut self.engine.timeouts.tcp_fin_secs,
            "IPVS_ENGINE_TIMEOUT_TCP_FIN_SECS",
        );
        override_u64(
            &mut self.engine.timeouts.udp_secs,
            "IPVS_ENGINE_TIMEOUT_UDP_SECS",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "IPVS_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "IPVS_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "IPVS_METRICS_PORT");
        override_string(&mut self.metrics.endpoint, "IPVS_METRICS_ENDPOINT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), IpvsError> {
        // log_level 검증
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        // log_format 검증
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        self.engine.validate()?;

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid(
                "metrics.port",
                "port must be non-zero when metrics are enabled".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for (idx, svc) in self.services.iter().enumerate() {
            svc.validate(idx)?;
            if !seen.insert(svc.key_string()) {
                return Err(invalid(
                    &format!("services[{idx}]"),
                    format!("duplicate service {}", svc.key_string()),
                ));
            }
        }

        Ok(())
    }
}

// Default는 derive 매크로로 자동 생성 (각 필드가 Default를 구현하므로)

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 생성하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 엔진 튜닝 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 연결 테이블 버킷 수 (2^bits)
    pub conn_tab_bits: u32,
    /// 연결 테이블 최대 엔트리 수 (초과 시 신규 연결 거부)
    pub max_connections: usize,
    /// 실서버가 사라진 연결을 다음 패킷에서 즉시 만료
    pub expire_nodest_conn: bool,
    /// 가중치 0(quiesced) 실서버를 가리키는 템플릿을 무효화
    pub expire_quiescent_template: bool,
    /// fwmark 서비스에 실서버가 없을 때 원래 목적지로 바이패스
    pub cache_bypass: bool,
    /// 연결이 없는 실서버 응답에 ICMP port-unreachable 회신
    pub nat_icmp_send: bool,
    /// 연결 동기화 마스터 모드
    pub sync_master: bool,
    /// 동기화 임계 패킷 수
    pub sync_threshold: u32,
    /// 동기화 주기 (패킷 수)
    pub sync_period: u32,
    /// 만료 스윕 주기 (밀리초)
    pub sweep_interval_ms: u64,
    /// 통계 rate 추정 주기 (초)
    pub stats_interval_secs: u64,
    /// 프로토콜 상태별 타임아웃
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conn_tab_bits: 12,
            max_connections: 1 << 20,
            expire_nodest_conn: false,
            expire_quiescent_template: false,
            cache_bypass: false,
            nat_icmp_send: false,
            sync_master: false,
            sync_threshold: 3,
            sync_period: 50,
            sweep_interval_ms: 1000,
            stats_interval_secs: 2,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), IpvsError> {
        if !(8..=20).contains(&self.conn_tab_bits) {
            return Err(invalid(
                "engine.conn_tab_bits",
                "must be between 8 and 20".to_owned(),
            ));
        }
        if self.max_connections == 0 {
            return Err(invalid(
                "engine.max_connections",
                "must be greater than 0".to_owned(),
            ));
        }
        if self.sync_period == 0 || self.sync_threshold >= self.sync_period {
            return Err(invalid(
                "engine.sync_threshold",
                format!(
                    "threshold ({}) must be less than a non-zero period ({})",
                    self.sync_threshold, self.sync_period
                ),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid(
                "engine.sweep_interval_ms",
                "must be greater than 0".to_owned(),
            ));
        }
        if self.stats_interval_secs == 0 {
            return Err(invalid(
                "engine.stats_interval_secs",
                "must be greater than 0".to_owned(),
            ));
        }
        for (field, value) in [
            ("engine.timeouts.tcp_secs", self.timeouts.tcp_secs),
            ("engine.timeouts.tcp_fin_secs", self.timeouts.tcp_fin_secs),
            ("engine.timeouts.udp_secs", self.timeouts.udp_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "timeout must be greater than 0".to_owned()));
            }
        }
        Ok(())
    }
}

/// 프로토콜 타임아웃 설정 (ipvsadm --set 에 해당)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP ESTABLISHED 상태 타임아웃 (초)
    pub tcp_secs: u64,
    /// TCP FIN_WAIT 상태 타임아웃 (초)
    pub tcp_fin_secs: u64,
    /// UDP 타임아웃 (초)
    pub udp_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tcp_secs: 15 * 60,
            tcp_fin_secs: 2 * 60,
            udp_secs: 5 * 60,
        }
    }
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 리스닝 주소
    pub listen_addr: String,
    /// 리스닝 포트
    pub port: u16,
    /// 스크레이프 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// 가상 서비스 설정
///
/// `address`/`port` 조합 또는 `fwmark` 중 하나로 서비스를 식별합니다.
///
/// ```toml
/// [[services]]
/// protocol = "tcp"
/// address = "10.0.0.1"
/// port = 80
/// scheduler = "rr"
///
/// [[services.destinations]]
/// address = "192.168.1.10"
/// port = 8080
/// weight = 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// L4 프로토콜 (tcp, udp)
    pub protocol: Protocol,
    /// 가상 IP (fwmark 서비스에서는 생략)
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    /// 가상 포트 (0이면 모든 포트)
    #[serde(default)]
    pub port: u16,
    /// 방화벽 마크 (설정 시 주소/포트 대신 마크로 매칭)
    #[serde(default)]
    pub fwmark: Option<u32>,
    /// 스케줄러 이름
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// 클라이언트 지속성(persistence) 사용 여부
    #[serde(default)]
    pub persistent: bool,
    /// 지속성 템플릿 타임아웃 (초)
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_secs: u64,
    /// 지속성 그룹 넷마스크
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    /// 기본 포워딩 방식
    #[serde(default)]
    pub forward: ForwardMethod,
    /// 실서버 목록
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_scheduler() -> String {
    "wlc".to_owned()
}

fn default_persistence_timeout() -> u64 {
    300
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

impl ServiceConfig {
    /// 로그/에러 메시지용 서비스 식별 문자열
    pub fn key_string(&self) -> String {
        match (self.fwmark, self.address) {
            (Some(mark), _) => format!("FWM {mark}"),
            (None, Some(addr)) => format!("{} {}:{}", self.protocol, addr, self.port),
            (None, None) => format!("{} <none>:{}", self.protocol, self.port),
        }
    }

    fn validate(&self, idx: usize) -> Result<(), IpvsError> {
        let field = |name: &str| format!("services[{idx}].{name}");

        if !matches!(self.protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(invalid(
                &field("protocol"),
                "must be tcp or udp".to_owned(),
            ));
        }
        match (self.fwmark, self.address) {
            (Some(0), _) => {
                return Err(invalid(&field("fwmark"), "must be non-zero".to_owned()));
            }
            (Some(_), Some(_)) => {
                return Err(invalid(
                    &field("address"),
                    "fwmark services must not set an address".to_owned(),
                ));
            }
            (None, None) => {
                return Err(invalid(
                    &field("address"),
                    "either address or fwmark is required".to_owned(),
                ));
            }
            _ => {}
        }
        if self.fwmark.is_none() && self.port == 0 && !self.persistent {
            return Err(invalid(
                &field("port"),
                "port zero is only allowed for persistent services".to_owned(),
            ));
        }
        if !SCHEDULER_NAMES.contains(&self.scheduler.as_str()) {
            return Err(invalid(
                &field("scheduler"),
                format!("must be one of: {}", SCHEDULER_NAMES.join(", ")),
            ));
        }
        if self.persistent && self.persistence_timeout_secs == 0 {
            return Err(invalid(
                &field("persistence_timeout_secs"),
                "must be greater than 0".to_owned(),
            ));
        }
        let mask = u32::from(self.netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(invalid(
                &field("netmask"),
                format!("{} is not a contiguous netmask", self.netmask),
            ));
        }
        if matches!(self.forward, ForwardMethod::Bypass | ForwardMethod::Local) {
            return Err(invalid(
                &field("forward"),
                "must be one of: masq, droute, tunnel".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for (didx, dest) in self.destinations.iter().enumerate() {
            let dfield = |name: &str| format!("services[{idx}].destinations[{didx}].{name}");
            if dest.weight < 0 {
                return Err(invalid(&dfield("weight"), "must not be negative".to_owned()));
            }
            if matches!(
                dest.forward,
                Some(ForwardMethod::Bypass) | Some(ForwardMethod::Local)
            ) {
                return Err(invalid(
                    &dfield("forward"),
                    "must be one of: masq, droute, tunnel".to_owned(),
                ));
            }
            if !seen.insert((dest.address, dest.port)) {
                return Err(invalid(
                    &dfield("address"),
                    format!("duplicate destination {}:{}", dest.address, dest.port),
                ));
            }
        }
        Ok(())
    }
}

/// 실서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// 실서버 주소
    pub address: Ipv4Addr,
    /// 실서버 포트 (0이면 패킷의 목적지 포트를 그대로 사용)
    #[serde(default)]
    pub port: u16,
    /// 가중치 (0이면 신규 연결을 받지 않음)
    #[serde(default = "default_weight")]
    pub weight: i32,
    /// 포워딩 방식 (생략 시 서비스 기본값)
    #[serde(default)]
    pub forward: Option<ForwardMethod>,
}

fn default_weight() -> i32 {
    1
}

fn invalid(field: &str, reason: String) -> IpvsError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_service() -> ServiceConfig {
        ServiceConfig {
            protocol: Protocol::Tcp,
            address: Some(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            fwmark: None,
            scheduler: "rr".to_owned(),
            persistent: false,
            persistence_timeout_secs: 300,
            netmask: Ipv4Addr::BROADCAST,
            forward: ForwardMethod::Masq,
            destinations: vec![DestinationConfig {
                address: Ipv4Addr::new(192, 168, 1, 10),
                port: 8080,
                weight: 1,
                forward: None,
            }],
        }
    }

    #[test]
    fn default_config_has_sane_values() {
        let config = IpvsConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.engine.conn_tab_bits, 12);
        assert_eq!(config.engine.sync_threshold, 3);
        assert_eq!(config.engine.sync_period, 50);
        assert!(!config.engine.expire_nodest_conn);
        assert!(config.services.is_empty());
    }

    #[test]
    fn default_config_passes_validation() {
        let config = IpvsConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = IpvsConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.engine.timeouts.tcp_secs, 900);
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[general]
log_level = "debug"

[engine]
cache_bypass = true
"#;
        let config = IpvsConfig::parse(toml).unwrap();
        assert_eq!(config.general.log_level, "debug");
        // log_format은 기본값 유지
        assert_eq!(config.general.log_format, "json");
        assert!(config.engine.cache_bypass);
        assert_eq!(config.engine.max_connections, 1 << 20);
    }

    #[test]
    fn from_str_services_with_destinations() {
        let toml = r#"
[[services]]
protocol = "tcp"
address = "10.0.0.1"
port = 21
scheduler = "wrr"
persistent = true
persistence_timeout_secs = 600
netmask = "255.255.255.0"

[[services.destinations]]
address = "192.168.1.10"
weight = 3

[[services.destinations]]
address = "192.168.1.11"
weight = 1
forward = "droute"

[[services]]
protocol = "udp"
fwmark = 7
"#;
        let config = IpvsConfig::parse(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.services.len(), 2);

        let ftp = &config.services[0];
        assert_eq!(ftp.port, 21);
        assert!(ftp.persistent);
        assert_eq!(ftp.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ftp.destinations[0].weight, 3);
        assert_eq!(ftp.destinations[0].port, 0);
        assert_eq!(
            ftp.destinations[1].forward,
            Some(ForwardMethod::DirectRoute)
        );

        let fwm = &config.services[1];
        assert_eq!(fwm.fwmark, Some(7));
        assert_eq!(fwm.scheduler, "wlc");
        assert_eq!(fwm.key_string(), "FWM 7");
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let result = IpvsConfig::parse("invalid = [[[toml");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            IpvsError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = IpvsConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = IpvsConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_out_of_range_table_bits() {
        let mut config = IpvsConfig::default();
        config.engine.conn_tab_bits = 24;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("conn_tab_bits"));
    }

    #[test]
    fn validate_rejects_threshold_not_below_period() {
        let mut config = IpvsConfig::default();
        config.engine.sync_threshold = 50;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_threshold"));
    }

    #[test]
    fn validate_rejects_unknown_scheduler() {
        let mut config = IpvsConfig::default();
        let mut svc = http_service();
        svc.scheduler = "sed".to_owned();
        config.services.push(svc);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheduler"));
    }

    #[test]
    fn validate_rejects_port_zero_without_persistence() {
        let mut config = IpvsConfig::default();
        let mut svc = http_service();
        svc.port = 0;
        config.services.push(svc.clone());
        assert!(config.validate().is_err());

        config.services[0].persistent = true;
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_services() {
        let mut config = IpvsConfig::default();
        config.services.push(http_service());
        config.services.push(http_service());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate service"));
    }

    #[test]
    fn validate_rejects_non_contiguous_netmask() {
        let mut config = IpvsConfig::default();
        let mut svc = http_service();
        svc.netmask = Ipv4Addr::new(255, 0, 255, 0);
        config.services.push(svc);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("netmask"));
    }

    #[test]
    fn validate_rejects_negative_weight() {
        let mut config = IpvsConfig::default();
        let mut svc = http_service();
        svc.destinations[0].weight = -1;
        config.services.push(svc);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn validate_rejects_fwmark_with_address() {
        let mut config = IpvsConfig::default();
        let mut svc = http_service();
        svc.fwmark = Some(3);
        config.services.push(svc);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_IPVS_STR", "overridden") };
        override_string(&mut val, "TEST_IPVS_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_IPVS_STR") };
    }

    #[test]
    fn env_override_bool_invalid_keeps_original() {
        let mut val = false;
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_IPVS_BOOL_BAD", "not-a-bool") };
        override_bool(&mut val, "TEST_IPVS_BOOL_BAD");
        assert!(!val); // 원래 값 유지
        unsafe { std::env::remove_var("TEST_IPVS_BOOL_BAD") };
    }

    #[test]
    fn env_override_u16_valid() {
        let mut val = 9100u16;
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_IPVS_U16", "9200") };
        override_u16(&mut val, "TEST_IPVS_U16");
        assert_eq!(val, 9200);
        unsafe { std::env::remove_var("TEST_IPVS_U16") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = 42u64;
        override_u64(&mut val, "TEST_IPVS_NONEXISTENT_12345");
        assert_eq!(val, 42);
    }

    #[test]
    fn config_serialize_roundtrip() {
        let mut config = IpvsConfig::default();
        config.services.push(http_service());
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = IpvsConfig::parse(&toml_str).unwrap();
        assert_eq!(config.general.log_level, parsed.general.log_level);
        assert_eq!(parsed.services.len(), 1);
        assert_eq!(parsed.services[0].destinations[0].port, 8080);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let result = IpvsConfig::from_file("/nonexistent/path/ipvs.toml").await;
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            IpvsError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
