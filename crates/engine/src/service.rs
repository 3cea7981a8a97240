//! 서비스 테이블 — 가상 서비스와 실서버 풀
//!
//! 가상 서비스는 `(protocol, vaddr, vport)` 또는 방화벽 마크로 식별됩니다.
//! 각 서비스는 실서버([`Destination`]) 풀을 `RwLock`으로 보유하며, 스케줄링은
//! [`Service::pool`] 읽기 가드를 잡은 채로 진행됩니다. 실서버 제거는 쓰기 잠금을
//! 잡으므로 진행 중인 스케줄링이 모두 끝날 때까지 기다립니다.
//!
//! # 매칭 순서
//! ```text
//! fwmark != 0 ──▶ by_fwmark
//!      │ miss
//!      ▼
//! (proto, vaddr, vport) ──▶ by_addr
//!      │ miss, TCP, FTP 서비스 존재, vport == 20 || vport >= 1024
//!      ▼
//! (TCP, vaddr, 21)
//!      │ miss, 포트 0 서비스 존재
//!      ▼
//! (proto, vaddr, 0)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, info};

use ipvs_core::config::{DestinationConfig, ServiceConfig};
use ipvs_core::error::ServiceError;
use ipvs_core::types::{ForwardMethod, Protocol};

use crate::sched::Scheduler;
use crate::stats::Stats;

/// FTP 제어 포트
pub const FTP_PORT: u16 = 21;

/// FTP 데이터 포트 (active mode)
pub const FTP_DATA_PORT: u16 = 20;

/// 특권 포트 경계
const PROT_SOCK: u16 = 1024;

// ─── Destination ────────────────────────────────────────────────────

/// 실서버
pub struct Destination {
    pub addr: Ipv4Addr,
    pub port: u16,
    forward: ForwardMethod,
    weight: AtomicI32,
    available: AtomicBool,
    in_service: AtomicBool,
    active_conns: AtomicU32,
    inactive_conns: AtomicU32,
    persist_conns: AtomicU32,
    pub stats: Stats,
    svc_stats: Arc<Stats>,
    service: String,
}

impl Destination {
    fn new(spec: &DestSpec, forward: ForwardMethod, svc: &Service) -> Self {
        Self {
            addr: spec.addr,
            port: spec.port,
            forward,
            weight: AtomicI32::new(spec.weight),
            available: AtomicBool::new(true),
            in_service: AtomicBool::new(true),
            active_conns: AtomicU32::new(0),
            inactive_conns: AtomicU32::new(0),
            persist_conns: AtomicU32::new(0),
            stats: Stats::new(),
            svc_stats: Arc::clone(&svc.stats),
            service: svc.key.to_string(),
        }
    }

    pub fn forward(&self) -> ForwardMethod {
        self.forward
    }

    pub fn weight(&self) -> i32 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: i32) {
        self.weight.store(weight, Ordering::Release);
    }

    /// 상태 점검/운영자가 제어하는 가용성
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// 서비스에서 제거되지 않았는지
    pub fn is_in_service(&self) -> bool {
        self.in_service.load(Ordering::Acquire)
    }

    /// 신규 흐름에 선택될 수 있는지: 가용 + 서비스 소속 + weight > 0
    pub fn is_schedulable(&self) -> bool {
        self.is_available() && self.is_in_service() && self.weight() > 0
    }

    /// 지속성 템플릿이 유효한지: 가용 + 서비스 소속
    pub fn is_usable(&self) -> bool {
        self.is_available() && self.is_in_service()
    }

    pub fn active_conns(&self) -> u32 {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn inactive_conns(&self) -> u32 {
        self.inactive_conns.load(Ordering::Acquire)
    }

    pub fn persist_conns(&self) -> u32 {
        self.persist_conns.load(Ordering::Acquire)
    }

    /// 소속 서비스의 통계
    pub fn service_stats(&self) -> &Arc<Stats> {
        &self.svc_stats
    }

    /// 소속 서비스 키 문자열 (로그/메트릭 레이블용)
    pub fn service_name(&self) -> &str {
        &self.service
    }

    // --- 연결 카운터 ---

    pub(crate) fn bind_inactive(&self) {
        self.inactive_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bind_persist(&self) {
        self.persist_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unbind_inactive(&self) {
        dec(&self.inactive_conns);
    }

    pub(crate) fn unbind_active(&self) {
        dec(&self.active_conns);
    }

    pub(crate) fn unbind_persist(&self) {
        dec(&self.persist_conns);
    }

    pub(crate) fn inactive_to_active(&self) {
        dec(&self.inactive_conns);
        self.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn active_to_inactive(&self) {
        dec(&self.active_conns);
        self.inactive_conns.fetch_add(1, Ordering::AcqRel);
    }
}

fn dec(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("addr", &format_args!("{}:{}", self.addr, self.port))
            .field("forward", &self.forward)
            .field("weight", &self.weight())
            .field("available", &self.is_available())
            .field("in_service", &self.is_in_service())
            .field("active", &self.active_conns())
            .field("inactive", &self.inactive_conns())
            .field("persist", &self.persist_conns())
            .finish()
    }
}

// ─── Service ────────────────────────────────────────────────────────

/// 가상 서비스 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Addr(Protocol, Ipv4Addr, u16),
    Fwmark(u32),
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(proto, addr, port) => write!(f, "{proto} {addr}:{port}"),
            Self::Fwmark(mark) => write!(f, "FWM {mark}"),
        }
    }
}

/// 서비스 생성 인자
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub key: ServiceKey,
    pub protocol: Protocol,
    pub scheduler: String,
    pub persistent: bool,
    pub timeout: Duration,
    pub netmask: Ipv4Addr,
    pub forward: ForwardMethod,
}

impl ServiceSpec {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        let key = match (cfg.fwmark, cfg.address) {
            (Some(mark), _) => ServiceKey::Fwmark(mark),
            (None, addr) => ServiceKey::Addr(
                cfg.protocol,
                addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
                cfg.port,
            ),
        };
        Self {
            key,
            protocol: cfg.protocol,
            scheduler: cfg.scheduler.clone(),
            persistent: cfg.persistent,
            timeout: Duration::from_secs(cfg.persistence_timeout_secs),
            netmask: cfg.netmask,
            forward: cfg.forward,
        }
    }
}

/// 실서버 추가 인자
#[derive(Debug, Clone)]
pub struct DestSpec {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub weight: i32,
    pub forward: Option<ForwardMethod>,
}

impl DestSpec {
    pub fn from_config(cfg: &DestinationConfig) -> Self {
        Self {
            addr: cfg.address,
            port: cfg.port,
            weight: cfg.weight,
            forward: cfg.forward,
        }
    }
}

/// 가상 서비스
pub struct Service {
    pub key: ServiceKey,
    pub protocol: Protocol,
    /// 가상 주소 (fwmark 서비스는 0.0.0.0)
    pub addr: Ipv4Addr,
    /// 가상 포트 (fwmark 서비스는 0)
    pub port: u16,
    /// 방화벽 마크 (0 = 주소 기반 서비스)
    pub fwmark: u32,
    pub persistent: bool,
    pub timeout: Duration,
    pub netmask: Ipv4Addr,
    pub forward: ForwardMethod,
    scheduler: Box<dyn Scheduler>,
    dests: RwLock<Vec<Arc<Destination>>>,
    pub stats: Arc<Stats>,
}

impl Service {
    fn new(spec: ServiceSpec, scheduler: Box<dyn Scheduler>) -> Self {
        let (addr, port, fwmark) = match spec.key {
            ServiceKey::Addr(_, addr, port) => (addr, port, 0),
            ServiceKey::Fwmark(mark) => (Ipv4Addr::UNSPECIFIED, 0, mark),
        };
        Self {
            key: spec.key,
            protocol: spec.protocol,
            addr,
            port,
            fwmark,
            persistent: spec.persistent,
            timeout: spec.timeout,
            netmask: spec.netmask,
            forward: spec.forward,
            scheduler,
            dests: RwLock::new(Vec::new()),
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// 실서버 풀 읽기 가드. 가드가 살아 있는 동안 풀은 변경되지 않습니다.
    pub fn pool(&self) -> RwLockReadGuard<'_, Vec<Arc<Destination>>> {
        self.dests.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pool_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Destination>>> {
        self.dests.write().unwrap_or_else(|e| e.into_inner())
    }

    /// `(addr, port)` 실서버
    pub fn destination(&self, addr: Ipv4Addr, port: u16) -> Option<Arc<Destination>> {
        self.pool()
            .iter()
            .find(|d| d.addr == addr && d.port == port)
            .cloned()
    }

    /// 선택 가능한 실서버가 하나라도 있는지
    pub fn has_schedulable(&self) -> bool {
        self.pool().iter().any(|d| d.is_schedulable())
    }

    pub fn dest_count(&self) -> usize {
        self.pool().len()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.key.to_string())
            .field("scheduler", &self.scheduler.name())
            .field("persistent", &self.persistent)
            .field("timeout", &self.timeout)
            .field("netmask", &self.netmask)
            .field("dests", &self.dest_count())
            .finish()
    }
}

// ─── ServiceTable ───────────────────────────────────────────────────

#[derive(Default)]
struct ServiceMaps {
    by_addr: HashMap<(Protocol, Ipv4Addr, u16), Arc<Service>>,
    by_fwmark: HashMap<u32, Arc<Service>>,
    /// 포트 21 서비스 수
    ftp_svcs: usize,
    /// 포트 0 서비스 수
    null_svcs: usize,
}

/// 가상 서비스 테이블
#[derive(Default)]
pub struct ServiceTable {
    maps: RwLock<ServiceMaps>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceMaps> {
        self.maps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceMaps> {
        self.maps.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        let maps = self.read();
        maps.by_addr.len() + maps.by_fwmark.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 모든 서비스
    pub fn services(&self) -> Vec<Arc<Service>> {
        let maps = self.read();
        maps.by_addr
            .values()
            .chain(maps.by_fwmark.values())
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        let maps = self.read();
        match key {
            ServiceKey::Addr(proto, addr, port) => maps.by_addr.get(&(*proto, *addr, *port)).cloned(),
            ServiceKey::Fwmark(mark) => maps.by_fwmark.get(mark).cloned(),
        }
    }

    fn get_or_not_found(&self, key: &ServiceKey) -> Result<Arc<Service>, ServiceError> {
        self.get(key)
            .ok_or_else(|| ServiceError::NotFound(key.to_string()))
    }

    /// 서비스를 등록합니다.
    pub fn add_service(
        &self,
        spec: ServiceSpec,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<Arc<Service>, ServiceError> {
        if spec.persistent && spec.timeout.is_zero() {
            return Err(ServiceError::InvalidArgument(format!(
                "{}: persistence timeout must be positive",
                spec.key
            )));
        }
        if let ServiceKey::Addr(_, _, 0) = spec.key {
            if !spec.persistent {
                return Err(ServiceError::InvalidArgument(format!(
                    "{}: port 0 requires a persistent service",
                    spec.key
                )));
            }
        }

        let key = spec.key;
        let mut maps = self.write();
        let svc = match key {
            ServiceKey::Addr(proto, addr, port) => {
                if maps.by_addr.contains_key(&(proto, addr, port)) {
                    return Err(ServiceError::AlreadyExists(key.to_string()));
                }
                let svc = Arc::new(Service::new(spec, scheduler));
                maps.by_addr.insert((proto, addr, port), Arc::clone(&svc));
                if port == FTP_PORT {
                    maps.ftp_svcs += 1;
                } else if port == 0 {
                    maps.null_svcs += 1;
                }
                svc
            }
            ServiceKey::Fwmark(mark) => {
                if maps.by_fwmark.contains_key(&mark) {
                    return Err(ServiceError::AlreadyExists(key.to_string()));
                }
                let svc = Arc::new(Service::new(spec, scheduler));
                maps.by_fwmark.insert(mark, Arc::clone(&svc));
                svc
            }
        };
        drop(maps);

        info!(
            service = %key,
            scheduler = svc.scheduler().name(),
            persistent = svc.persistent,
            "virtual service added"
        );
        Ok(svc)
    }

    /// 서비스를 제거합니다. 소속 실서버는 모두 서비스 밖으로 표시됩니다.
    pub fn remove_service(&self, key: &ServiceKey) -> Result<Arc<Service>, ServiceError> {
        let removed = {
            let mut maps = self.write();
            match key {
                ServiceKey::Addr(proto, addr, port) => {
                    let svc = maps.by_addr.remove(&(*proto, *addr, *port));
                    if svc.is_some() {
                        if *port == FTP_PORT {
                            maps.ftp_svcs -= 1;
                        } else if *port == 0 {
                            maps.null_svcs -= 1;
                        }
                    }
                    svc
                }
                ServiceKey::Fwmark(mark) => maps.by_fwmark.remove(mark),
            }
        };
        let svc = removed.ok_or_else(|| ServiceError::NotFound(key.to_string()))?;

        for dest in svc.pool_mut().drain(..) {
            dest.in_service.store(false, Ordering::Release);
        }
        info!(service = %key, "virtual service removed");
        Ok(svc)
    }

    /// 실서버를 추가합니다.
    ///
    /// `local`이면 포워딩 방식과 관계없이 로컬 전달(`Local`)로 설정됩니다.
    pub fn add_destination(
        &self,
        key: &ServiceKey,
        spec: DestSpec,
        local: bool,
    ) -> Result<Arc<Destination>, ServiceError> {
        if spec.weight < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "weight {} is negative",
                spec.weight
            )));
        }
        let svc = self.get_or_not_found(key)?;

        let forward = if local {
            ForwardMethod::Local
        } else {
            spec.forward.unwrap_or(svc.forward)
        };
        if forward == ForwardMethod::Bypass {
            return Err(ServiceError::InvalidArgument(
                "bypass is not a destination forwarding method".to_owned(),
            ));
        }

        let mut pool = svc.pool_mut();
        if pool.iter().any(|d| d.addr == spec.addr && d.port == spec.port) {
            return Err(ServiceError::DestinationExists {
                service: key.to_string(),
                dest: format!("{}:{}", spec.addr, spec.port),
            });
        }
        let dest = Arc::new(Destination::new(&spec, forward, &svc));
        pool.push(Arc::clone(&dest));
        svc.scheduler().update_service(&pool);
        drop(pool);

        debug!(
            service = %key,
            dest = %format_args!("{}:{}", dest.addr, dest.port),
            weight = dest.weight(),
            forward = %forward,
            "destination added"
        );
        Ok(dest)
    }

    /// 실서버를 제거합니다. 진행 중인 스케줄링이 끝날 때까지 기다립니다.
    pub fn remove_destination(
        &self,
        key: &ServiceKey,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<Arc<Destination>, ServiceError> {
        let svc = self.get_or_not_found(key)?;
        let mut pool = svc.pool_mut();
        let pos = pool
            .iter()
            .position(|d| d.addr == addr && d.port == port)
            .ok_or_else(|| dest_not_found(key, addr, port))?;
        let dest = pool.remove(pos);
        dest.in_service.store(false, Ordering::Release);
        svc.scheduler().update_service(&pool);
        drop(pool);

        debug!(service = %key, dest = %format_args!("{addr}:{port}"), "destination removed");
        Ok(dest)
    }

    /// 실서버 weight를 변경합니다. 0은 quiesce(신규 흐름 중단)입니다.
    pub fn edit_destination(
        &self,
        key: &ServiceKey,
        addr: Ipv4Addr,
        port: u16,
        weight: i32,
    ) -> Result<(), ServiceError> {
        if weight < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "weight {weight} is negative"
            )));
        }
        let svc = self.get_or_not_found(key)?;
        let pool = svc.pool();
        let dest = pool
            .iter()
            .find(|d| d.addr == addr && d.port == port)
            .ok_or_else(|| dest_not_found(key, addr, port))?;
        dest.set_weight(weight);
        svc.scheduler().update_service(&pool);

        debug!(service = %key, dest = %format_args!("{addr}:{port}"), weight, "destination weight changed");
        Ok(())
    }

    /// 실서버 가용성을 변경합니다.
    pub fn set_destination_available(
        &self,
        key: &ServiceKey,
        addr: Ipv4Addr,
        port: u16,
        available: bool,
    ) -> Result<(), ServiceError> {
        let svc = self.get_or_not_found(key)?;
        let dest = svc
            .destination(addr, port)
            .ok_or_else(|| dest_not_found(key, addr, port))?;
        dest.set_available(available);

        info!(service = %key, dest = %format_args!("{addr}:{port}"), available, "destination availability changed");
        Ok(())
    }

    /// 새 흐름 패킷에 맞는 서비스를 찾습니다.
    pub fn match_service(
        &self,
        protocol: Protocol,
        vaddr: Ipv4Addr,
        vport: u16,
        fwmark: u32,
    ) -> Option<Arc<Service>> {
        let maps = self.read();

        if fwmark != 0 {
            if let Some(svc) = maps.by_fwmark.get(&fwmark) {
                return Some(Arc::clone(svc));
            }
        }

        if let Some(svc) = maps.by_addr.get(&(protocol, vaddr, vport)) {
            return Some(Arc::clone(svc));
        }

        // FTP 데이터 연결 (active: 20, passive: 비특권 포트)
        if protocol == Protocol::Tcp
            && maps.ftp_svcs > 0
            && (vport == FTP_DATA_PORT || vport >= PROT_SOCK)
        {
            if let Some(svc) = maps.by_addr.get(&(protocol, vaddr, FTP_PORT)) {
                return Some(Arc::clone(svc));
            }
        }

        if maps.null_svcs > 0 {
            if let Some(svc) = maps.by_addr.get(&(protocol, vaddr, 0)) {
                return Some(Arc::clone(svc));
            }
        }

        None
    }

    /// `(addr, port)`가 주소 기반 서비스의 실서버인지 확인합니다.
    pub fn lookup_real_service(&self, protocol: Protocol, addr: Ipv4Addr, port: u16) -> bool {
        self.read()
            .by_addr
            .values()
            .filter(|svc| svc.protocol == protocol)
            .any(|svc| svc.pool().iter().any(|d| d.addr == addr && d.port == port))
    }
}

fn dest_not_found(key: &ServiceKey, addr: Ipv4Addr, port: u16) -> ServiceError {
    ServiceError::DestinationNotFound {
        service: key.to_string(),
        dest: format!("{addr}:{port}"),
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("services", &self.len())
            .finish()
    }
}
