//! 연결 테이블 — 버킷 해시 테이블 + 만료 스윕
//!
//! 버킷은 `(protocol, caddr, cport)`로 해시되며 각각 독립된 `RwLock`을 가집니다.
//! 조회는 버킷 하나의 읽기 잠금만, 삽입/제거는 버킷 하나의 쓰기 잠금만 잡습니다.
//! 응답 방향 조회도 클라이언트 쪽 주소를 키로 쓰므로 같은 버킷에 도달합니다.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use ipvs_core::metrics as m;
use ipvs_core::types::{ForwardMethod, Protocol};

use super::{ConnHandle, Connection, flags};
use crate::service::Destination;

type Bucket = RwLock<Vec<Arc<Connection>>>;

/// 연결 삽입 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// 같은 식별자의 연결이 이미 존재
    #[error("connection already exists")]
    Exists,

    /// 테이블 용량 초과
    #[error("connection table full ({max} entries)")]
    NoMemory { max: usize },
}

/// 새 연결 생성 인자
#[derive(Debug, Clone)]
pub struct NewConn {
    pub protocol: Protocol,
    pub caddr: Ipv4Addr,
    pub cport: u16,
    pub vaddr: Ipv4Addr,
    pub vport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
    /// [`flags::TEMPLATE`] 또는 [`flags::BYPASS`]
    pub flags: u32,
    pub forward: ForwardMethod,
    pub dest: Option<Arc<Destination>>,
    pub state: u8,
    pub timeout: Duration,
}

/// 스윕 한 번의 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 제거된 엔트리 수
    pub expired: usize,
    /// 사용 중이라 재장전된 엔트리 수
    pub rearmed: usize,
    /// 스윕 후 남은 엔트리 수
    pub remaining: usize,
}

/// 연결 테이블
pub struct ConnTable {
    buckets: Box<[Bucket]>,
    mask: usize,
    hasher: RandomState,
    max: usize,
    count: AtomicUsize,
    templates: AtomicUsize,
}

impl ConnTable {
    /// `2^bits`개의 버킷, 최대 `max` 엔트리의 테이블을 생성합니다.
    pub fn new(bits: u32, max: usize) -> Self {
        let size = 1usize << bits.min(24);
        let buckets = (0..size).map(|_| RwLock::new(Vec::new())).collect();
        Self {
            buckets,
            mask: size - 1,
            hasher: RandomState::new(),
            max,
            count: AtomicUsize::new(0),
            templates: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 현재 템플릿 수
    pub fn template_count(&self) -> usize {
        self.templates.load(Ordering::Acquire)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn index(&self, protocol: Protocol, addr: Ipv4Addr, port: u16) -> usize {
        (self.hasher.hash_one((protocol, addr, port)) as usize) & self.mask
    }

    fn read(&self, idx: usize) -> RwLockReadGuard<'_, Vec<Arc<Connection>>> {
        self.buckets[idx].read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, idx: usize) -> RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
        self.buckets[idx].write().unwrap_or_else(|e| e.into_inner())
    }

    // --- 조회 ---

    /// 클라이언트 → 가상 서비스 방향 조회
    pub fn lookup_inbound(
        &self,
        protocol: Protocol,
        caddr: Ipv4Addr,
        cport: u16,
        vaddr: Ipv4Addr,
        vport: u16,
    ) -> Option<ConnHandle> {
        let bucket = self.read(self.index(protocol, caddr, cport));
        let found = bucket.iter().find(|c| {
            c.protocol == protocol
                && c.caddr == caddr
                && c.cport == cport
                && c.vaddr == vaddr
                && c.vport == vport
                && !c.is_template()
        });
        let handle = found.map(|c| ConnHandle::new(Arc::clone(c)));
        trace!(
            %protocol, %caddr, cport, %vaddr, vport,
            hit = handle.is_some(),
            "inbound lookup"
        );
        handle
    }

    /// 실서버 → 클라이언트 방향 조회
    ///
    /// `(daddr, dport)`는 응답의 출발지(실서버), `(caddr, cport)`는 응답의
    /// 목적지(클라이언트)입니다.
    pub fn lookup_outbound(
        &self,
        protocol: Protocol,
        daddr: Ipv4Addr,
        dport: u16,
        caddr: Ipv4Addr,
        cport: u16,
    ) -> Option<ConnHandle> {
        let bucket = self.read(self.index(protocol, caddr, cport));
        let found = bucket.iter().find(|c| {
            c.protocol == protocol
                && c.caddr == caddr
                && c.cport == cport
                && c.daddr == daddr
                && c.dport == dport
                && !c.has_flag(flags::TEMPLATE | flags::BYPASS)
        });
        let handle = found.map(|c| ConnHandle::new(Arc::clone(c)));
        trace!(
            %protocol, %daddr, dport, %caddr, cport,
            hit = handle.is_some(),
            "outbound lookup"
        );
        handle
    }

    /// 지속성 템플릿 조회. 템플릿의 클라이언트 포트는 항상 0입니다.
    pub fn lookup_template(
        &self,
        protocol: Protocol,
        snet: Ipv4Addr,
        vaddr: Ipv4Addr,
        vport: u16,
    ) -> Option<ConnHandle> {
        let bucket = self.read(self.index(protocol, snet, 0));
        bucket
            .iter()
            .find(|c| {
                c.is_template()
                    && c.protocol == protocol
                    && c.caddr == snet
                    && c.cport == 0
                    && c.vaddr == vaddr
                    && c.vport == vport
            })
            .map(|c| ConnHandle::new(Arc::clone(c)))
    }

    // --- 삽입 / 제거 ---

    /// 식별자가 없을 때만 연결을 삽입합니다.
    ///
    /// 식별자는 `(protocol, caddr, cport, vaddr, vport, template 여부)`입니다.
    pub fn insert_new(&self, new: NewConn) -> Result<ConnHandle, ConnError> {
        let is_template = new.flags & flags::TEMPLATE != 0;
        let idx = self.index(new.protocol, new.caddr, new.cport);
        let mut bucket = self.write(idx);

        let exists = bucket.iter().any(|c| {
            c.protocol == new.protocol
                && c.caddr == new.caddr
                && c.cport == new.cport
                && c.vaddr == new.vaddr
                && c.vport == new.vport
                && c.is_template() == is_template
        });
        if exists {
            return Err(ConnError::Exists);
        }

        // 용량 예약
        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(ConnError::NoMemory { max: self.max });
        }

        let conn = Arc::new(Connection::from_new(new, Instant::now()));
        if let Some(dest) = conn.dest() {
            if is_template {
                dest.bind_persist();
            } else {
                dest.bind_inactive();
            }
        }
        conn.set_flag(flags::HASHED);
        bucket.push(Arc::clone(&conn));
        drop(bucket);

        if is_template {
            self.templates.fetch_add(1, Ordering::AcqRel);
        }
        metrics::counter!(
            m::CONNECTIONS_CREATED_TOTAL,
            m::LABEL_PROTOCOL => conn.protocol.as_str()
        )
        .increment(1);
        debug!(conn = ?conn, "connection created");

        Ok(ConnHandle::new(conn))
    }

    /// 연결을 즉시 테이블에서 제거합니다.
    ///
    /// 남아 있는 핸들은 저장소를 계속 유지하지만 타이머는 재장전되지 않습니다.
    /// 이미 제거된 연결이면 `false`를 반환합니다.
    pub fn expire_now(&self, conn: &Connection) -> bool {
        let idx = self.index(conn.protocol, conn.caddr, conn.cport);
        let removed = {
            let mut bucket = self.write(idx);
            bucket
                .iter()
                .position(|c| std::ptr::eq(Arc::as_ptr(c), conn))
                .map(|pos| bucket.swap_remove(pos))
        };

        match removed {
            Some(c) => {
                self.unlinked(&c);
                debug!(conn = ?c, "connection expired early");
                true
            }
            None => false,
        }
    }

    fn unlinked(&self, conn: &Connection) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        if conn.is_template() {
            self.templates.fetch_sub(1, Ordering::AcqRel);
        }
        conn.on_unlinked();
        metrics::counter!(m::CONNECTIONS_EXPIRED_TOTAL).increment(1);
    }

    /// 만료 시각이 지난 엔트리를 처리합니다.
    ///
    /// 핸들이 남아 있는 엔트리와 살아있는 자식을 가진 템플릿은
    /// `now + timeout`으로 재장전하고, 나머지는 제거합니다.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut dead = Vec::new();

        for idx in 0..self.buckets.len() {
            let mut bucket = self.write(idx);
            bucket.retain(|c| {
                if c.expires() > now {
                    return true;
                }
                // 테이블이 가진 참조 외의 참조 = 사용 중인 핸들
                let busy = Arc::strong_count(c) > 1;
                if busy || c.n_control() > 0 {
                    c.refresh(now);
                    report.rearmed += 1;
                    return true;
                }
                dead.push(Arc::clone(c));
                false
            });
        }

        report.expired = dead.len();
        for conn in &dead {
            self.unlinked(conn);
            trace!(conn = ?conn, "connection timed out");
        }
        report.remaining = self.len();
        report
    }

    /// 모든 엔트리를 제거합니다.
    pub fn flush(&self) -> usize {
        let mut removed = 0;
        for idx in 0..self.buckets.len() {
            let drained: Vec<_> = self.write(idx).drain(..).collect();
            removed += drained.len();
            for conn in &drained {
                self.unlinked(conn);
            }
        }
        removed
    }

    /// 현재 엔트리의 스냅샷
    pub fn iter_snapshot(&self) -> Vec<Arc<Connection>> {
        let mut all = Vec::with_capacity(self.len());
        for idx in 0..self.buckets.len() {
            all.extend(self.read(idx).iter().cloned());
        }
        all
    }
}

impl std::fmt::Debug for ConnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTable")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .field("templates", &self.template_count())
            .field("max", &self.max)
            .finish()
    }
}
