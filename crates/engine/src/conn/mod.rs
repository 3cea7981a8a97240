//! 연결 — 흐름 하나의 NAT 매핑과 프로토콜 상태
//!
//! [`Connection`]은 `<client, virtual, destination>` 주소 세 쌍을 묶는 엔트리입니다.
//! 템플릿(지속성 친화도 레코드)도 같은 타입을 쓰며 [`flags::TEMPLATE`]로 구분합니다.
//!
//! # 수명
//!
//! ```text
//! insert_new ──▶ ConnTable (Arc 1개 보유)
//!     │                │
//!     ▼                │ sweep(now): expires <= now 이고
//! ConnHandle (Arc)     │   - 핸들이 남아 있으면 재장전
//!     │ drop           │   - 살아있는 자식이 있는 템플릿이면 재장전
//!     ▼                │   - 그 외에는 제거 (on_unlinked)
//! expires = now + timeout
//! ```

pub mod table;

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use ipvs_core::types::{ForwardMethod, Protocol};

use crate::service::Destination;

pub use table::{ConnError, ConnTable, NewConn, SweepReport};

/// 연결 플래그
pub mod flags {
    /// 지속성 템플릿
    pub const TEMPLATE: u32 = 0x0001;
    /// 캐시 바이패스 연결 (목적지 없음)
    pub const BYPASS: u32 = 0x0002;
    /// 비활성 (ESTABLISHED가 아님)
    pub const INACTIVE: u32 = 0x0004;
    /// 테이블에 등록됨
    pub const HASHED: u32 = 0x0008;
    /// 테이블에서 제거됨
    pub const EXPIRED: u32 = 0x0010;
    /// 응답이 로드밸런서를 거치지 않음 (NAT 이외의 포워딩)
    pub const NO_OUTPUT: u32 = 0x0020;
}

/// 연결 테이블 엔트리
pub struct Connection {
    pub protocol: Protocol,
    pub caddr: Ipv4Addr,
    pub cport: u16,
    pub vaddr: Ipv4Addr,
    pub vport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,

    forward: ForwardMethod,
    flags: AtomicU32,
    state: AtomicU8,
    timeout_ms: AtomicU64,
    expires: Mutex<Instant>,
    in_pkts: AtomicU64,
    dest: Option<Arc<Destination>>,
    control: Mutex<Option<Weak<Connection>>>,
    n_control: AtomicU32,
}

impl Connection {
    pub(crate) fn from_new(new: NewConn, now: Instant) -> Self {
        let mut flags = new.flags;
        if new.forward != ForwardMethod::Masq {
            flags |= flags::NO_OUTPUT;
        }
        if flags & flags::TEMPLATE == 0 {
            flags |= flags::INACTIVE;
        }

        Self {
            protocol: new.protocol,
            caddr: new.caddr,
            cport: new.cport,
            vaddr: new.vaddr,
            vport: new.vport,
            daddr: new.daddr,
            dport: new.dport,
            forward: new.forward,
            flags: AtomicU32::new(flags),
            state: AtomicU8::new(new.state),
            timeout_ms: AtomicU64::new(duration_ms(new.timeout)),
            expires: Mutex::new(now + new.timeout),
            in_pkts: AtomicU64::new(0),
            dest: new.dest,
            control: Mutex::new(None),
            n_control: AtomicU32::new(0),
        }
    }

    pub fn forward(&self) -> ForwardMethod {
        self.forward
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn is_template(&self) -> bool {
        self.has_flag(flags::TEMPLATE)
    }

    pub fn is_expired(&self) -> bool {
        self.has_flag(flags::EXPIRED)
    }

    pub(crate) fn set_flag(&self, flag: u32) -> u32 {
        self.flags.fetch_or(flag, Ordering::AcqRel)
    }

    pub(crate) fn clear_flag(&self, flag: u32) -> u32 {
        self.flags.fetch_and(!flag, Ordering::AcqRel)
    }

    pub fn dest(&self) -> Option<&Arc<Destination>> {
        self.dest.as_ref()
    }

    // --- 프로토콜 상태 ---

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// 상태와 타임아웃을 갱신하고 목적지의 active/inactive 카운터를 옮깁니다.
    ///
    /// `established`는 새 상태가 활성 상태(TCP ESTABLISHED)인지 여부입니다.
    pub fn set_state(&self, new_state: u8, timeout: Duration, established: bool) {
        let old = self.state.swap(new_state, Ordering::AcqRel);
        self.set_timeout(timeout);
        if old == new_state {
            return;
        }
        let Some(dest) = &self.dest else {
            return;
        };
        if self.is_template() {
            return;
        }

        if established {
            let prev = self.clear_flag(flags::INACTIVE);
            if prev & flags::INACTIVE != 0 && prev & flags::EXPIRED == 0 {
                dest.inactive_to_active();
            }
        } else {
            let prev = self.set_flag(flags::INACTIVE);
            if prev & flags::INACTIVE == 0 && prev & flags::EXPIRED == 0 {
                dest.active_to_inactive();
            }
        }
    }

    // --- 타이머 ---

    pub fn expires(&self) -> Instant {
        *self.expires.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 유휴 타이머를 `now + timeout`으로 재장전합니다.
    pub fn refresh(&self, now: Instant) {
        let deadline = now + self.timeout();
        *self.expires.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    // --- 패킷 카운터 ---

    pub fn in_pkts(&self) -> u64 {
        self.in_pkts.load(Ordering::Relaxed)
    }

    /// 인바운드 패킷 수를 1 증가시키고 새 값을 반환합니다.
    pub fn bump_in_pkts(&self) -> u64 {
        self.in_pkts.fetch_add(1, Ordering::Relaxed) + 1
    }

    // --- 템플릿 제어 링크 ---

    /// 이 연결을 템플릿의 제어 아래 둡니다.
    pub fn set_control(&self, template: &Arc<Connection>) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if control.is_none() {
            template.n_control.fetch_add(1, Ordering::AcqRel);
            *control = Some(Arc::downgrade(template));
        }
    }

    /// 제어 템플릿 (이미 해제되었으면 `None`)
    pub fn control(&self) -> Option<Arc<Connection>> {
        self.control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// 제어 중인 자식 연결 수
    pub fn n_control(&self) -> u32 {
        self.n_control.load(Ordering::Acquire)
    }

    /// 테이블에서 제거된 직후 호출됩니다. 두 번째 호출부터는 아무 일도 하지 않습니다.
    pub(crate) fn on_unlinked(&self) {
        let prev = self.set_flag(flags::EXPIRED);
        if prev & flags::EXPIRED != 0 {
            return;
        }
        self.clear_flag(flags::HASHED);

        if let Some(dest) = &self.dest {
            if prev & flags::TEMPLATE != 0 {
                dest.unbind_persist();
            } else if prev & flags::INACTIVE != 0 {
                dest.unbind_inactive();
            } else {
                dest.unbind_active();
            }
        }

        let control = self
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(template) = control.and_then(|w| w.upgrade()) {
            // 0 아래로 내려가지 않도록
            let _ = template
                .n_control
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &self.protocol)
            .field("client", &format_args!("{}:{}", self.caddr, self.cport))
            .field("virtual", &format_args!("{}:{}", self.vaddr, self.vport))
            .field("dest", &format_args!("{}:{}", self.daddr, self.dport))
            .field("forward", &self.forward)
            .field("flags", &format_args!("{:#06x}", self.flags()))
            .field("state", &self.state())
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── ConnHandle ─────────────────────────────────────────────────────

/// 연결 참조 가드
///
/// 가드를 drop하면 연결의 유휴 타이머가 재장전됩니다. 만료된 연결이거나
/// [`ConnHandle::skip_refresh`]가 호출된 경우에는 재장전하지 않습니다.
pub struct ConnHandle {
    conn: Arc<Connection>,
    refresh: bool,
}

impl ConnHandle {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            refresh: true,
        }
    }

    /// 타이머를 재장전하지 않고 반환하도록 표시합니다.
    pub fn skip_refresh(&mut self) {
        self.refresh = false;
    }

    pub fn arc(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Deref for ConnHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        if self.refresh && !self.conn.is_expired() {
            self.conn.refresh(Instant::now());
        }
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.conn.fmt(f)
    }
}
