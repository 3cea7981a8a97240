//! Host network stack adapter for the daemon.
//!
//! [`HostStack`] answers route lookups from the set of addresses owned by
//! this host and hands rewritten packets to a [`PacketSink`]. Without a
//! packet I/O backend the daemon runs with [`LogSink`], which records each
//! transmission through `tracing` so the scheduling decisions stay
//! observable.
//!
//! [`LogSyncSink`] plays the same role for connection synchronization.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ipvs_core::config::IpvsConfig;
use ipvs_engine::{Connection, NetStack, Packet, Route, RouteKind, SyncSink};

/// Default path MTU for unicast routes.
pub const DEFAULT_MTU: u32 = 1500;

/// Destination for packets leaving the load balancer.
pub trait PacketSink: Send + Sync {
    /// Deliver a packet along `route`.
    fn transmit(&self, pkt: Packet, route: &Route);

    /// Deliver an ICMP error of `icmp_type`/`code` about `offending`.
    fn icmp_error(&self, offending: &Packet, icmp_type: u8, code: u8, info: u32);
}

/// A [`PacketSink`] that only logs.
#[derive(Debug, Default)]
pub struct LogSink {
    transmitted: AtomicU64,
    icmp_errors: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets handed to this sink.
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Number of ICMP errors requested.
    pub fn icmp_errors(&self) -> u64 {
        self.icmp_errors.load(Ordering::Relaxed)
    }
}

impl PacketSink for LogSink {
    fn transmit(&self, pkt: Packet, route: &Route) {
        self.transmitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            saddr = %pkt.saddr(),
            daddr = %pkt.daddr(),
            protocol = pkt.protocol_number(),
            len = pkt.len(),
            mtu = route.mtu,
            "transmit"
        );
    }

    fn icmp_error(&self, offending: &Packet, icmp_type: u8, code: u8, info: u32) {
        self.icmp_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            to = %offending.saddr(),
            icmp_type = icmp_type,
            code = code,
            info = info,
            "icmp error"
        );
    }
}

/// Route table built from the addresses this host owns.
///
/// Every configured virtual address is local. Everything else is reached
/// through a unicast route with a fixed MTU, sourced from `source`.
pub struct HostStack {
    local: HashSet<Ipv4Addr>,
    source: Ipv4Addr,
    mtu: u32,
    sink: Arc<dyn PacketSink>,
}

impl HostStack {
    pub fn new(sink: Arc<dyn PacketSink>) -> Self {
        Self {
            local: HashSet::new(),
            source: Ipv4Addr::UNSPECIFIED,
            mtu: DEFAULT_MTU,
            sink,
        }
    }

    /// Build a stack that owns every virtual address in `config` plus `extra`.
    pub fn from_config(config: &IpvsConfig, extra: &[Ipv4Addr], sink: Arc<dyn PacketSink>) -> Self {
        let mut stack = Self::new(sink);
        for svc in &config.services {
            if let Some(addr) = svc.address {
                stack.add_local(addr);
            }
        }
        for &addr in extra {
            stack.add_local(addr);
        }
        stack
    }

    /// Mark `addr` as owned by this host. The first address becomes the
    /// preferred source for outgoing routes.
    pub fn add_local(&mut self, addr: Ipv4Addr) {
        if self.source.is_unspecified() {
            self.source = addr;
        }
        self.local.insert(addr);
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.local.contains(&addr)
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }
}

impl NetStack for HostStack {
    fn route(&self, daddr: Ipv4Addr) -> Option<Route> {
        let kind = if self.local.contains(&daddr) {
            RouteKind::Local
        } else if daddr.is_broadcast() {
            RouteKind::Broadcast
        } else if daddr.is_multicast() {
            RouteKind::Multicast
        } else if daddr.is_unspecified() {
            return None;
        } else {
            RouteKind::Unicast
        };
        Some(Route {
            kind,
            mtu: self.mtu,
            src: self.source,
        })
    }

    fn send(&self, pkt: Packet, route: &Route) {
        self.sink.transmit(pkt, route);
    }

    fn icmp_send(&self, pkt: &Packet, icmp_type: u8, code: u8, info: u32) {
        self.sink.icmp_error(pkt, icmp_type, code, info);
    }
}

impl std::fmt::Debug for HostStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStack")
            .field("local", &self.local)
            .field("source", &self.source)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Connection sync sink that logs each update.
#[derive(Debug, Default)]
pub struct LogSyncSink {
    sent: AtomicU64,
}

impl LogSyncSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl SyncSink for LogSyncSink {
    fn sync_conn(&self, conn: &Connection) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            protocol = %conn.protocol,
            client = %format_args!("{}:{}", conn.caddr, conn.cport),
            virtual_addr = %format_args!("{}:{}", conn.vaddr, conn.vport),
            dest = %format_args!("{}:{}", conn.daddr, conn.dport),
            state = conn.state(),
            "connection sync"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> HostStack {
        let mut stack = HostStack::new(Arc::new(LogSink::new()));
        stack.add_local(Ipv4Addr::new(10, 0, 0, 1));
        stack
    }

    #[test]
    fn local_address_routes_locally() {
        let rt = stack().route(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(rt.kind, RouteKind::Local);
        assert_eq!(rt.src, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn other_addresses_are_unicast() {
        let rt = stack().route(Ipv4Addr::new(192, 168, 1, 10)).unwrap();
        assert_eq!(rt.kind, RouteKind::Unicast);
        assert_eq!(rt.mtu, DEFAULT_MTU);
    }

    #[test]
    fn special_addresses() {
        let s = stack();
        assert_eq!(s.route(Ipv4Addr::BROADCAST).unwrap().kind, RouteKind::Broadcast);
        assert_eq!(
            s.route(Ipv4Addr::new(224, 0, 0, 1)).unwrap().kind,
            RouteKind::Multicast
        );
        assert!(s.route(Ipv4Addr::UNSPECIFIED).is_none());
    }

    #[test]
    fn mtu_is_configurable() {
        let s = stack().with_mtu(9000);
        assert_eq!(s.route(Ipv4Addr::new(1, 1, 1, 1)).unwrap().mtu, 9000);
    }
}
