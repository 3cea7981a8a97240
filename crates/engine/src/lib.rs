#![doc = include_str!("../README.md")]

pub mod checksum;
pub mod conn;
pub mod engine;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod proto;
pub mod sched;
pub mod schedule;
pub mod service;
pub mod stack;
pub mod state;
pub mod stats;
pub mod xmit;

// 엔진
pub use engine::{LoadBalancer, LoadBalancerBuilder};
pub use state::LoadBalancerState;

// 에러
pub use error::EngineError;

// 패킷 / 훅
pub use packet::{Packet, PacketMeta, PacketType};
pub use pipeline::{DropReason, Hook, Verdict};

// 연결 / 서비스
pub use conn::{ConnTable, Connection};
pub use service::{DestSpec, Destination, Service, ServiceKey, ServiceSpec, ServiceTable};

// 스케줄러 / 프로토콜
pub use proto::{ProtocolHandler, ProtocolRegistry};
pub use sched::{Scheduler, SchedulerRegistry};

// 스택 경계
pub use stack::{NetStack, Route, RouteKind, SyncSink};

// 통계
pub use stats::{RateSnapshot, Stats, StatsSnapshot};
