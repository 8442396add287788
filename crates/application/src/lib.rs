//! 应用层实现。
//!
//! 实时连接、在线状态与广播引擎：授权接入、连接登记、输入状态、
//! 有界出站队列上的扇出、心跳驱逐与限流。持久化通过 `repository` 中的协作方接口完成。

pub mod authorizer;
pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod outbound;
pub mod presence;
pub mod rate_limiter;
pub mod registry;
pub mod repository;
pub mod sequencer;
pub mod services;
pub mod typing;

pub use authorizer::{Authorization, DenyReason, ThreadAuthorizer};
pub use broadcaster::{DeliveryReport, MessageBroadcaster, Recipients};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use heartbeat::{HeartbeatMonitor, Liveness, EVICTION_CLOSE_CODE};
pub use memory::InMemoryStore;
pub use outbound::{Outbound, OutboundQueue, QueueError};
pub use presence::PresenceTracker;
pub use rate_limiter::{ActionClass, RateBucket, RateLimitError, RateLimiter};
pub use registry::{AttachOutcome, ConnectionRegistry, DetachOutcome, SocketEntry, SocketHandle};
pub use repository::{
    BlockRepository, CheckinRepository, MessageRepository, PresenceRepository,
    ReadStateRepository, ThreadRepository,
};
pub use sequencer::ChannelSequencer;
pub use services::{
    RealtimeService, RealtimeServiceDependencies, DM_MESSAGE_NOTIFICATION, GOING_AWAY_CLOSE_CODE,
    NORMAL_CLOSE_CODE,
};
pub use typing::TypingCoordinator;
