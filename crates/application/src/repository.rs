//! 实时层依赖的外部协作方
//!
//! 持久化由外部存储负责，核心只通过这些接口查询授权所需的事实、落库消息与已读状态。

use std::collections::HashSet;

use async_trait::async_trait;
use domain::{
    Channel, DirectThread, MessageRecord, MessageText, PlaceId, RepositoryError, ThreadId,
    Timestamp, UserId,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn find_thread(&self, thread_id: ThreadId)
        -> Result<Option<DirectThread>, RepositoryError>;

    /// 频道的参与者：私信为双方，个人频道为本人，地点聊天为当前签到中的用户
    async fn list_participants(&self, channel: Channel) -> Result<HashSet<UserId>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockRepository: Send + Sync {
    /// 任一方向存在拉黑关系即返回 true
    async fn has_block(&self, user_a: UserId, user_b: UserId) -> Result<bool, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckinRepository: Send + Sync {
    async fn has_recent_checkin(
        &self,
        user_id: UserId,
        place_id: PlaceId,
        since: Timestamp,
    ) -> Result<bool, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 广播之前必须完成；返回带服务端 id 与时间戳的记录
    async fn persist_message(
        &self,
        channel: Channel,
        sender_id: UserId,
        text: MessageText,
    ) -> Result<MessageRecord, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadStateRepository: Send + Sync {
    async fn mark_read(
        &self,
        channel: Channel,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    /// 仅在用户最后一个连接断开时调用
    async fn record_last_active(&self, user_id: UserId, at: Timestamp)
        -> Result<(), RepositoryError>;
}
