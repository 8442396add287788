use crate::channel::Channel;
use crate::value_objects::{MessageId, Timestamp, UserId};

/// 已持久化的消息记录
///
/// 由外部存储在广播之前生成，`id` 与 `created_at` 均为服务端分配。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub channel: Channel,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: Timestamp,
}
