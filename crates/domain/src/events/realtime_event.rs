//! 实时层领域事件
//!
//! `EventPayload` 描述事件内容，`DomainEvent` 在广播时补上频道、序列号和时间戳。

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::message::MessageRecord;
use crate::value_objects::{MessageId, ReactionKind, Timestamp, UserId};

/// 事件内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    /// 消息已持久化
    MessageCreated { message: MessageRecord },

    /// 输入状态变化
    TypingChanged { user_id: UserId, typing: bool },

    /// 在线状态变化
    PresenceChanged {
        user_id: UserId,
        online: bool,
        last_active_at: Option<Timestamp>,
    },

    /// 已读回执
    ReadReceipt {
        user_id: UserId,
        last_read_at: Timestamp,
    },

    /// 消息表情回应（仅实时广播，不持久化）
    Reaction {
        message_id: MessageId,
        user_id: UserId,
        reaction: ReactionKind,
    },

    /// 个人通知
    Notification {
        notification_type: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// 创建消息事件
    pub fn message_created(message: MessageRecord) -> Self {
        EventPayload::MessageCreated { message }
    }

    /// 创建输入状态事件
    pub fn typing_changed(user_id: UserId, typing: bool) -> Self {
        EventPayload::TypingChanged { user_id, typing }
    }

    /// 创建上线事件
    pub fn online(user_id: UserId) -> Self {
        EventPayload::PresenceChanged {
            user_id,
            online: true,
            last_active_at: None,
        }
    }

    /// 创建下线事件
    pub fn offline(user_id: UserId, last_active_at: Timestamp) -> Self {
        EventPayload::PresenceChanged {
            user_id,
            online: false,
            last_active_at: Some(last_active_at),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::MessageCreated { .. } => "message_created",
            EventPayload::TypingChanged { .. } => "typing_changed",
            EventPayload::PresenceChanged { .. } => "presence_changed",
            EventPayload::ReadReceipt { .. } => "read_receipt",
            EventPayload::Reaction { .. } => "reaction",
            EventPayload::Notification { .. } => "notification",
        }
    }

    /// 关键事件在出站队列满时不能被丢弃
    pub fn is_critical(&self) -> bool {
        matches!(self, EventPayload::MessageCreated { .. })
    }
}

/// 已就绪、可扇出的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub channel: Channel,
    /// 频道内单调递增的序列号，仅用于排序提示
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(channel: Channel, sequence: u64, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            channel,
            sequence,
            timestamp,
            payload,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.payload.is_critical()
    }
}
