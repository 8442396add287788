//! WebSocket相关实体
//!
//! 定义客户端与服务器之间交换的 JSON 帧，所有帧都以 `type` 字段区分。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::events::{DomainEvent, EventPayload};
use crate::message::MessageRecord;
use crate::value_objects::{MessageId, UserId};

/// 客户端消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 应用层心跳
    Ping,
    /// 输入状态
    Typing {
        #[serde(default)]
        typing: bool,
    },
    /// 发送消息
    Message { text: String },
    /// 标记已读
    MarkRead,
    /// 表情回应
    Reaction {
        message_id: MessageId,
        reaction: String,
    },
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Ping => "ping",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::Message { .. } => "message",
            ClientFrame::MarkRead => "mark_read",
            ClientFrame::Reaction { .. } => "reaction",
        }
    }
}

/// 服务器消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 连接建立成功
    ConnectionEstablished {
        channel: Channel,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// 心跳响应
    Pong { timestamp: DateTime<Utc> },
    /// 新消息
    Message {
        message: MessageRecord,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    /// 输入状态
    Typing {
        user_id: UserId,
        typing: bool,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    /// 在线状态
    Presence {
        user_id: UserId,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_active_at: Option<DateTime<Utc>>,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    /// 已读回执
    ReadReceipt {
        user_id: UserId,
        last_read_at: DateTime<Utc>,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    /// 表情回应
    Reaction {
        message_id: MessageId,
        user_id: UserId,
        reaction: String,
        seq: u64,
    },
    /// 个人通知
    Notification {
        notification_type: String,
        data: serde_json::Value,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    /// 错误消息，只发给出错的连接
    Error {
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn error(detail: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        ServerFrame::Error {
            detail: detail.into(),
            timestamp,
        }
    }

    /// 不带序列号的在线状态快照，只发给刚接入的连接
    pub fn presence_snapshot(user_id: UserId, timestamp: DateTime<Utc>) -> Self {
        ServerFrame::Presence {
            user_id,
            online: true,
            last_active_at: None,
            seq: 0,
            timestamp,
        }
    }

    /// 队列满时不可丢弃的帧
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerFrame::ConnectionEstablished { .. } | ServerFrame::Message { .. }
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&DomainEvent> for ServerFrame {
    fn from(event: &DomainEvent) -> Self {
        let seq = event.sequence;
        let timestamp = event.timestamp;
        match &event.payload {
            EventPayload::MessageCreated { message } => ServerFrame::Message {
                message: message.clone(),
                seq,
                timestamp,
            },
            EventPayload::TypingChanged { user_id, typing } => ServerFrame::Typing {
                user_id: *user_id,
                typing: *typing,
                seq,
                timestamp,
            },
            EventPayload::PresenceChanged {
                user_id,
                online,
                last_active_at,
            } => ServerFrame::Presence {
                user_id: *user_id,
                online: *online,
                last_active_at: *last_active_at,
                seq,
                timestamp,
            },
            EventPayload::ReadReceipt {
                user_id,
                last_read_at,
            } => ServerFrame::ReadReceipt {
                user_id: *user_id,
                last_read_at: *last_read_at,
                seq,
                timestamp,
            },
            EventPayload::Reaction {
                message_id,
                user_id,
                reaction,
            } => ServerFrame::Reaction {
                message_id: message_id.clone(),
                user_id: *user_id,
                reaction: reaction.as_str().to_owned(),
                seq,
            },
            EventPayload::Notification {
                notification_type,
                data,
            } => ServerFrame::Notification {
                notification_type: notification_type.clone(),
                data: data.clone(),
                seq,
                timestamp,
            },
        }
    }
}
