//! 广播频道
//!
//! 频道是一次广播的作用域：私信会话、用户个人通知频道或地点聊天室。
//! 频道没有独立的持久化，首次有连接成功接入时隐式创建。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_objects::{PlaceId, ThreadId, UserId};

/// 频道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    DirectThread,
    UserChannel,
    PlaceRoom,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::DirectThread => "direct_thread",
            ChannelKind::UserChannel => "user_channel",
            ChannelKind::PlaceRoom => "place_room",
        }
    }
}

/// 频道标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Channel {
    DirectThread(ThreadId),
    UserChannel(UserId),
    PlaceRoom(PlaceId),
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::DirectThread(_) => ChannelKind::DirectThread,
            Channel::UserChannel(_) => ChannelKind::UserChannel,
            Channel::PlaceRoom(_) => ChannelKind::PlaceRoom,
        }
    }

    /// 个人通知频道只接收服务端推送
    pub fn is_receive_only(&self) -> bool {
        matches!(self, Channel::UserChannel(_))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::DirectThread(id) => write!(f, "dm:{id}"),
            Channel::UserChannel(id) => write!(f, "user:{id}"),
            Channel::PlaceRoom(id) => write!(f, "place:{id}"),
        }
    }
}
