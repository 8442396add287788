use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 消息正文的最大字符数。
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// 表情回应的最大字符数。
pub const MAX_REACTION_CHARS: usize = 32;

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

integer_id!(
    /// 用户唯一标识。
    UserId
);
integer_id!(
    /// 私信会话唯一标识。
    ThreadId
);
integer_id!(
    /// 地点唯一标识。
    PlaceId
);

/// 单个 WebSocket 连接的唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketId(pub Uuid);

impl SocketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SocketId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// 消息标识。
///
/// 私信消息使用整数主键，地点聊天消息使用 UUID，因此统一按不透明字符串处理；
/// 反序列化时同时接受 JSON 数字与字符串。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawMessageId", into = "String")]
pub struct MessageId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessageId {
    Number(i64),
    Text(String),
}

impl From<RawMessageId> for MessageId {
    fn from(value: RawMessageId) -> Self {
        match value {
            RawMessageId::Number(n) => Self(n.to_string()),
            RawMessageId::Text(s) => Self(s),
        }
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 经过验证的消息正文。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageText(String);

impl MessageText {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error("text", "cannot be empty"));
        }
        if value.chars().count() > MAX_MESSAGE_CHARS {
            return Err(DomainError::validation_error(
                "text",
                format!("must be at most {MAX_MESSAGE_CHARS} characters"),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 经过验证的表情回应。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionKind(String);

impl ReactionKind {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error("reaction", "cannot be empty"));
        }
        if value.chars().count() > MAX_REACTION_CHARS {
            return Err(DomainError::validation_error("reaction", "too long"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_is_trimmed_and_bounded() {
        assert_eq!(MessageText::parse("  hi  ").unwrap().as_str(), "hi");
        assert!(MessageText::parse("   ").is_err());
        assert!(MessageText::parse("x".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(MessageText::parse("x".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
    }

    #[test]
    fn message_id_accepts_numbers_and_strings() {
        let from_number: MessageId = serde_json::from_str("42").unwrap();
        let from_text: MessageId = serde_json::from_str("\"9b1d\"").unwrap();
        assert_eq!(from_number.as_str(), "42");
        assert_eq!(from_text.as_str(), "9b1d");
        assert_eq!(serde_json::to_string(&from_number).unwrap(), "\"42\"");
    }

    #[test]
    fn reaction_rejects_blank() {
        assert!(ReactionKind::parse("").is_err());
        assert_eq!(ReactionKind::parse("🔥").unwrap().as_str(), "🔥");
    }
}
