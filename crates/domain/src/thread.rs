use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ThreadId, UserId};

/// 私信会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Pending,
    Accepted,
    Declined,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Pending => "pending",
            ThreadStatus::Accepted => "accepted",
            ThreadStatus::Declined => "declined",
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ThreadStatus::Pending),
            "accepted" => Ok(ThreadStatus::Accepted),
            "declined" => Ok(ThreadStatus::Declined),
            other => Err(DomainError::validation_error(
                "thread_status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// 两人私信会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectThread {
    pub id: ThreadId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub status: ThreadStatus,
}

impl DirectThread {
    pub fn new(id: ThreadId, user_a: UserId, user_b: UserId, status: ThreadStatus) -> Self {
        Self {
            id,
            user_a,
            user_b,
            status,
        }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.user_a, self.user_b]
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// 会话中的另一方；非参与者返回 None
    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ThreadStatus::Accepted
    }
}
