//! 按 (用户, 动作类别) 的令牌桶限流
//!
//! 固定窗口：窗口开始时桶被装满 `capacity` 个令牌，每次动作消耗一个，
//! 只在窗口边界补满，不会出现负数。

use std::fmt;
use std::sync::Arc;

use config::{BucketConfig, RateLimitConfig};
use dashmap::DashMap;
use domain::{Timestamp, UserId};

use crate::clock::Clock;

/// 受限流约束的动作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Message,
    Typing,
    Reaction,
    MarkRead,
    ThreadCreation,
}

impl ActionClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionClass::Message => "message",
            ActionClass::Typing => "typing",
            ActionClass::Reaction => "reaction",
            ActionClass::MarkRead => "mark_read",
            ActionClass::ThreadCreation => "thread_creation",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个令牌桶
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    /// 当前窗口剩余令牌
    pub tokens: u32,
    /// 当前窗口的开始时间
    pub window_start: Timestamp,
}

impl RateBucket {
    fn full(capacity: u32, now: Timestamp) -> Self {
        Self {
            tokens: capacity,
            window_start: now,
        }
    }
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {action}: {current}/{max} per window")]
    RateLimitExceeded {
        action: ActionClass,
        current: u32,
        max: u32,
    },

    #[error("Too many connections: {current}/{max} connections per user")]
    TooManyConnections { current: u32, max: u32 },
}

pub struct RateLimiter {
    limits: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<(UserId, ActionClass), RateBucket>,
}

impl RateLimiter {
    pub fn new(limits: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            buckets: DashMap::new(),
        }
    }

    fn limit_for(&self, action: ActionClass) -> BucketConfig {
        match action {
            ActionClass::Message => self.limits.message,
            ActionClass::Typing => self.limits.typing,
            ActionClass::Reaction => self.limits.reaction,
            ActionClass::MarkRead => self.limits.mark_read,
            ActionClass::ThreadCreation => self.limits.thread_creation,
        }
    }

    fn window(limit: BucketConfig) -> chrono::Duration {
        chrono::Duration::seconds(limit.window_secs as i64)
    }

    /// 消耗一个令牌；拒绝时桶状态不变
    pub fn check(&self, user_id: UserId, action: ActionClass) -> Result<(), RateLimitError> {
        let limit = self.limit_for(action);
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry((user_id, action))
            .or_insert_with(|| RateBucket::full(limit.capacity, now));

        // 检查是否需要进入新的时间窗口
        if now - bucket.window_start >= Self::window(limit) {
            *bucket = RateBucket::full(limit.capacity, now);
        }

        if bucket.tokens == 0 {
            return Err(RateLimitError::RateLimitExceeded {
                action,
                current: limit.capacity,
                max: limit.capacity,
            });
        }

        bucket.tokens -= 1;
        Ok(())
    }

    pub fn allow(&self, user_id: UserId, action: ActionClass) -> bool {
        self.check(user_id, action).is_ok()
    }

    /// 当前窗口剩余令牌数
    pub fn remaining(&self, user_id: UserId, action: ActionClass) -> u32 {
        let limit = self.limit_for(action);
        let now = self.clock.now();
        self.buckets
            .get(&(user_id, action))
            .filter(|bucket| now - bucket.window_start < Self::window(limit))
            .map_or(limit.capacity, |bucket| bucket.tokens)
    }

    /// 清理窗口早已结束的桶（防止内存泄漏），返回清理数量
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|(_, action), bucket| {
            now - bucket.window_start < Self::window(self.limit_for(*action)) * 2
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(message_capacity: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::default());
        let limits = RateLimitConfig {
            message: BucketConfig::per_minute(message_capacity),
            ..RateLimitConfig::default()
        };
        (clock.clone(), RateLimiter::new(limits, clock))
    }

    #[test]
    fn test_rate_limiting() {
        let (_, limiter) = limiter(5);
        let user_id = UserId::new(1);

        // 发送5条消息应该成功
        for i in 0..5 {
            let result = limiter.check(user_id, ActionClass::Message);
            assert!(result.is_ok(), "Message {} should be allowed", i + 1);
        }

        // 第6条消息应该被限流
        let result = limiter.check(user_id, ActionClass::Message);
        if let Err(RateLimitError::RateLimitExceeded {
            action,
            current,
            max,
        }) = result
        {
            assert_eq!(action, ActionClass::Message);
            assert_eq!(current, 5);
            assert_eq!(max, 5);
        } else {
            panic!("Expected RateLimitExceeded error");
        }
        assert_eq!(limiter.remaining(user_id, ActionClass::Message), 0);
    }

    #[test]
    fn test_classes_and_users_are_independent() {
        let (_, limiter) = limiter(1);
        assert!(limiter.allow(UserId::new(1), ActionClass::Message));
        assert!(!limiter.allow(UserId::new(1), ActionClass::Message));
        assert!(limiter.allow(UserId::new(1), ActionClass::Typing));
        assert!(limiter.allow(UserId::new(2), ActionClass::Message));
    }

    #[test]
    fn test_refill_only_at_window_boundary() {
        let (clock, limiter) = limiter(2);
        let user_id = UserId::new(1);
        assert!(limiter.allow(user_id, ActionClass::Message));
        assert!(limiter.allow(user_id, ActionClass::Message));

        clock.advance(chrono::Duration::seconds(59));
        assert!(!limiter.allow(user_id, ActionClass::Message));

        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.allow(user_id, ActionClass::Message));
        assert_eq!(limiter.remaining(user_id, ActionClass::Message), 1);
    }

    #[test]
    fn test_thread_creation_default_quota() {
        let (_, limiter) = limiter(20);
        let user_id = UserId::new(9);
        let accepted = (0..6)
            .filter(|_| limiter.allow(user_id, ActionClass::ThreadCreation))
            .count();
        assert_eq!(accepted, 5);
    }

    #[test]
    fn test_purge_idle_buckets() {
        let (clock, limiter) = limiter(5);
        limiter.allow(UserId::new(1), ActionClass::Message);
        limiter.allow(UserId::new(2), ActionClass::Reaction);
        assert_eq!(limiter.tracked_buckets(), 2);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(limiter.purge_idle(), 0);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(limiter.purge_idle(), 2);
        assert_eq!(limiter.tracked_buckets(), 0);
    }
}
