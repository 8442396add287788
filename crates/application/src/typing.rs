//! 输入状态
//!
//! (频道, 用户) -> 过期时间。只在状态翻转时产生事件；重复的 typing=true 只刷新 TTL。
//! 过期条目由后台清理任务移除并产生 typing=false，清理间隔不超过 TTL 的一半。

use std::sync::Arc;

use dashmap::DashMap;
use domain::{Channel, EventPayload, Timestamp, UserId};

use crate::clock::Clock;

pub struct TypingCoordinator {
    entries: DashMap<(Channel, UserId), Timestamp>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TypingCoordinator {
    pub fn new(ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn set_typing(&self, channel: Channel, user_id: UserId, typing: bool) -> Option<EventPayload> {
        let now = self.clock.now();
        if typing {
            let previous = self.entries.insert((channel, user_id), now + self.ttl);
            // 已过期但尚未清理的条目视为不存在
            match previous {
                Some(expiry) if expiry > now => None,
                _ => Some(EventPayload::typing_changed(user_id, true)),
            }
        } else {
            self.clear(channel, user_id)
        }
    }

    /// 立即移除条目；之前处于输入状态时返回 typing=false 事件
    pub fn clear(&self, channel: Channel, user_id: UserId) -> Option<EventPayload> {
        self.entries
            .remove(&(channel, user_id))
            .map(|_| EventPayload::typing_changed(user_id, false))
    }

    /// 移除所有过期条目，返回需要广播的 typing=false 事件
    pub fn sweep(&self) -> Vec<(Channel, EventPayload)> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        self.entries.retain(|(channel, user_id), expiry| {
            if *expiry <= now {
                expired.push((*channel, EventPayload::typing_changed(*user_id, false)));
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn is_typing(&self, channel: Channel, user_id: UserId) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&(channel, user_id))
            .is_some_and(|expiry| *expiry > now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
