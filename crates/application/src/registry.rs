//! 连接注册表
//!
//! 记录每个活跃连接属于哪个用户、挂在哪个频道上。三张分片表：
//! - `sockets`：连接 id -> 连接
//! - `by_user`：用户 -> 连接 id 集合（非空即在线）
//! - `by_channel`：频道 -> 连接
//!
//! 加锁顺序固定为 `by_user` 分片 -> `sockets` -> `by_channel` 分片，
//! 同一用户的 attach/detach 在 `by_user` 分片锁内串行完成。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{Channel, SocketId, Timestamp, UserId};

use crate::outbound::OutboundQueue;
use crate::rate_limiter::RateLimitError;

/// 一个活跃的 WebSocket 连接
#[derive(Debug)]
pub struct SocketEntry {
    id: SocketId,
    user_id: UserId,
    channel: Channel,
    connected_at: Timestamp,
    last_seen: Mutex<Timestamp>,
    needs_liveness_check: AtomicBool,
    outbound: OutboundQueue,
}

pub type SocketHandle = Arc<SocketEntry>;

impl SocketEntry {
    pub fn new(
        user_id: UserId,
        channel: Channel,
        connected_at: Timestamp,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id: SocketId::generate(),
            user_id,
            channel,
            connected_at,
            last_seen: Mutex::new(connected_at),
            needs_liveness_check: AtomicBool::new(false),
            outbound: OutboundQueue::new(queue_capacity),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn last_seen(&self) -> Timestamp {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 收到 ping/pong 时刷新存活时间，同时清除复查标记
    pub fn touch(&self, at: Timestamp) {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if at > *last_seen {
            *last_seen = at;
        }
        self.needs_liveness_check.store(false, Ordering::Release);
    }

    /// 关键帧投递失败后标记，等待心跳复查
    pub fn flag_for_liveness_check(&self) {
        self.needs_liveness_check.store(true, Ordering::Release);
    }

    pub fn needs_liveness_check(&self) -> bool {
        self.needs_liveness_check.load(Ordering::Acquire)
    }

    /// 关闭出站队列，写任务发出关闭帧后退出
    pub fn terminate(&self, code: u16, reason: &str) {
        self.outbound.close(code, reason);
    }

}

#[derive(Debug)]
pub struct AttachOutcome {
    pub handle: SocketHandle,
    /// 用户的连接数从 0 变为 1
    pub came_online: bool,
}

#[derive(Debug, Default)]
pub struct DetachOutcome {
    /// 为 None 表示连接已经被移除过（重复 detach）
    pub handle: Option<SocketHandle>,
    /// 用户的连接数从 1 变为 0
    pub went_offline: bool,
    /// 该用户在此频道上已没有其他连接
    pub left_channel: bool,
    /// 频道上已没有任何连接
    pub channel_empty: bool,
}

impl DetachOutcome {
    pub fn removed(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sockets: DashMap<SocketId, SocketHandle>,
    by_user: DashMap<UserId, HashSet<SocketId>>,
    by_channel: DashMap<Channel, HashMap<SocketId, SocketHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记连接；超过单用户连接上限时拒绝，不留下任何状态
    pub fn attach(
        &self,
        socket: SocketHandle,
        max_per_user: usize,
    ) -> Result<AttachOutcome, RateLimitError> {
        let user_id = socket.user_id();
        let mut user_sockets = self.by_user.entry(user_id).or_default();

        if user_sockets.len() >= max_per_user {
            let current = user_sockets.len() as u32;
            let was_empty = user_sockets.is_empty();
            drop(user_sockets);
            if was_empty {
                self.by_user.remove_if(&user_id, |_, sockets| sockets.is_empty());
            }
            return Err(RateLimitError::TooManyConnections {
                current,
                max: max_per_user as u32,
            });
        }

        let came_online = user_sockets.is_empty();
        user_sockets.insert(socket.id());
        self.sockets.insert(socket.id(), socket.clone());
        self.by_channel
            .entry(socket.channel())
            .or_default()
            .insert(socket.id(), socket.clone());

        Ok(AttachOutcome {
            handle: socket,
            came_online,
        })
    }

    /// 移除连接；幂等，重复调用返回空结果
    pub fn detach(&self, socket_id: SocketId) -> DetachOutcome {
        let Some(user_id) = self.sockets.get(&socket_id).map(|s| s.user_id()) else {
            return DetachOutcome::default();
        };

        let Entry::Occupied(mut user_sockets) = self.by_user.entry(user_id) else {
            return DetachOutcome::default();
        };

        // 并发 detach 时只有一方能从 sockets 中取到连接
        let Some((_, handle)) = self.sockets.remove(&socket_id) else {
            return DetachOutcome::default();
        };

        user_sockets.get_mut().remove(&socket_id);
        let went_offline = user_sockets.get().is_empty();
        if went_offline {
            user_sockets.remove();
        }

        let mut left_channel = true;
        let mut channel_empty = false;
        if let Entry::Occupied(mut members) = self.by_channel.entry(handle.channel()) {
            members.get_mut().remove(&socket_id);
            left_channel = !members.get().values().any(|s| s.user_id() == user_id);
            if members.get().is_empty() {
                members.remove();
                channel_empty = true;
            }
        }

        DetachOutcome {
            handle: Some(handle),
            went_offline,
            left_channel,
            channel_empty,
        }
    }

    /// 频道上连接的快照，迭代期间不受并发 attach/detach 影响
    pub fn sockets_for(&self, channel: Channel) -> Vec<SocketHandle> {
        self.by_channel
            .get(&channel)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_sockets(&self, channel: Channel) -> bool {
        self.by_channel
            .get(&channel)
            .is_some_and(|members| !members.is_empty())
    }

    /// 频道上当前在线的用户
    pub fn users_in(&self, channel: Channel) -> HashSet<UserId> {
        self.by_channel
            .get(&channel)
            .map(|members| members.values().map(|s| s.user_id()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, socket_id: SocketId) -> Option<SocketHandle> {
        self.sockets.get(&socket_id).map(|s| s.clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user
            .get(&user_id)
            .is_some_and(|sockets| !sockets.is_empty())
    }

    pub fn socket_count(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map_or(0, |sockets| sockets.len())
    }

    pub fn all_sockets(&self) -> Vec<SocketHandle> {
        self.sockets.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
