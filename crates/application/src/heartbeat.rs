//! 心跳检测
//!
//! 每个 tick 向所有连接发送 ping。超过 pong 截止时间未响应的连接被驱逐；
//! 被标记为需要复查的连接（关键帧投递失败）只给一个 ping 间隔的宽限。

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::outbound::Outbound;
use crate::registry::{ConnectionRegistry, SocketHandle};

/// 驱逐时使用的关闭码（going away）
pub const EVICTION_CLOSE_CODE: u16 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Evicted,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    ping_interval: chrono::Duration,
    pong_deadline: chrono::Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        ping_interval: chrono::Duration,
        pong_deadline: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            ping_interval,
            pong_deadline,
        }
    }

    pub fn liveness(&self, socket: &SocketHandle) -> Liveness {
        let idle = self.clock.now() - socket.last_seen();
        let deadline = if socket.needs_liveness_check() {
            self.ping_interval
        } else {
            self.pong_deadline
        };
        if idle > deadline {
            Liveness::Evicted
        } else {
            Liveness::Alive
        }
    }

    /// 一轮心跳：驱逐失活连接、向其余连接发送 ping；返回被驱逐的连接，
    /// 调用方负责从注册表中移除并发布在线状态变化
    pub fn tick(&self) -> Vec<SocketHandle> {
        let mut evicted = Vec::new();
        for socket in self.registry.all_sockets() {
            match self.liveness(&socket) {
                Liveness::Evicted => {
                    info!(
                        socket_id = %socket.id(),
                        user_id = %socket.user_id(),
                        channel = %socket.channel(),
                        last_seen = %socket.last_seen(),
                        flagged = socket.needs_liveness_check(),
                        "心跳超时，驱逐连接"
                    );
                    socket.terminate(EVICTION_CLOSE_CODE, "heartbeat_timeout");
                    evicted.push(socket);
                }
                Liveness::Alive => {
                    if socket.outbound().push_control(Outbound::Ping).is_err() {
                        debug!(socket_id = %socket.id(), "出站队列已关闭，跳过 ping");
                    }
                }
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::SocketEntry;
    use domain::{Channel, UserId};

    fn setup() -> (Arc<ManualClock>, Arc<ConnectionRegistry>, HeartbeatMonitor) {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            clock.clone(),
            chrono::Duration::seconds(30),
            chrono::Duration::seconds(60),
        );
        (clock, registry, monitor)
    }

    fn attach(registry: &ConnectionRegistry, clock: &ManualClock, user: i64) -> SocketHandle {
        let socket = Arc::new(SocketEntry::new(
            UserId::new(user),
            Channel::UserChannel(UserId::new(user)),
            clock.now(),
            4,
        ));
        registry.attach(socket, 10).unwrap().handle
    }

    #[tokio::test]
    async fn alive_sockets_get_pinged() {
        let (clock, registry, monitor) = setup();
        let socket = attach(&registry, &clock, 1);

        clock.advance(chrono::Duration::seconds(30));
        assert!(monitor.tick().is_empty());
        assert_eq!(socket.outbound().recv().await, Some(Outbound::Ping));
    }

    #[tokio::test]
    async fn silent_socket_evicted_after_deadline() {
        let (clock, registry, monitor) = setup();
        let silent = attach(&registry, &clock, 1);
        let chatty = attach(&registry, &clock, 2);

        clock.advance(chrono::Duration::seconds(45));
        chatty.touch(clock.now());
        clock.advance(chrono::Duration::seconds(16));

        let evicted = monitor.tick();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), silent.id());
        assert!(silent.outbound().is_closed());
        assert!(!chatty.outbound().is_closed());
    }

    #[tokio::test]
    async fn flagged_socket_gets_one_ping_interval() {
        let (clock, registry, monitor) = setup();
        let socket = attach(&registry, &clock, 1);
        socket.flag_for_liveness_check();

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(monitor.liveness(&socket), Liveness::Evicted);

        socket.touch(clock.now());
        assert!(!socket.needs_liveness_check());
        assert_eq!(monitor.liveness(&socket), Liveness::Alive);
    }
}
