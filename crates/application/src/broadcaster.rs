//! 频道事件扇出
//!
//! 对频道连接做快照后并发入队，每个接收方独立超时：慢连接只会让自己被记为失败，
//! 不会拖慢其他接收方。失败不重试，也不关闭连接；关键帧失败时只打复查标记，
//! 由心跳决定是否驱逐。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use domain::{Channel, DomainEvent, EventPayload, ServerFrame, SocketId, UserId};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::outbound::QueueError;
use crate::registry::{ConnectionRegistry, SocketEntry, SocketHandle};
use crate::sequencer::ChannelSequencer;

/// 广播的接收范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    /// 频道内所有连接（含发送者自身，用于消息回显）
    All,
    /// 排除触发事件的连接
    AllExcept(SocketId),
}

impl Recipients {
    fn includes(&self, socket: &SocketEntry) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => socket.id() != *excluded,
        }
    }
}

/// 一次广播的投递结果
///
/// 同一用户有多个连接时，只要有一个成功就进入 `delivered`，有一个失败就进入 `failed`。
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub delivered: HashSet<UserId>,
    pub failed: HashSet<UserId>,
    pub failed_sockets: Vec<SocketId>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// 合并另一次广播的结果
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
        self.failed_sockets.extend(other.failed_sockets);
    }
}

#[derive(Debug, thiserror::Error)]
enum SendFailure {
    #[error("send timed out")]
    Timeout,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct MessageBroadcaster {
    registry: Arc<ConnectionRegistry>,
    sequencer: Arc<ChannelSequencer>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

impl MessageBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sequencer: Arc<ChannelSequencer>,
        clock: Arc<dyn Clock>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sequencer,
            clock,
            send_timeout,
        }
    }

    /// 为事件分配序列号与时间戳后扇出
    ///
    /// 频道上没有连接时直接返回空报告，不分配序列号。
    pub async fn broadcast(
        &self,
        channel: Channel,
        payload: EventPayload,
        recipients: Recipients,
    ) -> DeliveryReport {
        let sockets = self.registry.sockets_for(channel);
        if sockets.is_empty() {
            debug!(channel = %channel, event = payload.name(), "频道无连接，跳过广播");
            return DeliveryReport::default();
        }

        let event = DomainEvent::new(
            channel,
            self.sequencer.next(channel),
            self.clock.now(),
            payload,
        );
        self.deliver(&event, sockets, recipients).await
    }

    async fn deliver(
        &self,
        event: &DomainEvent,
        sockets: Vec<SocketHandle>,
        recipients: Recipients,
    ) -> DeliveryReport {
        let frame = ServerFrame::from(event);
        let critical = event.is_critical();
        let sockets: Vec<SocketHandle> = sockets
            .into_iter()
            .filter(|socket| recipients.includes(socket))
            .collect();

        let sends = sockets.into_iter().map(|socket| {
            let frame = frame.clone();
            async move {
                let result = self.enqueue(&socket, frame, critical).await;
                (socket, result)
            }
        });
        let results = join_all(sends).await;

        let mut report = DeliveryReport::default();
        for (socket, result) in results {
            match result {
                Ok(()) => {
                    report.delivered.insert(socket.user_id());
                }
                Err(err) => {
                    warn!(
                        channel = %event.channel,
                        socket_id = %socket.id(),
                        user_id = %socket.user_id(),
                        event = event.payload.name(),
                        error = %err,
                        "事件投递失败"
                    );
                    if critical {
                        socket.flag_for_liveness_check();
                    }
                    report.failed.insert(socket.user_id());
                    report.failed_sockets.push(socket.id());
                }
            }
        }

        debug!(
            channel = %event.channel,
            seq = event.sequence,
            event = event.payload.name(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "广播完成"
        );
        report
    }

    /// 只发给单个连接的帧（连接确认、在线快照、pong、错误）
    pub async fn send_to(&self, socket: &SocketEntry, frame: ServerFrame) -> Result<(), QueueError> {
        let critical = frame.is_critical();
        match self.enqueue(socket, frame, critical).await {
            Ok(()) => Ok(()),
            Err(SendFailure::Queue(err)) => Err(err),
            Err(SendFailure::Timeout) => {
                socket.flag_for_liveness_check();
                Err(QueueError::Full)
            }
        }
    }

    async fn enqueue(
        &self,
        socket: &SocketEntry,
        frame: ServerFrame,
        critical: bool,
    ) -> Result<(), SendFailure> {
        tokio::time::timeout(self.send_timeout, socket.outbound().send(frame, critical))
            .await
            .map_err(|_| SendFailure::Timeout)?
            .map_err(SendFailure::from)
    }
}
