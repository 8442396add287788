use std::collections::HashSet;
use std::sync::Arc;

use config::{RateLimitConfig, RealtimeConfig};
use domain::{
    Channel, ClientFrame, DomainError, EventPayload, MessageRecord, MessageText, ReactionKind,
    ServerFrame, SocketId, ThreadId, UserId,
};
use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorizer::{Authorization, DenyReason, ThreadAuthorizer};
use crate::broadcaster::{DeliveryReport, MessageBroadcaster, Recipients};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::heartbeat::HeartbeatMonitor;
use crate::memory::InMemoryStore;
use crate::presence::PresenceTracker;
use crate::rate_limiter::{ActionClass, RateLimiter};
use crate::registry::{ConnectionRegistry, SocketEntry, SocketHandle};
use crate::repository::{
    BlockRepository, CheckinRepository, MessageRepository, PresenceRepository,
    ReadStateRepository, ThreadRepository,
};
use crate::sequencer::ChannelSequencer;
use crate::typing::TypingCoordinator;

/// 正常关闭使用的关闭码
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// 服务停止时使用的关闭码
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// 私信新消息推送到对方个人频道时使用的通知类型
pub const DM_MESSAGE_NOTIFICATION: &str = "dm_message";

pub struct RealtimeServiceDependencies {
    pub thread_repository: Arc<dyn ThreadRepository>,
    pub block_repository: Arc<dyn BlockRepository>,
    pub checkin_repository: Arc<dyn CheckinRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub read_state_repository: Arc<dyn ReadStateRepository>,
    pub presence_repository: Arc<dyn PresenceRepository>,
    pub clock: Arc<dyn Clock>,
    pub realtime: RealtimeConfig,
    pub rate_limits: RateLimitConfig,
}

impl RealtimeServiceDependencies {
    /// 所有协作方都由同一个内存存储提供
    pub fn in_memory(
        store: Arc<InMemoryStore>,
        clock: Arc<dyn Clock>,
        realtime: RealtimeConfig,
        rate_limits: RateLimitConfig,
    ) -> Self {
        Self {
            thread_repository: store.clone(),
            block_repository: store.clone(),
            checkin_repository: store.clone(),
            message_repository: store.clone(),
            read_state_repository: store.clone(),
            presence_repository: store,
            clock,
            realtime,
            rate_limits,
        }
    }
}

/// 实时层编排：授权 -> 登记 -> 在线状态 -> 帧处理 -> 广播 -> 断开清理
pub struct RealtimeService {
    config: RealtimeConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<ConnectionRegistry>,
    sequencer: Arc<ChannelSequencer>,
    authorizer: ThreadAuthorizer,
    broadcaster: MessageBroadcaster,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    heartbeat: HeartbeatMonitor,
    rate_limiter: RateLimiter,
    thread_repository: Arc<dyn ThreadRepository>,
    message_repository: Arc<dyn MessageRepository>,
    read_state_repository: Arc<dyn ReadStateRepository>,
}

impl RealtimeService {
    pub fn new(deps: RealtimeServiceDependencies) -> Self {
        let config = deps.realtime;
        let registry = Arc::new(ConnectionRegistry::new());
        let sequencer = Arc::new(ChannelSequencer::new());

        let authorizer = ThreadAuthorizer::new(
            deps.thread_repository.clone(),
            deps.block_repository,
            deps.checkin_repository,
            deps.clock.clone(),
            chrono::Duration::hours(config.place_chat_window_hours),
        );
        let broadcaster = MessageBroadcaster::new(
            registry.clone(),
            sequencer.clone(),
            deps.clock.clone(),
            config.send_timeout(),
        );
        let presence = PresenceTracker::new(deps.presence_repository, deps.clock.clone());
        let typing = TypingCoordinator::new(
            chrono::Duration::seconds(config.typing_ttl_secs as i64),
            deps.clock.clone(),
        );
        let heartbeat = HeartbeatMonitor::new(
            registry.clone(),
            deps.clock.clone(),
            chrono::Duration::seconds(config.ping_interval_secs as i64),
            chrono::Duration::seconds(config.pong_deadline_secs as i64),
        );
        let rate_limiter = RateLimiter::new(deps.rate_limits, deps.clock.clone());

        Self {
            config,
            clock: deps.clock,
            registry,
            sequencer,
            authorizer,
            broadcaster,
            presence,
            typing,
            heartbeat,
            rate_limiter,
            thread_repository: deps.thread_repository,
            message_repository: deps.message_repository,
            read_state_repository: deps.read_state_repository,
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// 授权并登记一个新连接
    ///
    /// 拒绝时不记录任何状态，返回 `ApplicationError::Authorization`，由传输层以 1008 关闭。
    pub async fn open_session(
        &self,
        user_id: UserId,
        channel: Channel,
    ) -> Result<SocketHandle, ApplicationError> {
        if let Authorization::Deny(reason) = self.authorizer.authorize(user_id, channel).await? {
            warn!(user_id = %user_id, channel = %channel, reason = %reason, "拒绝接入频道");
            return Err(ApplicationError::authorization(reason));
        }

        let socket = Arc::new(SocketEntry::new(
            user_id,
            channel,
            self.clock.now(),
            self.config.outbound_queue_capacity,
        ));
        let outcome = self
            .registry
            .attach(socket, self.config.max_sockets_per_user)
            .map_err(|err| {
                warn!(user_id = %user_id, channel = %channel, error = %err, "连接数超过上限");
                ApplicationError::authorization(DenyReason::TooManyConnections)
            })?;
        let handle = outcome.handle.clone();
        info!(
            user_id = %user_id,
            channel = %channel,
            socket_id = %handle.id(),
            "连接已接入"
        );

        let now = self.clock.now();
        self.reply(
            &handle,
            ServerFrame::ConnectionEstablished {
                channel,
                user_id,
                timestamp: now,
            },
        )
        .await;

        // 新连接先拿到频道内其他在线用户的快照
        for other in self.registry.users_in(channel) {
            if other != user_id {
                self.reply(&handle, ServerFrame::presence_snapshot(other, now))
                    .await;
            }
        }

        if let Some(payload) = self.presence.on_attach(&outcome) {
            self.broadcaster
                .broadcast(channel, payload, Recipients::AllExcept(handle.id()))
                .await;
        }

        Ok(handle)
    }

    /// 处理一条文本帧；所有错误都只回给发送者，连接保持打开
    pub async fn handle_text(&self, socket: &SocketHandle, text: &str) {
        let result = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(socket, frame).await,
            Err(err) => Err(ApplicationError::validation(format!("invalid frame: {err}"))),
        };
        if let Err(err) = result {
            self.reject(socket, err).await;
        }
    }

    pub async fn handle_frame(
        &self,
        socket: &SocketHandle,
        frame: ClientFrame,
    ) -> Result<(), ApplicationError> {
        let channel = socket.channel();
        let user_id = socket.user_id();
        debug!(socket_id = %socket.id(), frame = frame.name(), "收到客户端帧");

        if channel.is_receive_only() && !matches!(frame, ClientFrame::Ping) {
            return Err(DomainError::unsupported_on_channel(channel.kind().as_str(), frame.name()).into());
        }

        match frame {
            ClientFrame::Ping => {
                let now = self.clock.now();
                socket.touch(now);
                self.reply(socket, ServerFrame::Pong { timestamp: now }).await;
            }
            ClientFrame::Typing { typing } => {
                self.rate_limiter.check(user_id, ActionClass::Typing)?;
                if let Some(payload) = self.typing.set_typing(channel, user_id, typing) {
                    self.broadcaster
                        .broadcast(channel, payload, Recipients::AllExcept(socket.id()))
                        .await;
                }
            }
            ClientFrame::Message { text } => {
                self.post_message(socket, text).await?;
            }
            ClientFrame::MarkRead => {
                if !matches!(channel, Channel::DirectThread(_)) {
                    return Err(
                        DomainError::unsupported_on_channel(channel.kind().as_str(), "mark_read").into(),
                    );
                }
                self.rate_limiter.check(user_id, ActionClass::MarkRead)?;
                let at = self.clock.now();
                self.read_state_repository
                    .mark_read(channel, user_id, at)
                    .await
                    .map_err(|err| ApplicationError::persistence(err.to_string()))?;
                self.broadcaster
                    .broadcast(
                        channel,
                        EventPayload::ReadReceipt {
                            user_id,
                            last_read_at: at,
                        },
                        Recipients::AllExcept(socket.id()),
                    )
                    .await;
            }
            ClientFrame::Reaction {
                message_id,
                reaction,
            } => {
                self.rate_limiter.check(user_id, ActionClass::Reaction)?;
                let reaction = ReactionKind::parse(reaction)?;
                self.broadcaster
                    .broadcast(
                        channel,
                        EventPayload::Reaction {
                            message_id,
                            user_id,
                            reaction,
                        },
                        Recipients::All,
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// 先持久化再广播；持久化失败时不广播任何内容
    pub async fn post_message(
        &self,
        socket: &SocketHandle,
        text: impl Into<String>,
    ) -> Result<DeliveryReport, ApplicationError> {
        let channel = socket.channel();
        let user_id = socket.user_id();

        self.rate_limiter.check(user_id, ActionClass::Message)?;
        let text = MessageText::parse(text)?;

        let record = self
            .message_repository
            .persist_message(channel, user_id, text)
            .await
            .map_err(|err| ApplicationError::persistence(err.to_string()))?;

        let report = self
            .broadcaster
            .broadcast(
                channel,
                EventPayload::message_created(record.clone()),
                Recipients::All,
            )
            .await;
        info!(
            channel = %channel,
            user_id = %user_id,
            message_id = %record.id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "消息已广播"
        );

        if let Channel::DirectThread(thread_id) = channel {
            self.notify_counterparts(thread_id, &record).await;
        }
        Ok(report)
    }

    async fn notify_counterparts(&self, thread_id: ThreadId, record: &MessageRecord) {
        let participants = match self
            .thread_repository
            .list_participants(record.channel)
            .await
        {
            Ok(participants) => participants,
            Err(err) => {
                warn!(thread_id = %thread_id, error = %err, "获取会话参与者失败，跳过通知");
                return;
            }
        };

        for participant in participants {
            if participant == record.sender_id {
                continue;
            }
            self.notify_user(
                participant,
                DM_MESSAGE_NOTIFICATION,
                json!({ "thread_id": thread_id, "message": record }),
            )
            .await;
        }
    }

    /// 向用户的个人频道推送通知
    pub async fn notify_user(
        &self,
        user_id: UserId,
        notification_type: impl Into<String>,
        data: serde_json::Value,
    ) -> DeliveryReport {
        let notification_type = notification_type.into();
        debug!(user_id = %user_id, notification_type = %notification_type, "推送通知");
        self.broadcaster
            .broadcast(
                Channel::UserChannel(user_id),
                EventPayload::Notification {
                    notification_type,
                    data,
                },
                Recipients::All,
            )
            .await
    }

    /// 向多个用户并发推送同一条通知，单个用户失败不影响其他用户
    pub async fn notify_users(
        &self,
        user_ids: impl IntoIterator<Item = UserId>,
        notification_type: &str,
        data: serde_json::Value,
    ) -> DeliveryReport {
        let user_ids: HashSet<UserId> = user_ids.into_iter().collect();
        let sends = user_ids
            .into_iter()
            .map(|user_id| self.notify_user(user_id, notification_type, data.clone()));

        let mut report = DeliveryReport::default();
        for single in join_all(sends).await {
            report.merge(single);
        }
        report
    }

    /// WebSocket 层收到 Ping/Pong 时刷新存活时间
    pub fn record_pong(&self, socket: &SocketEntry) {
        socket.touch(self.clock.now());
    }

    /// 断开连接并发布相应的状态变化；幂等
    pub async fn close_session(&self, socket_id: SocketId) {
        let outcome = self.registry.detach(socket_id);
        let Some(socket) = outcome.handle.as_ref() else {
            return;
        };
        socket.terminate(NORMAL_CLOSE_CODE, "closed");

        let channel = socket.channel();
        let user_id = socket.user_id();

        if outcome.left_channel {
            if let Some(payload) = self.typing.clear(channel, user_id) {
                self.broadcaster
                    .broadcast(channel, payload, Recipients::All)
                    .await;
            }
        }

        if let Some(payload) = self.presence.on_detach(&outcome).await {
            self.broadcaster
                .broadcast(channel, payload, Recipients::All)
                .await;
        }

        // 等待期间可能已有新连接接入，回收前需复查
        if outcome.channel_empty && self.sequencer.release_if_idle(channel, &self.registry) {
            debug!(channel = %channel, "频道序列号已回收");
        }

        info!(
            user_id = %user_id,
            channel = %channel,
            socket_id = %socket_id,
            "连接已断开"
        );
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn socket_count(&self, user_id: UserId) -> usize {
        self.registry.socket_count(user_id)
    }

    pub fn is_typing(&self, channel: Channel, user_id: UserId) -> bool {
        self.typing.is_typing(channel, user_id)
    }

    /// 清理过期输入状态并广播 typing=false，同时回收闲置的限流桶与序列号
    pub async fn sweep(&self) {
        for (channel, payload) in self.typing.sweep() {
            self.broadcaster
                .broadcast(channel, payload, Recipients::All)
                .await;
        }
        let purged = self.rate_limiter.purge_idle();
        if purged > 0 {
            debug!(purged, "已清理闲置限流桶");
        }
        let released = self.sequencer.purge_idle(&self.registry);
        if released > 0 {
            debug!(released, "已回收空闲频道序列号");
        }
    }

    /// 一轮心跳，返回被驱逐的连接数
    pub async fn heartbeat_tick(&self) -> usize {
        let evicted = self.heartbeat.tick();
        for socket in &evicted {
            self.close_session(socket.id()).await;
        }
        evicted.len()
    }

    /// 服务停止时关闭全部连接，连接任务随后各自完成注销
    pub fn shutdown_sessions(&self) -> usize {
        let sockets = self.registry.all_sockets();
        for socket in &sockets {
            socket.terminate(GOING_AWAY_CLOSE_CODE, "server_shutdown");
        }
        sockets.len()
    }

    /// 启动输入状态清理与心跳两个后台任务，`shutdown` 取消后退出
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let service = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = self.config.typing_sweep_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => service.sweep().await,
                    }
                }
                debug!("输入状态清理任务已退出");
            })
        };

        let heartbeat = {
            let service = Arc::clone(self);
            let period = self.config.ping_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // 第一次 tick 立即完成，跳过
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let evicted = service.heartbeat_tick().await;
                            if evicted > 0 {
                                info!(evicted, "心跳驱逐完成");
                            }
                        }
                    }
                }
                debug!("心跳任务已退出");
            })
        };

        vec![sweeper, heartbeat]
    }

    async fn reply(&self, socket: &SocketEntry, frame: ServerFrame) {
        if let Err(err) = self.broadcaster.send_to(socket, frame).await {
            debug!(socket_id = %socket.id(), error = %err, "回复发送失败");
        }
    }

    async fn reject(&self, socket: &SocketEntry, err: ApplicationError) {
        match &err {
            ApplicationError::Persistence { .. } | ApplicationError::Repository(_) => {
                error!(socket_id = %socket.id(), user_id = %socket.user_id(), error = %err, "处理客户端帧失败");
            }
            ApplicationError::RateLimited(_) => {
                warn!(socket_id = %socket.id(), user_id = %socket.user_id(), error = %err, "触发限流");
            }
            _ => {
                debug!(socket_id = %socket.id(), error = %err, "客户端帧无效");
            }
        }
        self.reply(socket, ServerFrame::error(err.client_detail(), self.clock.now()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::outbound::Outbound;
    use crate::repository::MockMessageRepository;
    use domain::{DirectThread, PlaceId, RepositoryError, ThreadStatus, Timestamp};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        service: RealtimeService,
    }

    async fn harness() -> Harness {
        harness_with(|deps| deps).await
    }

    async fn harness_with(
        customize: impl FnOnce(RealtimeServiceDependencies) -> RealtimeServiceDependencies,
    ) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        store
            .upsert_thread(DirectThread::new(
                ThreadId::new(1),
                UserId::new(1),
                UserId::new(2),
                ThreadStatus::Accepted,
            ))
            .await;
        let deps = RealtimeServiceDependencies::in_memory(
            store.clone(),
            clock.clone(),
            RealtimeConfig::default(),
            RateLimitConfig::default(),
        );
        Harness {
            clock,
            store,
            service: RealtimeService::new(customize(deps)),
        }
    }

    async fn next_frame(socket: &SocketHandle) -> ServerFrame {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), socket.outbound().recv()).await {
                Ok(Some(Outbound::Frame(frame))) => return frame,
                Ok(Some(Outbound::Ping)) => continue,
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    const DM: Channel = Channel::DirectThread(ThreadId(1));

    #[tokio::test]
    async fn open_session_sends_established_then_snapshot() {
        let h = harness().await;
        let first = h.service.open_session(UserId::new(1), DM).await.unwrap();
        assert!(matches!(
            next_frame(&first).await,
            ServerFrame::ConnectionEstablished { user_id, .. } if user_id == UserId::new(1)
        ));

        let second = h.service.open_session(UserId::new(2), DM).await.unwrap();
        assert!(matches!(next_frame(&second).await, ServerFrame::ConnectionEstablished { .. }));
        assert!(matches!(
            next_frame(&second).await,
            ServerFrame::Presence { user_id, online: true, seq: 0, .. } if user_id == UserId::new(1)
        ));

        // 先接入的一方收到对方上线
        assert!(matches!(
            next_frame(&first).await,
            ServerFrame::Presence { user_id, online: true, .. } if user_id == UserId::new(2)
        ));
        assert!(second.outbound().is_empty());
    }

    #[tokio::test]
    async fn denied_attach_records_nothing() {
        let h = harness().await;
        let err = h
            .service
            .open_session(UserId::new(3), DM)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Authorization {
                reason: DenyReason::NotParticipant
            }
        ));
        assert!(!h.service.is_online(UserId::new(3)));
    }

    #[tokio::test]
    async fn socket_cap_denies_with_too_many_connections() {
        let h = harness_with(|mut deps| {
            deps.realtime.max_sockets_per_user = 1;
            deps
        })
        .await;
        let channel = Channel::UserChannel(UserId::new(1));
        h.service.open_session(UserId::new(1), channel).await.unwrap();
        let err = h
            .service
            .open_session(UserId::new(1), channel)
            .await
            .unwrap_err();
        assert_eq!(err.client_detail(), "too_many_connections");
        assert_eq!(h.service.socket_count(UserId::new(1)), 1);
    }

    #[tokio::test]
    async fn user_channel_is_receive_only() {
        let h = harness().await;
        let socket = h
            .service
            .open_session(UserId::new(1), Channel::UserChannel(UserId::new(1)))
            .await
            .unwrap();
        next_frame(&socket).await;

        h.service
            .handle_text(&socket, r#"{"type":"message","text":"hi"}"#)
            .await;
        assert!(matches!(next_frame(&socket).await, ServerFrame::Error { .. }));

        h.service.handle_text(&socket, r#"{"type":"ping"}"#).await;
        assert!(matches!(next_frame(&socket).await, ServerFrame::Pong { .. }));
        assert!(h.store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_answers_error_and_keeps_socket() {
        let h = harness().await;
        let socket = h.service.open_session(UserId::new(1), DM).await.unwrap();
        next_frame(&socket).await;

        h.service.handle_text(&socket, "{not json").await;
        match next_frame(&socket).await {
            ServerFrame::Error { detail, .. } => assert!(detail.starts_with("invalid frame")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.service.is_online(UserId::new(1)));
    }

    #[tokio::test]
    async fn persistence_failure_broadcasts_nothing() {
        let h = harness_with(|mut deps| {
            let mut messages = MockMessageRepository::new();
            messages
                .expect_persist_message()
                .returning(|_, _, _| Err(RepositoryError::storage("disk full")));
            deps.message_repository = Arc::new(messages);
            deps
        })
        .await;
        let sender = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let other = h.service.open_session(UserId::new(2), DM).await.unwrap();
        next_frame(&sender).await;
        next_frame(&sender).await;
        next_frame(&other).await;
        next_frame(&other).await;

        let err = h.service.post_message(&sender, "hello").await.unwrap_err();
        assert!(matches!(err, ApplicationError::Persistence { .. }));

        h.service
            .handle_text(&sender, r#"{"type":"message","text":"hello"}"#)
            .await;
        match next_frame(&sender).await {
            ServerFrame::Error { detail, .. } => assert_eq!(detail, "message could not be saved"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(other.outbound().is_empty());
    }

    #[tokio::test]
    async fn dm_message_notifies_counterpart_user_channel() {
        let h = harness().await;
        let sender = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let inbox = h
            .service
            .open_session(UserId::new(2), Channel::UserChannel(UserId::new(2)))
            .await
            .unwrap();
        next_frame(&sender).await;
        next_frame(&inbox).await;

        let report = h.service.post_message(&sender, "  hey  ").await.unwrap();
        assert!(report.delivered.contains(&UserId::new(1)));

        match next_frame(&sender).await {
            ServerFrame::Message { message, .. } => assert_eq!(message.text, "hey"),
            other => panic!("unexpected {other:?}"),
        }
        match next_frame(&inbox).await {
            ServerFrame::Notification {
                notification_type,
                data,
                ..
            } => {
                assert_eq!(notification_type, DM_MESSAGE_NOTIFICATION);
                assert_eq!(data["thread_id"], 1);
                assert_eq!(data["message"]["text"], "hey");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn mark_read_only_on_direct_threads() {
        let h = harness().await;
        let place = Channel::PlaceRoom(PlaceId::new(4));
        h.store
            .record_checkin(UserId::new(1), PlaceId::new(4), h.clock.now())
            .await;
        let in_room = h.service.open_session(UserId::new(1), place).await.unwrap();
        next_frame(&in_room).await;
        h.service.handle_text(&in_room, r#"{"type":"mark_read"}"#).await;
        assert!(matches!(next_frame(&in_room).await, ServerFrame::Error { .. }));

        let reader = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let peer = h.service.open_session(UserId::new(2), DM).await.unwrap();
        next_frame(&peer).await;
        next_frame(&peer).await;
        next_frame(&reader).await;
        assert!(matches!(
            next_frame(&reader).await,
            ServerFrame::Presence { online: true, .. }
        ));

        h.service.handle_text(&reader, r#"{"type":"mark_read"}"#).await;
        assert!(matches!(
            next_frame(&peer).await,
            ServerFrame::ReadReceipt { user_id, .. } if user_id == UserId::new(1)
        ));
        assert_eq!(h.store.last_read(DM, UserId::new(1)).await, Some(h.clock.now()));
        assert!(reader.outbound().is_empty());
    }

    #[tokio::test]
    async fn reactions_are_validated_and_echoed() {
        let h = harness().await;
        let socket = h.service.open_session(UserId::new(1), DM).await.unwrap();
        next_frame(&socket).await;

        h.service
            .handle_text(&socket, r#"{"type":"reaction","message_id":5,"reaction":"  "}"#)
            .await;
        assert!(matches!(next_frame(&socket).await, ServerFrame::Error { .. }));

        h.service
            .handle_text(&socket, r#"{"type":"reaction","message_id":5,"reaction":"🔥"}"#)
            .await;
        match next_frame(&socket).await {
            ServerFrame::Reaction {
                message_id,
                reaction,
                ..
            } => {
                assert_eq!(message_id.as_str(), "5");
                assert_eq!(reaction, "🔥");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_clears_typing_and_announces_offline() {
        let h = harness().await;
        let typist = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let watcher = h.service.open_session(UserId::new(2), DM).await.unwrap();
        next_frame(&watcher).await;
        next_frame(&watcher).await;

        h.service
            .handle_text(&typist, r#"{"type":"typing","typing":true}"#)
            .await;
        assert!(matches!(
            next_frame(&watcher).await,
            ServerFrame::Typing { typing: true, .. }
        ));

        h.service.close_session(typist.id()).await;
        h.service.close_session(typist.id()).await;

        assert!(matches!(
            next_frame(&watcher).await,
            ServerFrame::Typing { typing: false, .. }
        ));
        assert!(matches!(
            next_frame(&watcher).await,
            ServerFrame::Presence { online: false, last_active_at: Some(_), .. }
        ));
        assert!(watcher.outbound().is_empty());
        assert_eq!(h.store.last_active(UserId::new(1)).await, Some(h.clock.now()));
        assert!(typist.outbound().is_closed());
    }

    #[tokio::test]
    async fn heartbeat_tick_evicts_and_announces() {
        let h = harness().await;
        let quiet = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let active = h.service.open_session(UserId::new(2), DM).await.unwrap();
        next_frame(&active).await;
        next_frame(&active).await;

        h.clock.advance(chrono::Duration::seconds(45));
        h.service.record_pong(&active);
        h.clock.advance(chrono::Duration::seconds(20));

        assert_eq!(h.service.heartbeat_tick().await, 1);
        assert!(quiet.outbound().is_closed());
        assert!(!h.service.is_online(UserId::new(1)));
        assert!(matches!(
            next_frame(&active).await,
            ServerFrame::Presence { online: false, .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_sessions_terminates_every_socket() {
        let h = harness().await;
        let a = h.service.open_session(UserId::new(1), DM).await.unwrap();
        let b = h
            .service
            .open_session(UserId::new(2), Channel::UserChannel(UserId::new(2)))
            .await
            .unwrap();

        assert_eq!(h.service.shutdown_sessions(), 2);
        for socket in [&a, &b] {
            assert!(socket.outbound().is_closed());
            let mut last = None;
            while let Some(item) = socket.outbound().recv().await {
                last = Some(item);
            }
            assert!(matches!(
                last,
                Some(Outbound::Close { code: GOING_AWAY_CLOSE_CODE, .. })
            ));
        }
    }

    /// 写入最后活跃时间时挂起，直到测试放行
    #[derive(Default)]
    struct GatedPresence {
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl PresenceRepository for GatedPresence {
        async fn record_last_active(
            &self,
            _user_id: UserId,
            _at: Timestamp,
        ) -> Result<(), RepositoryError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn sequenced(frame: &ServerFrame) -> Option<u64> {
        match frame {
            ServerFrame::Message { seq, .. }
            | ServerFrame::Presence { seq, .. }
            | ServerFrame::Typing { seq, .. } => Some(*seq).filter(|seq| *seq > 0),
            _ => None,
        }
    }

    #[tokio::test]
    async fn channel_reopened_during_detach_keeps_its_sequence() {
        let gate = Arc::new(GatedPresence::default());
        let presence: Arc<dyn PresenceRepository> = gate.clone();
        let h = harness_with(move |mut deps| {
            deps.presence_repository = presence;
            deps
        })
        .await;

        let alice = h.service.open_session(UserId::new(1), DM).await.unwrap();
        h.service.post_message(&alice, "a1").await.unwrap();
        h.service.post_message(&alice, "a2").await.unwrap();

        // Alice 的断开停在持久化上时，Bob 接入同一会话并发言
        let ((), bob) = tokio::join!(h.service.close_session(alice.id()), async {
            gate.entered.notified().await;
            let bob = h.service.open_session(UserId::new(2), DM).await.unwrap();
            h.service.post_message(&bob, "b1").await.unwrap();
            gate.release.notify_one();
            bob
        });
        h.service.post_message(&bob, "b2").await.unwrap();

        let mut seqs = Vec::new();
        while !bob.outbound().is_empty() {
            if let Some(seq) = sequenced(&next_frame(&bob).await) {
                seqs.push(seq);
            }
        }
        assert_eq!(seqs.len(), 3, "offline, b1, b2: {seqs:?}");
        assert!(
            seqs.windows(2).all(|pair| pair[0] < pair[1]),
            "seq went backwards: {seqs:?}"
        );
        assert!(seqs[0] > 2);
    }

    #[tokio::test]
    async fn offline_recipients_leave_no_sequence_state() {
        let h = harness().await;
        let sender = h.service.open_session(UserId::new(1), DM).await.unwrap();
        for i in 0..3 {
            h.service.post_message(&sender, format!("m{i}")).await.unwrap();
        }
        let report = h
            .service
            .notify_user(UserId::new(9), "welcome", json!({}))
            .await;
        assert!(report.delivered.is_empty() && report.failed.is_empty());
        assert_eq!(h.service.sequencer.purge_idle(&h.service.registry), 0);

        // 与断开竞争时留下的计数器由清理任务回收
        h.service.sequencer.next(Channel::UserChannel(UserId::new(5)));
        h.service.sweep().await;
        assert_eq!(h.service.sequencer.purge_idle(&h.service.registry), 0);
        assert!(h.service.is_online(UserId::new(1)));
    }

    #[tokio::test]
    async fn notify_users_reaches_every_connected_inbox_once() {
        let h = harness().await;
        let mut inboxes = Vec::new();
        for user in [2, 3] {
            let inbox = h
                .service
                .open_session(UserId::new(user), Channel::UserChannel(UserId::new(user)))
                .await
                .unwrap();
            next_frame(&inbox).await;
            inboxes.push(inbox);
        }

        let report = h
            .service
            .notify_users(
                [2, 3, 4, 2].map(UserId::new),
                "place_update",
                json!({ "place_id": 7 }),
            )
            .await;
        assert_eq!(report.delivered, HashSet::from([UserId::new(2), UserId::new(3)]));
        assert!(report.is_complete());

        for inbox in &inboxes {
            match next_frame(inbox).await {
                ServerFrame::Notification {
                    notification_type,
                    data,
                    ..
                } => {
                    assert_eq!(notification_type, "place_update");
                    assert_eq!(data["place_id"], 7);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(inbox.outbound().is_empty());
        }
    }
}
