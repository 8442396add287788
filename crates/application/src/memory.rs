//! 进程内协作方实现
//!
//! 未配置数据库时使用；测试中也用它预置会话、拉黑与签到数据。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    Channel, DirectThread, MessageId, MessageRecord, MessageText, PlaceId, RepositoryError,
    ThreadId, ThreadStatus, Timestamp, UserId,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::repository::{
    BlockRepository, CheckinRepository, MessageRepository, PresenceRepository,
    ReadStateRepository, ThreadRepository,
};

pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    threads: RwLock<HashMap<ThreadId, DirectThread>>,
    blocks: RwLock<HashSet<(UserId, UserId)>>,
    checkins: RwLock<HashMap<(UserId, PlaceId), Timestamp>>,
    messages: RwLock<Vec<MessageRecord>>,
    read_states: RwLock<HashMap<(Channel, UserId), Timestamp>>,
    last_active: RwLock<HashMap<UserId, Timestamp>>,
    next_message_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            threads: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashSet::new()),
            checkins: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            read_states: RwLock::new(HashMap::new()),
            last_active: RwLock::new(HashMap::new()),
            next_message_id: AtomicI64::new(1),
        }
    }

    pub async fn upsert_thread(&self, thread: DirectThread) {
        self.threads.write().await.insert(thread.id, thread);
    }

    pub async fn set_thread_status(
        &self,
        thread_id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), RepositoryError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(&thread_id)
            .ok_or(RepositoryError::NotFound)?;
        thread.status = status;
        Ok(())
    }

    pub async fn block(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().await.insert((blocker, blocked));
    }

    pub async fn unblock(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().await.remove(&(blocker, blocked));
    }

    /// 记录一次签到；同一用户同一地点只保留最近一次
    pub async fn record_checkin(&self, user_id: UserId, place_id: PlaceId, at: Timestamp) {
        let mut checkins = self.checkins.write().await;
        let latest = checkins.entry((user_id, place_id)).or_insert(at);
        if at > *latest {
            *latest = at;
        }
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.messages.read().await.clone()
    }

    pub async fn last_read(&self, channel: Channel, user_id: UserId) -> Option<Timestamp> {
        self.read_states.read().await.get(&(channel, user_id)).copied()
    }

    pub async fn last_active(&self, user_id: UserId) -> Option<Timestamp> {
        self.last_active.read().await.get(&user_id).copied()
    }
}

#[async_trait]
impl ThreadRepository for InMemoryStore {
    async fn find_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<DirectThread>, RepositoryError> {
        Ok(self.threads.read().await.get(&thread_id).cloned())
    }

    async fn list_participants(&self, channel: Channel) -> Result<HashSet<UserId>, RepositoryError> {
        match channel {
            Channel::DirectThread(thread_id) => Ok(self
                .threads
                .read()
                .await
                .get(&thread_id)
                .map(|thread| thread.participants().into_iter().collect())
                .unwrap_or_default()),
            Channel::UserChannel(user_id) => Ok(HashSet::from([user_id])),
            Channel::PlaceRoom(place_id) => Ok(self
                .checkins
                .read()
                .await
                .keys()
                .filter(|(_, place)| *place == place_id)
                .map(|(user, _)| *user)
                .collect()),
        }
    }
}

#[async_trait]
impl BlockRepository for InMemoryStore {
    async fn has_block(&self, user_a: UserId, user_b: UserId) -> Result<bool, RepositoryError> {
        let blocks = self.blocks.read().await;
        Ok(blocks.contains(&(user_a, user_b)) || blocks.contains(&(user_b, user_a)))
    }
}

#[async_trait]
impl CheckinRepository for InMemoryStore {
    async fn has_recent_checkin(
        &self,
        user_id: UserId,
        place_id: PlaceId,
        since: Timestamp,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .checkins
            .read()
            .await
            .get(&(user_id, place_id))
            .is_some_and(|at| *at >= since))
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn persist_message(
        &self,
        channel: Channel,
        sender_id: UserId,
        text: MessageText,
    ) -> Result<MessageRecord, RepositoryError> {
        let id = match channel {
            Channel::DirectThread(_) => {
                MessageId::from(self.next_message_id.fetch_add(1, Ordering::SeqCst))
            }
            Channel::PlaceRoom(_) => MessageId::from(Uuid::new_v4()),
            Channel::UserChannel(_) => {
                return Err(RepositoryError::storage(
                    "user channels do not store messages",
                ))
            }
        };

        let record = MessageRecord {
            id,
            channel,
            sender_id,
            text: text.as_str().to_owned(),
            created_at: self.clock.now(),
        };
        self.messages.write().await.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl ReadStateRepository for InMemoryStore {
    async fn mark_read(
        &self,
        channel: Channel,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.read_states.write().await.insert((channel, user_id), at);
        Ok(())
    }
}

#[async_trait]
impl PresenceRepository for InMemoryStore {
    async fn record_last_active(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.last_active.write().await.insert(user_id, at);
        Ok(())
    }
}
