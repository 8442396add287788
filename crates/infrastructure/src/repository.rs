use std::collections::HashSet;

use application::repository::{
    BlockRepository, CheckinRepository, MessageRepository, PresenceRepository,
    ReadStateRepository, ThreadRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Channel, DirectThread, MessageId, MessageRecord, MessageText, PlaceId, RepositoryError,
    ThreadId, ThreadStatus, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        other => RepositoryError::storage(other.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct ThreadRow {
    id: i64,
    user_a_id: i64,
    user_b_id: i64,
    status: String,
}

impl TryFrom<ThreadRow> for DirectThread {
    type Error = RepositoryError;

    fn try_from(value: ThreadRow) -> Result<Self, Self::Error> {
        let status = value
            .status
            .parse::<ThreadStatus>()
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(DirectThread::new(
            ThreadId::new(value.id),
            UserId::new(value.user_a_id),
            UserId::new(value.user_b_id),
            status,
        ))
    }
}

#[derive(Debug, FromRow)]
struct DmMessageRow {
    id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PlaceMessageRow {
    id: String,
    created_at: DateTime<Utc>,
}

/// Postgres 存储，实现实时层全部协作方接口
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ThreadRepository for PgStorage {
    async fn find_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<DirectThread>, RepositoryError> {
        let row = sqlx::query_as::<_, ThreadRow>(
            r#"
            SELECT id, user_a_id, user_b_id, status
            FROM dm_threads
            WHERE id = $1
            "#,
        )
        .bind(thread_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(DirectThread::try_from).transpose()
    }

    async fn list_participants(
        &self,
        channel: Channel,
    ) -> Result<HashSet<UserId>, RepositoryError> {
        match channel {
            Channel::DirectThread(thread_id) => Ok(self
                .find_thread(thread_id)
                .await?
                .map(|thread| thread.participants().into_iter().collect())
                .unwrap_or_default()),
            Channel::UserChannel(user_id) => Ok(HashSet::from([user_id])),
            Channel::PlaceRoom(place_id) => {
                let ids: Vec<i64> = sqlx::query_scalar(
                    r#"
                    SELECT DISTINCT user_id
                    FROM check_ins
                    WHERE place_id = $1 AND (expires_at IS NULL OR expires_at > NOW())
                    "#,
                )
                .bind(place_id.get())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                Ok(ids.into_iter().map(UserId::new).collect())
            }
        }
    }
}

#[async_trait]
impl BlockRepository for PgStorage {
    async fn has_block(&self, user_a: UserId, user_b: UserId) -> Result<bool, RepositoryError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM dm_participant_states s
                JOIN dm_threads t ON t.id = s.thread_id
                WHERE s.blocked = TRUE
                  AND ((t.user_a_id = $1 AND t.user_b_id = $2)
                    OR (t.user_a_id = $2 AND t.user_b_id = $1))
            )
            "#,
        )
        .bind(user_a.get())
        .bind(user_b.get())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

#[async_trait]
impl CheckinRepository for PgStorage {
    async fn has_recent_checkin(
        &self,
        user_id: UserId,
        place_id: PlaceId,
        since: Timestamp,
    ) -> Result<bool, RepositoryError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM check_ins
                WHERE user_id = $1 AND place_id = $2 AND created_at >= $3
            )
            "#,
        )
        .bind(user_id.get())
        .bind(place_id.get())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

#[async_trait]
impl MessageRepository for PgStorage {
    async fn persist_message(
        &self,
        channel: Channel,
        sender_id: UserId,
        text: MessageText,
    ) -> Result<MessageRecord, RepositoryError> {
        let (id, created_at) = match channel {
            Channel::DirectThread(thread_id) => {
                let row = sqlx::query_as::<_, DmMessageRow>(
                    r#"
                    INSERT INTO dm_messages (thread_id, sender_id, text)
                    VALUES ($1, $2, $3)
                    RETURNING id, created_at
                    "#,
                )
                .bind(thread_id.get())
                .bind(sender_id.get())
                .bind(text.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                (MessageId::from(row.id), row.created_at)
            }
            Channel::PlaceRoom(place_id) => {
                let row = sqlx::query_as::<_, PlaceMessageRow>(
                    r#"
                    INSERT INTO place_chat_messages (id, place_id, user_id, text)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, created_at
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(place_id.get())
                .bind(sender_id.get())
                .bind(text.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                (MessageId::new(row.id), row.created_at)
            }
            Channel::UserChannel(_) => {
                return Err(invalid_data("user channels do not store messages"));
            }
        };

        Ok(MessageRecord {
            id,
            channel,
            sender_id,
            text: text.as_str().to_owned(),
            created_at,
        })
    }
}

#[async_trait]
impl ReadStateRepository for PgStorage {
    async fn mark_read(
        &self,
        channel: Channel,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let Channel::DirectThread(thread_id) = channel else {
            return Err(invalid_data(format!("read state is not tracked for {channel}")));
        };

        sqlx::query(
            r#"
            INSERT INTO dm_participant_states (thread_id, user_id, last_read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (thread_id, user_id)
            DO UPDATE SET last_read_at = GREATEST(
                COALESCE(dm_participant_states.last_read_at, EXCLUDED.last_read_at),
                EXCLUDED.last_read_at
            )
            "#,
        )
        .bind(thread_id.get())
        .bind(user_id.get())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl PresenceRepository for PgStorage {
    async fn record_last_active(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_presence (user_id, last_active_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET last_active_at = EXCLUDED.last_active_at
            "#,
        )
        .bind(user_id.get())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
