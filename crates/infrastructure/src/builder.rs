use std::sync::Arc;

use application::{Clock, InMemoryStore, RealtimeServiceDependencies, SystemClock};
use config::AppConfig;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// 存储后端：配置了数据库地址时使用 Postgres，否则退回进程内存储
#[derive(Clone)]
pub enum StorageBackend {
    Postgres(Arc<PgStorage>),
    Memory(Arc<InMemoryStore>),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub storage: StorageBackend,
    pub clock: Arc<dyn Clock>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let storage = match config.database.url.as_deref() {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, config.database.max_connections).await?;
                MIGRATOR.run(&pool).await?;
                info!(max_connections = config.database.max_connections, "Postgres 存储已就绪");
                StorageBackend::Postgres(Arc::new(PgStorage::new(pool)))
            }
            None => {
                warn!("未配置数据库地址，使用内存存储（重启后数据丢失）");
                StorageBackend::Memory(Arc::new(InMemoryStore::new(clock.clone())))
            }
        };

        Ok(Self { storage, clock })
    }

    /// 不连接数据库的内存版本，供测试和本地调试使用
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: StorageBackend::Memory(Arc::new(InMemoryStore::new(clock.clone()))),
            clock,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.storage {
            StorageBackend::Postgres(_) => "postgres",
            StorageBackend::Memory(_) => "memory",
        }
    }

    pub fn realtime_dependencies(&self, config: &AppConfig) -> RealtimeServiceDependencies {
        let realtime = config.realtime.clone();
        let rate_limits = config.rate_limits.clone();
        match &self.storage {
            StorageBackend::Postgres(storage) => RealtimeServiceDependencies {
                thread_repository: storage.clone(),
                block_repository: storage.clone(),
                checkin_repository: storage.clone(),
                message_repository: storage.clone(),
                read_state_repository: storage.clone(),
                presence_repository: storage.clone(),
                clock: self.clock.clone(),
                realtime,
                rate_limits,
            },
            StorageBackend::Memory(store) => RealtimeServiceDependencies::in_memory(
                store.clone(),
                self.clock.clone(),
                realtime,
                rate_limits,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_memory_without_database_url() {
        let config = AppConfig::default();
        assert!(config.database.url.is_none());

        let infrastructure = Infrastructure::connect(&config).await.unwrap();
        assert_eq!(infrastructure.backend_name(), "memory");

        let deps = infrastructure.realtime_dependencies(&config);
        assert_eq!(deps.realtime.max_sockets_per_user, config.realtime.max_sockets_per_user);
    }
}
