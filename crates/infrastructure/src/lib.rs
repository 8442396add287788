//! 基础设施层实现。
//!
//! 提供 Postgres 存储适配器与迁移，并根据配置在 Postgres 与内存存储之间选择后端。

pub mod builder;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError, StorageBackend};
pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgStorage};
