//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 频道接入、在线状态查询与健康检查，
//! 把连接上的帧交给应用层的 `RealtimeService` 处理。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
