//! 实时层核心领域模型
//!
//! 包含频道、私信会话、消息记录、领域事件以及 WebSocket 帧定义。

pub mod channel;
pub mod entities;
pub mod errors;
pub mod events;
pub mod message;
pub mod thread;
pub mod value_objects;

// 重新导出常用类型
pub use channel::*;
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use thread::*;
pub use value_objects::*;
