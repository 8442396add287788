//! 领域事件定义
//!
//! 实时层中可广播的事件，由各组件产出后交给广播器扇出。

pub mod realtime_event;

// 重新导出事件类型
pub use realtime_event::*;
