//! 实体定义

pub mod websocket;

pub use websocket::{ClientFrame, ServerFrame};
