use application::{ApplicationError, Outbound, SocketHandle};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use domain::Channel;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

use crate::state::AppState;

/// 策略违规（未授权、拒绝接入）
const POLICY_VIOLATION: u16 = 1008;
/// 服务端内部错误
const INTERNAL_ERROR: u16 = 1011;

/// 令牌缺失或无效时的关闭原因
pub const INVALID_TOKEN: &str = "invalid_token";

/// WebSocket 连接管理器
///
/// 一个连接对应一个已登记的 `SocketEntry`：
/// - 写半部只从该连接的出站队列取帧
/// - 读半部把文本帧交给 `RealtimeService`，Ping/Pong 刷新存活时间
/// - 任一半部结束后注销连接
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    handle: SocketHandle,
}

impl WebSocketConnection {
    /// 校验令牌并接入频道；失败时以 1008 关闭并返回 None
    pub async fn accept(
        mut socket: WebSocket,
        state: AppState,
        channel: Channel,
        token: Option<String>,
    ) -> Option<Self> {
        let user_id = match token
            .as_deref()
            .map(|token| state.jwt_service.verify_token(token))
        {
            Some(Ok(user_id)) => user_id,
            Some(Err(err)) => {
                tracing::warn!(channel = %channel, error = ?err, "WebSocket 令牌无效");
                reject(&mut socket, POLICY_VIOLATION, INVALID_TOKEN).await;
                return None;
            }
            None => {
                tracing::warn!(channel = %channel, "WebSocket 缺少令牌");
                reject(&mut socket, POLICY_VIOLATION, INVALID_TOKEN).await;
                return None;
            }
        };

        match state.realtime.open_session(user_id, channel).await {
            Ok(handle) => Some(Self {
                socket,
                state,
                handle,
            }),
            Err(ApplicationError::Authorization { reason }) => {
                reject(&mut socket, POLICY_VIOLATION, reason.as_str()).await;
                None
            }
            Err(err) => {
                tracing::error!(user_id = %user_id, channel = %channel, error = %err, "接入频道失败");
                reject(&mut socket, INTERNAL_ERROR, "internal_error").await;
                None
            }
        }
    }

    /// 运行连接主循环，直到客户端断开或服务端关闭连接
    pub async fn run(self) {
        let Self {
            socket,
            state,
            handle,
        } = self;
        let (sender, incoming) = socket.split();

        tokio::select! {
            _ = write_loop(sender, &handle) => {
                tracing::debug!(socket_id = %handle.id(), "WebSocket发送任务完成");
            }
            _ = read_loop(incoming, &state, &handle) => {
                tracing::debug!(socket_id = %handle.id(), "WebSocket接收任务完成");
            }
        }

        state.realtime.close_session(handle.id()).await;
    }
}

async fn reject(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    if let Err(err) = socket.send(WsMessage::Close(Some(frame))).await {
        tracing::debug!(error = %err, "发送关闭帧失败");
    }
}

/// 从出站队列取帧写入 socket；队列关闭后发送 close 帧并结束
async fn write_loop(mut sender: SplitSink<WebSocket, WsMessage>, handle: &SocketHandle) {
    while let Some(outbound) = handle.outbound().recv().await {
        let message = match outbound {
            Outbound::Frame(frame) => match frame.to_json() {
                Ok(json) => WsMessage::Text(json.into()),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to serialize websocket payload");
                    continue;
                }
            },
            Outbound::Ping => WsMessage::Ping(Default::default()),
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(err) = sender.send(WsMessage::Close(Some(frame))).await {
                    tracing::debug!(socket_id = %handle.id(), error = %err, "发送关闭帧失败");
                }
                break;
            }
        };

        if let Err(err) = sender.send(message).await {
            tracing::debug!(socket_id = %handle.id(), error = %err, "WebSocket 写入失败");
            break;
        }
    }
}

/// 处理来自客户端的消息
async fn read_loop(mut incoming: SplitStream<WebSocket>, state: &AppState, handle: &SocketHandle) {
    while let Some(message) = incoming.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(socket_id = %handle.id(), error = %err, "WebSocket 读取失败");
                break;
            }
        };

        match message {
            WsMessage::Text(text) => state.realtime.handle_text(handle, text.as_str()).await,
            WsMessage::Ping(_) | WsMessage::Pong(_) => state.realtime.record_pong(handle),
            WsMessage::Close(_) => {
                tracing::debug!(socket_id = %handle.id(), "WebSocket收到关闭消息");
                break;
            }
            WsMessage::Binary(_) => {
                tracing::debug!(socket_id = %handle.id(), "忽略二进制帧");
            }
        }
    }
}
