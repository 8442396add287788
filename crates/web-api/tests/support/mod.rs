use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{Clock, InMemoryStore, RealtimeService, RealtimeServiceDependencies, SystemClock};
use config::{JwtConfig, RateLimitConfig, RealtimeConfig};
use domain::{ServerFrame, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtService};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 在临时端口上运行的完整服务，存储使用内存实现
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<InMemoryStore>,
    pub jwt: Arc<JwtService>,
    pub realtime: Arc<RealtimeService>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let realtime = Arc::new(RealtimeService::new(RealtimeServiceDependencies::in_memory(
            store.clone(),
            clock,
            RealtimeConfig::default(),
            RateLimitConfig::default(),
        )));
        let jwt = Arc::new(JwtService::new(JwtConfig::default()));
        let app = router(AppState::new(realtime.clone(), jwt.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            store,
            jwt,
            realtime,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn token(&self, user: UserId) -> String {
        self.jwt.generate_token(user).expect("token")
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect_raw(&self, path: &str, token: Option<&str>) -> WsStream {
        let url = match token {
            Some(token) => format!("ws://{}{}?token={}", self.addr, path, token),
            None => format!("ws://{}{}", self.addr, path),
        };
        let (ws, _) = connect_async(url).await.expect("ws connect");
        ws
    }

    /// 以指定用户接入，并确认收到 connection_established
    pub async fn connect(&self, path: &str, user: UserId) -> WsStream {
        let token = self.token(user);
        let mut ws = self.connect_raw(path, Some(&token)).await;
        match next_frame(&mut ws).await {
            ServerFrame::ConnectionEstablished { user_id, .. } => assert_eq!(user_id, user),
            other => panic!("expected connection_established, got {other:?}"),
        }
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(TungsteniteMessage::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// 读取下一条应用帧，跳过协议层的 ping/pong
pub async fn next_frame(ws: &mut WsStream) -> ServerFrame {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("ws message");
        match message {
            TungsteniteMessage::Text(payload) => {
                return serde_json::from_str(payload.as_str()).expect("server frame json")
            }
            TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// 读取到第一个满足条件的帧为止
pub async fn frame_matching(ws: &mut WsStream, predicate: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
    loop {
        let frame = next_frame(ws).await;
        if predicate(&frame) {
            return frame;
        }
    }
}

/// 等待服务端关闭帧，返回关闭码与原因
pub async fn expect_close(ws: &mut WsStream) -> (u16, String) {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("close within timeout")
            .expect("stream open")
            .expect("ws message");
        match message {
            TungsteniteMessage::Close(Some(frame)) => {
                return (u16::from(frame.code), frame.reason.as_str().to_owned())
            }
            TungsteniteMessage::Close(None) => panic!("close frame without status"),
            TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }
}
