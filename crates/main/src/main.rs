//! 主应用程序入口
//!
//! 加载配置、选择存储后端，启动后台清理任务与 Axum Web API 服务。

use std::{net::SocketAddr, sync::Arc};

use application::RealtimeService;
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;

    let infrastructure = Infrastructure::connect(&config).await?;
    tracing::info!(backend = infrastructure.backend_name(), "存储后端已初始化");

    let realtime = Arc::new(RealtimeService::new(
        infrastructure.realtime_dependencies(&config),
    ));
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    // 输入状态清理、限流桶回收与心跳
    let shutdown = CancellationToken::new();
    let background = realtime.spawn_background(shutdown.clone());

    let app = router(AppState::new(realtime.clone(), jwt_service));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("实时服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let closed = realtime.shutdown_sessions();
    tracing::info!(closed, "已关闭全部连接");
    for task in background {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "后台任务退出异常");
        }
    }
    tracing::info!("服务已停止");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "监听 ctrl-c 失败");
            }
            tracing::info!("收到退出信号，开始关闭");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
