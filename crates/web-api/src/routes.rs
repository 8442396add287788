use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use domain::{Channel, PlaceId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct PresenceResponse {
    user_id: UserId,
    online: bool,
    connections: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/presence/{user_id}", get(get_presence))
        .route("/ws/dms/{thread_id}", get(dm_socket))
        .route("/ws/users/{user_id}", get(user_socket))
        .route("/ws/places/{place_id}", get(place_socket))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<PresenceResponse>, ApiError> {
    state.jwt_service.extract_user_from_headers(&headers)?;

    let user_id = UserId::new(user_id);
    Ok(Json(PresenceResponse {
        user_id,
        online: state.realtime.is_online(user_id),
        connections: state.realtime.socket_count(user_id),
    }))
}

async fn dm_socket(
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, Channel::DirectThread(ThreadId::new(thread_id)), query)
}

async fn user_socket(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, Channel::UserChannel(UserId::new(user_id)), query)
}

async fn place_socket(
    State(state): State<AppState>,
    Path(place_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, Channel::PlaceRoom(PlaceId::new(place_id)), query)
}

/// 令牌与频道授权都在升级之后校验，拒绝时以关闭帧告知原因
fn upgrade(ws: WebSocketUpgrade, state: AppState, channel: Channel, query: WsQuery) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Some(connection) =
            WebSocketConnection::accept(socket, state, channel, query.token).await
        {
            connection.run().await;
        }
    })
}
