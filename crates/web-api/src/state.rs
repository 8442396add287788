use std::sync::Arc;

use application::RealtimeService;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub realtime: Arc<RealtimeService>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(realtime: Arc<RealtimeService>, jwt_service: Arc<JwtService>) -> Self {
        Self {
            realtime,
            jwt_service,
        }
    }
}
