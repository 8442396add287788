mod realtime_service;

pub use realtime_service::{
    RealtimeService, RealtimeServiceDependencies, DM_MESSAGE_NOTIFICATION, GOING_AWAY_CLOSE_CODE,
    NORMAL_CLOSE_CODE,
};
