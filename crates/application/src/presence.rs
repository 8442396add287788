//! 在线状态
//!
//! 由注册表的 0->1 / 1->0 转换驱动；不做防抖，每次转换立即产生事件。
//! 最后活跃时间只在 1->0 时写入外部存储。

use std::sync::Arc;

use domain::{EventPayload, UserId};
use tracing::{error, info};

use crate::clock::Clock;
use crate::registry::{AttachOutcome, DetachOutcome};
use crate::repository::PresenceRepository;

pub struct PresenceTracker {
    store: Arc<dyn PresenceRepository>,
    clock: Arc<dyn Clock>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn on_attach(&self, outcome: &AttachOutcome) -> Option<EventPayload> {
        if !outcome.came_online {
            return None;
        }
        let user_id = outcome.handle.user_id();
        info!(user_id = %user_id, "用户上线");
        Some(EventPayload::online(user_id))
    }

    /// 用户最后一个连接断开时持久化最后活跃时间；写入失败只记录日志，下线事件照常发出
    pub async fn on_detach(&self, outcome: &DetachOutcome) -> Option<EventPayload> {
        if !outcome.went_offline {
            return None;
        }
        let user_id: UserId = outcome.handle.as_ref()?.user_id();
        let now = self.clock.now();

        if let Err(err) = self.store.record_last_active(user_id, now).await {
            error!(user_id = %user_id, error = %err, "记录最后活跃时间失败");
        }
        info!(user_id = %user_id, "用户下线");
        Some(EventPayload::offline(user_id, now))
    }
}
