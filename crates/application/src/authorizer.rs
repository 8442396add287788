//! 频道接入授权
//!
//! 在连接进入注册表之前调用，只查询协作方，不产生副作用。

use std::fmt;
use std::sync::Arc;

use domain::{Channel, PlaceId, ThreadId, UserId};
use tracing::debug;

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::repository::{BlockRepository, CheckinRepository, ThreadRepository};

/// 拒绝原因，同时作为 WebSocket close reason 发给客户端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotParticipant,
    ThreadNotAccepted,
    Blocked,
    IdentityMismatch,
    NoRecentCheckin,
    TooManyConnections,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NotParticipant => "not_participant",
            DenyReason::ThreadNotAccepted => "thread_not_accepted",
            DenyReason::Blocked => "blocked",
            DenyReason::IdentityMismatch => "identity_mismatch",
            DenyReason::NoRecentCheckin => "no_recent_checkin",
            DenyReason::TooManyConnections => "too_many_connections",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny(DenyReason),
}

pub struct ThreadAuthorizer {
    threads: Arc<dyn ThreadRepository>,
    blocks: Arc<dyn BlockRepository>,
    checkins: Arc<dyn CheckinRepository>,
    clock: Arc<dyn Clock>,
    place_window: chrono::Duration,
}

impl ThreadAuthorizer {
    pub fn new(
        threads: Arc<dyn ThreadRepository>,
        blocks: Arc<dyn BlockRepository>,
        checkins: Arc<dyn CheckinRepository>,
        clock: Arc<dyn Clock>,
        place_window: chrono::Duration,
    ) -> Self {
        Self {
            threads,
            blocks,
            checkins,
            clock,
            place_window,
        }
    }

    pub async fn authorize(
        &self,
        user_id: UserId,
        channel: Channel,
    ) -> Result<Authorization, ApplicationError> {
        let decision = match channel {
            Channel::DirectThread(thread_id) => self.authorize_thread(user_id, thread_id).await?,
            Channel::UserChannel(owner) if owner == user_id => Authorization::Allow,
            Channel::UserChannel(_) => Authorization::Deny(DenyReason::IdentityMismatch),
            Channel::PlaceRoom(place_id) => self.authorize_place(user_id, place_id).await?,
        };
        debug!(user_id = %user_id, channel = %channel, decision = ?decision, "频道授权");
        Ok(decision)
    }

    async fn authorize_thread(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> Result<Authorization, ApplicationError> {
        let Some(thread) = self.threads.find_thread(thread_id).await? else {
            return Ok(Authorization::Deny(DenyReason::NotParticipant));
        };
        let Some(counterpart) = thread.counterpart(user_id) else {
            return Ok(Authorization::Deny(DenyReason::NotParticipant));
        };
        if !thread.is_accepted() {
            return Ok(Authorization::Deny(DenyReason::ThreadNotAccepted));
        }
        if self.blocks.has_block(user_id, counterpart).await? {
            return Ok(Authorization::Deny(DenyReason::Blocked));
        }
        Ok(Authorization::Allow)
    }

    async fn authorize_place(
        &self,
        user_id: UserId,
        place_id: PlaceId,
    ) -> Result<Authorization, ApplicationError> {
        let since = self.clock.now() - self.place_window;
        if self
            .checkins
            .has_recent_checkin(user_id, place_id, since)
            .await?
        {
            Ok(Authorization::Allow)
        } else {
            Ok(Authorization::Deny(DenyReason::NoRecentCheckin))
        }
    }
}
