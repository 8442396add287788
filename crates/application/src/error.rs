use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::authorizer::DenyReason;
use crate::outbound::QueueError;
use crate::rate_limiter::RateLimitError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("authorization denied: {reason}")]
    Authorization { reason: DenyReason },
    #[error("validation failed: {detail}")]
    Validation { detail: String },
    #[error("{0}")]
    RateLimited(#[from] RateLimitError),
    #[error("persistence failed: {message}")]
    Persistence { message: String },
    #[error("outbound queue error: {0}")]
    Outbound(#[from] QueueError),
}

impl ApplicationError {
    pub fn authorization(reason: DenyReason) -> Self {
        ApplicationError::Authorization { reason }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        ApplicationError::Validation {
            detail: detail.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        ApplicationError::Persistence {
            message: message.into(),
        }
    }

    /// 发送给出错连接的 `error` 帧内容，不暴露存储细节
    pub fn client_detail(&self) -> String {
        match self {
            ApplicationError::Domain(err) => err.to_string(),
            ApplicationError::Validation { detail } => detail.clone(),
            ApplicationError::RateLimited(err) => format!("rate_limited: {err}"),
            ApplicationError::Authorization { reason } => reason.as_str().to_string(),
            ApplicationError::Persistence { .. } => "message could not be saved".to_string(),
            ApplicationError::Repository(_) | ApplicationError::Outbound(_) => {
                "internal error".to_string()
            }
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
