use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    VersionConflict,
    RateLimited,
    Internal,
}

/// Error body as returned by the drive platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("version tag mismatch for file {file_id}")]
    VersionConflict { file_id: FileId },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{code:?}: {message}")]
    Api { code: ErrorCode, message: String },
}

impl PlatformError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::Api {
                    code: ErrorCode::VersionConflict,
                    ..
                }
        )
    }

    /// Network and 5xx-class failures; the caller may try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Api {
                    code: ErrorCode::Internal | ErrorCode::RateLimited,
                    ..
                }
        )
    }
}

impl From<ApiError> for PlatformError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::NotFound => Self::NotFound(value.message),
            code => Self::Api {
                code,
                message: value.message,
            },
        }
    }
}
