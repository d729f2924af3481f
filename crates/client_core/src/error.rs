use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use shared::{domain::ConversationId, error::PlatformError, now_ms};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::ClientEvent;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote call failed: {0}")]
    Remote(#[from] PlatformError),
    #[error("version conflict on {unique_id} persisted after retry")]
    VersionConflict { unique_id: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conversation {0} has no recipients")]
    NoRecipients(ConversationId),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("{0} already in progress")]
    InProgress(&'static str),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(err) if err.is_transient())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// User-facing operations whose failures are surfaced as dismissible notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Send,
    Update,
    Edit,
    Delete,
    React,
    MarkAsRead,
    CreateConversation,
    UpdateConversation,
    ArchiveConversation,
    RestoreConversation,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Send => "send",
            Self::Update => "update",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::React => "react",
            Self::MarkAsRead => "mark as read",
            Self::CreateConversation => "create conversation",
            Self::UpdateConversation => "update conversation",
            Self::ArchiveConversation => "archive conversation",
            Self::RestoreConversation => "restore conversation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub id: u64,
    pub operation: Operation,
    pub message: String,
    pub at: i64,
}

/// Holds failures until the user dismisses them.
pub struct FailureCenter {
    next_id: AtomicU64,
    failures: Mutex<Vec<OperationFailure>>,
    events: broadcast::Sender<ClientEvent>,
}

impl FailureCenter {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            failures: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn report(&self, operation: Operation, message: impl Into<String>) -> OperationFailure {
        let failure = OperationFailure {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            operation,
            message: message.into(),
            at: now_ms(),
        };
        warn!(
            failure_id = failure.id,
            operation = %operation,
            "sync: operation failed: {}",
            failure.message
        );
        self.failures.lock().push(failure.clone());
        let _ = self.events.send(ClientEvent::OperationFailed(failure.clone()));
        failure
    }

    /// Records the error and hands it back for propagation.
    pub fn surface(&self, operation: Operation, err: SyncError) -> SyncError {
        self.report(operation, err.to_string());
        err
    }

    pub fn active(&self) -> Vec<OperationFailure> {
        self.failures.lock().clone()
    }

    pub fn dismiss(&self, id: u64) -> bool {
        let mut failures = self.failures.lock();
        let before = failures.len();
        failures.retain(|failure| failure.id != id);
        failures.len() != before
    }

    pub fn clear(&self) {
        self.failures.lock().clear();
    }
}
