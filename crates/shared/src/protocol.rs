//! Request, response and record shapes of the encrypted-drive platform client.
//!
//! The platform owns durable storage, fan-out to recipients and the websocket
//! notification feed. These types mirror its contract; nothing in here knows
//! about chat semantics beyond the file-type constants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ArchivalStatus, FileId, Identity, VersionTag};

pub const CHAT_MESSAGE_FILE_TYPE: u32 = 7878;
pub const CHAT_REACTION_FILE_TYPE: u32 = 7979;
pub const CHAT_CONVERSATION_FILE_TYPE: u32 = 8888;

pub const CHAT_APP_ID: &str = "2d781401-3804-4b57-b4aa-d8e4e2ef39f4";
/// Payload key used when record content is too large for the header.
pub const CONTENT_PAYLOAD_KEY: &str = "dflt_key";
/// Prefix of attachment payload keys; the attachment index is appended.
pub const MESSAGE_PAYLOAD_KEY_PREFIX: &str = "chat_mbl";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetDrive {
    pub alias: String,
    #[serde(rename = "type")]
    pub drive_type: String,
}

impl TargetDrive {
    pub const CHAT_ALIAS: &'static str = "9ff813aff2d61e2f9b9db189e72d1a11";
    pub const CHAT_TYPE: &'static str = "66ea8355ae4155c39b5a719166b510e3";

    pub fn new(alias: impl Into<String>, drive_type: impl Into<String>) -> Self {
        Self {
            alias: alias.into().to_ascii_lowercase(),
            drive_type: drive_type.into().to_ascii_lowercase(),
        }
    }

    pub fn chat() -> Self {
        Self::new(Self::CHAT_ALIAS, Self::CHAT_TYPE)
    }

    /// Stable key used to persist per-drive sync state.
    pub fn key(&self) -> String {
        format!("{}:{}", self.alias, self.drive_type)
    }

    pub fn matches(&self, other: &TargetDrive) -> bool {
        self.alias.eq_ignore_ascii_case(&other.alias)
            && self.drive_type.eq_ignore_ascii_case(&other.drive_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    #[default]
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedThumb {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub content_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub key: String,
    pub content_type: String,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_thumbnail: Option<EmbeddedThumb>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub file_type: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_date: Option<i64>,
    /// Inline JSON content; absent when it only lives in a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub archival_status: ArchivalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_thumbnail: Option<EmbeddedThumb>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub created: i64,
    pub updated: i64,
    /// Time the file arrived through transit, when it was sent by a peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit_created: Option<i64>,
    /// Sender identity; `None` means the drive owner wrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Identity>,
    pub version_tag: VersionTag,
    #[serde(default)]
    pub is_encrypted: bool,
    pub app_data: AppData,
    #[serde(default)]
    pub payloads: Vec<PayloadDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Delivered,
    Enqueued,
    EnqueuedFailed,
    RecipientServerNotResponding,
    RecipientIdentityReturnedAccessDenied,
    RecipientIdentityReturnedServerError,
    RecipientIdentityReturnedBadRequest,
    UnknownServerError,
}

impl TransferStatus {
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Delivered | Self::Enqueued)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientTransferRecord {
    pub latest_transfer_status: TransferStatus,
    #[serde(default)]
    pub is_in_outbox: bool,
    #[serde(default)]
    pub is_read_by_recipient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_successfully_delivered_version_tag: Option<VersionTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferSummary {
    pub total_in_outbox: u32,
    pub total_failed: u32,
    pub total_delivered: u32,
    pub total_read_by_recipient: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferHistory {
    #[serde(default)]
    pub recipients: BTreeMap<Identity, RecipientTransferRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TransferSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerMetadata {
    #[serde(default)]
    pub allow_distribution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_history: Option<TransferHistory>,
}

/// Opaque encrypted key header; required by the platform for header-only patches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHeader {
    pub iv_b64: String,
    pub encrypted_aes_key_b64: String,
}

/// One file as returned by queries, lookups and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHeader {
    pub file_id: FileId,
    #[serde(default)]
    pub file_state: FileState,
    pub metadata: FileMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_metadata: Option<ServerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_header: Option<KeyHeader>,
}

impl RemoteHeader {
    pub fn file_type(&self) -> u32 {
        self.metadata.app_data.file_type
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.metadata.app_data.unique_id.as_deref()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.metadata.app_data.group_id.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.file_state == FileState::Deleted
    }

    pub fn transfer_history(&self) -> Option<&TransferHistory> {
        self.server_metadata
            .as_ref()
            .and_then(|meta| meta.transfer_history.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQueryParams {
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub file_types: Vec<u32>,
    #[serde(default)]
    pub group_ids: Vec<String>,
}

/// Inclusive creation-time window, epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub oldest: i64,
    pub newest: i64,
}

impl TimeWindow {
    pub fn contains(&self, at: i64) -> bool {
        at >= self.oldest && at <= self.newest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBatchOptions {
    pub max_records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_state: Option<String>,
    /// Restricts results to files created inside the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_window: Option<TimeWindow>,
    #[serde(default)]
    pub include_metadata_header: bool,
    #[serde(default)]
    pub include_transfer_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBatchResponse {
    pub search_results: Vec<RemoteHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_state: Option<String>,
    pub query_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryModifiedOptions {
    pub max_records: usize,
    /// Files modified at or after this time are returned.
    pub cursor: i64,
    #[serde(default)]
    pub include_header_content: bool,
    #[serde(default)]
    pub include_transfer_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryModifiedResponse {
    pub search_results: Vec<RemoteHeader>,
    pub cursor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboxResult {
    pub total_items: u32,
    pub popped_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_item_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppNotificationOptions {
    pub app_id: String,
    pub type_id: String,
    pub tag_id: String,
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitOptions {
    pub recipients: Vec<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<AppNotificationOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInstructions {
    pub drive: TargetDrive,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit: Option<TransitOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Version tag the writer last observed; required when overwriting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_tag: Option<VersionTag>,
    pub allow_distribution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Identity>,
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadUpload {
    pub key: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailUpload {
    pub key: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Immediate per-recipient outcome of a distributed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    DeliveredToInbox,
    DeliveredToTargetDrive,
    Enqueued,
    EnqueuedFailed,
    RecipientDenied,
    UnknownServerError,
}

impl TransferOutcome {
    pub fn is_inbox_delivery(self) -> bool {
        matches!(self, Self::DeliveredToInbox | Self::DeliveredToTargetDrive)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::EnqueuedFailed | Self::RecipientDenied | Self::UnknownServerError
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub file_id: FileId,
    pub new_version_tag: VersionTag,
    #[serde(default)]
    pub recipient_status: BTreeMap<Identity, TransferOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_header: Option<KeyHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResult {
    pub new_version_tag: VersionTag,
    #[serde(default)]
    pub recipient_status: BTreeMap<Identity, TransferOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadReceiptResult {
    pub acknowledged: Vec<FileId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationType {
    FileAdded,
    FileModified,
    FileDeleted,
    StatisticsChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveNotification {
    pub notification_type: NotificationType,
    pub target_drive: TargetDrive,
    pub header: RemoteHeader,
}
