use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{FileId, Identity},
    error::PlatformError,
    protocol::{
        DriveNotification, FileQueryParams, InboxResult, KeyHeader, PatchResult, PayloadUpload,
        QueryBatchOptions, QueryBatchResponse, QueryModifiedOptions, QueryModifiedResponse,
        ReadReceiptResult, RemoteHeader, TargetDrive, ThumbnailUpload, UploadInstructions,
        UploadMetadata, UploadResult,
    },
};

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Client contract of the encrypted-drive platform.
///
/// Every call is a suspension point. Implementations report a stale version
/// tag as [`PlatformError::VersionConflict`]; recovering from it is the job of
/// [`crate::conflict::patch_with_retry`], not of the implementation.
#[async_trait]
pub trait DrivePlatform: Send + Sync {
    async fn query_batch(
        &self,
        params: &FileQueryParams,
        options: &QueryBatchOptions,
    ) -> PlatformResult<QueryBatchResponse>;

    async fn query_modified(
        &self,
        params: &FileQueryParams,
        options: &QueryModifiedOptions,
    ) -> PlatformResult<QueryModifiedResponse>;

    /// Moves up to `batch_size` items from the transit backlog onto the drive.
    async fn process_inbox(&self, drive: &TargetDrive, batch_size: usize)
        -> PlatformResult<InboxResult>;

    async fn upload_file(
        &self,
        instructions: &UploadInstructions,
        metadata: &UploadMetadata,
        payloads: &[PayloadUpload],
        thumbnails: &[ThumbnailUpload],
    ) -> PlatformResult<UploadResult>;

    /// Conditional partial update of the file named by
    /// `instructions.overwrite_file_id`; `metadata.version_tag` must match.
    async fn patch_file(
        &self,
        key_header: Option<&KeyHeader>,
        instructions: &UploadInstructions,
        metadata: &UploadMetadata,
        payloads: &[PayloadUpload],
        deleted_payloads: &[String],
    ) -> PlatformResult<PatchResult>;

    async fn get_file_header(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
    ) -> PlatformResult<Option<RemoteHeader>>;

    async fn get_file_header_by_unique_id(
        &self,
        drive: &TargetDrive,
        unique_id: &str,
    ) -> PlatformResult<Option<RemoteHeader>>;

    async fn get_payload(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
        key: &str,
    ) -> PlatformResult<Option<Vec<u8>>>;

    async fn delete_file(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
        recipients: &[Identity],
    ) -> PlatformResult<()>;

    /// Returns the number of files removed.
    async fn delete_files_by_group_id(
        &self,
        drive: &TargetDrive,
        group_id: &str,
        recipients: &[Identity],
    ) -> PlatformResult<usize>;

    async fn send_read_receipt(
        &self,
        drive: &TargetDrive,
        file_ids: &[FileId],
    ) -> PlatformResult<ReadReceiptResult>;
}

/// Push feed of drive changes. The stream ends when the connection drops.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(
        &self,
        drive: &TargetDrive,
    ) -> PlatformResult<BoxStream<'static, DriveNotification>>;
}
