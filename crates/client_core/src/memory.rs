//! In-process implementation of the drive platform.
//!
//! Keeps files, version tags, transfer history and the transit backlog in
//! memory and fans changes out on a notification feed. Failures, version
//! conflicts and per-recipient transfer outcomes can be injected, and every
//! call is logged so callers can assert ordering.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use shared::{
    domain::{FileId, Identity, VersionTag},
    error::PlatformError,
    now_ms,
    protocol::{
        AppData, DriveNotification, FileMetadata, FileQueryParams, FileState, InboxResult,
        KeyHeader, NotificationType, PatchResult, PayloadDescriptor, PayloadUpload,
        QueryBatchOptions, QueryBatchResponse, QueryModifiedOptions, QueryModifiedResponse,
        ReadReceiptResult, RecipientTransferRecord, RemoteHeader, ServerMetadata, TargetDrive,
        ThumbnailUpload, TransferHistory, TransferOutcome, TransferStatus, TransferSummary,
        UploadInstructions, UploadMetadata, UploadResult,
    },
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::platform::{DrivePlatform, NotificationSource, PlatformResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveOp {
    QueryBatch,
    QueryModified,
    ProcessInbox,
    UploadFile,
    PatchFile,
    GetFileHeader,
    GetFileHeaderByUniqueId,
    GetPayload,
    DeleteFile,
    DeleteFilesByGroupId,
    SendReadReceipt,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveCall {
    pub op: DriveOp,
    pub detail: String,
}

#[derive(Debug, Clone)]
struct StoredFile {
    drive: TargetDrive,
    header: RemoteHeader,
    payloads: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct InboxItem {
    drive: TargetDrive,
    sender: Identity,
    metadata: UploadMetadata,
    payloads: Vec<PayloadUpload>,
    created: i64,
}

#[derive(Default)]
struct MemoryDriveState {
    files: BTreeMap<FileId, StoredFile>,
    inbox: VecDeque<InboxItem>,
    calls: Vec<DriveCall>,
    failures: HashMap<DriveOp, VecDeque<PlatformError>>,
    forced_conflicts: u32,
    recipient_outcomes: HashMap<Identity, TransferOutcome>,
    receipts: Vec<FileId>,
    last_tick: i64,
}

impl MemoryDriveState {
    /// Wall clock that never repeats a value.
    fn tick(&mut self) -> i64 {
        let now = now_ms().max(self.last_tick + 1);
        self.last_tick = now;
        now
    }

    fn record(&mut self, op: DriveOp, detail: impl Into<String>) -> PlatformResult<()> {
        self.calls.push(DriveCall {
            op,
            detail: detail.into(),
        });
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn active_by_unique_id(&self, drive: &TargetDrive, unique_id: &str) -> Option<&StoredFile> {
        self.files.values().find(|file| {
            file.drive.matches(drive)
                && !file.header.is_deleted()
                && file
                    .header
                    .unique_id()
                    .is_some_and(|id| id.eq_ignore_ascii_case(unique_id))
        })
    }
}

pub struct MemoryDrive {
    state: Mutex<MemoryDriveState>,
    notifications: Mutex<broadcast::Sender<DriveNotification>>,
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_query(file: &StoredFile, params: &FileQueryParams) -> bool {
    let header = &file.header;
    file.drive.matches(&params.target_drive)
        && !header.is_deleted()
        && (params.file_types.is_empty() || params.file_types.contains(&header.file_type()))
        && (params.group_ids.is_empty()
            || header.group_id().is_some_and(|group| {
                params
                    .group_ids
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(group))
            }))
}

fn descriptors(payloads: &[PayloadUpload], thumbnails: &[ThumbnailUpload]) -> Vec<PayloadDescriptor> {
    payloads
        .iter()
        .map(|payload| PayloadDescriptor {
            key: payload.key.clone(),
            content_type: payload.content_type.clone(),
            bytes_written: payload.bytes.len() as u64,
            descriptor_content: payload.descriptor_content.clone(),
            preview_thumbnail: None,
        })
        .map(|mut descriptor| {
            descriptor.preview_thumbnail = thumbnails
                .iter()
                .find(|thumb| thumb.key == descriptor.key)
                .map(|thumb| shared::protocol::EmbeddedThumb {
                    pixel_width: thumb.pixel_width,
                    pixel_height: thumb.pixel_height,
                    content_type: thumb.content_type.clone(),
                    content_b64: String::new(),
                });
            descriptor
        })
        .collect()
}

fn outcome_to_status(outcome: TransferOutcome) -> TransferStatus {
    match outcome {
        TransferOutcome::DeliveredToInbox | TransferOutcome::DeliveredToTargetDrive => {
            TransferStatus::Delivered
        }
        TransferOutcome::Enqueued => TransferStatus::Enqueued,
        TransferOutcome::EnqueuedFailed => TransferStatus::EnqueuedFailed,
        TransferOutcome::RecipientDenied => TransferStatus::RecipientIdentityReturnedAccessDenied,
        TransferOutcome::UnknownServerError => TransferStatus::UnknownServerError,
    }
}

fn summarize(records: &BTreeMap<Identity, RecipientTransferRecord>) -> TransferSummary {
    let mut summary = TransferSummary::default();
    for record in records.values() {
        if record.is_read_by_recipient {
            summary.total_read_by_recipient += 1;
        }
        if record.latest_successfully_delivered_version_tag.is_some() {
            summary.total_delivered += 1;
        } else if record.latest_transfer_status.is_failure() {
            summary.total_failed += 1;
        } else if record.is_in_outbox {
            summary.total_in_outbox += 1;
        }
    }
    summary
}

impl MemoryDrive {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self {
            state: Mutex::new(MemoryDriveState::default()),
            notifications: Mutex::new(tx),
        }
    }

    pub fn calls(&self) -> Vec<DriveCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, op: DriveOp) -> usize {
        self.state.lock().calls.iter().filter(|call| call.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// The next call of `op` fails with `err`. Queued failures apply in order.
    pub fn fail_next(&self, op: DriveOp, err: PlatformError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// The next `count` patches race a concurrent writer and lose.
    pub fn force_conflicts(&self, count: u32) {
        self.state.lock().forced_conflicts = count;
    }

    pub fn set_recipient_outcome(&self, recipient: Identity, outcome: TransferOutcome) {
        self.state
            .lock()
            .recipient_outcomes
            .insert(recipient, outcome);
    }

    pub fn read_receipts(&self) -> Vec<FileId> {
        self.state.lock().receipts.clone()
    }

    pub fn header(&self, file_id: &FileId) -> Option<RemoteHeader> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|file| file.header.clone())
    }

    pub fn header_by_unique_id(&self, drive: &TargetDrive, unique_id: &str) -> Option<RemoteHeader> {
        self.state
            .lock()
            .active_by_unique_id(drive, unique_id)
            .map(|file| file.header.clone())
    }

    pub fn file_count(&self) -> usize {
        self.state
            .lock()
            .files
            .values()
            .filter(|file| !file.header.is_deleted())
            .count()
    }

    /// Stores a file authored by `sender` as if it had already landed on the drive.
    pub fn seed_from(
        &self,
        drive: &TargetDrive,
        sender: Option<Identity>,
        app_data: AppData,
        created: i64,
        payloads: Vec<PayloadUpload>,
    ) -> RemoteHeader {
        let mut state = self.state.lock();
        let updated = state.tick().max(created);
        let header = RemoteHeader {
            file_id: FileId::generate(),
            file_state: FileState::Active,
            metadata: FileMetadata {
                created,
                updated,
                transit_created: sender.as_ref().map(|_| created),
                sender,
                version_tag: VersionTag::generate(),
                is_encrypted: true,
                app_data,
                payloads: descriptors(&payloads, &[]),
            },
            server_metadata: None,
            key_header: Some(new_key_header()),
        };
        state.files.insert(
            header.file_id.clone(),
            StoredFile {
                drive: drive.clone(),
                header: header.clone(),
                payloads: payloads
                    .into_iter()
                    .map(|payload| (payload.key, payload.bytes))
                    .collect(),
            },
        );
        header
    }

    /// Queues a peer transfer; it lands on the drive on the next `process_inbox`.
    pub fn push_inbox(
        &self,
        drive: &TargetDrive,
        sender: Identity,
        metadata: UploadMetadata,
        payloads: Vec<PayloadUpload>,
        created: i64,
    ) {
        self.state.lock().inbox.push_back(InboxItem {
            drive: drive.clone(),
            sender,
            metadata,
            payloads,
            created,
        });
    }

    pub fn inbox_len(&self) -> usize {
        self.state.lock().inbox.len()
    }

    /// Replaces the transfer history of a file, recomputing the summary.
    pub fn set_transfer_records(
        &self,
        file_id: &FileId,
        records: BTreeMap<Identity, RecipientTransferRecord>,
    ) -> Option<RemoteHeader> {
        let mut state = self.state.lock();
        let updated = state.tick();
        let file = state.files.get_mut(file_id)?;
        let summary = summarize(&records);
        let meta = file.header.server_metadata.get_or_insert_with(ServerMetadata::default);
        meta.transfer_history = Some(TransferHistory {
            recipients: records,
            summary: Some(summary),
        });
        file.header.metadata.updated = updated;
        Some(file.header.clone())
    }

    /// Marks `recipient` as having read the file.
    pub fn mark_read_by(&self, file_id: &FileId, recipient: &Identity) -> Option<RemoteHeader> {
        let records = {
            let state = self.state.lock();
            let mut records = state
                .files
                .get(file_id)?
                .header
                .transfer_history()
                .map(|history| history.recipients.clone())
                .unwrap_or_default();
            let record = records.get_mut(recipient)?;
            record.is_read_by_recipient = true;
            records
        };
        self.set_transfer_records(file_id, records)
    }

    pub fn notify(&self, notification: DriveNotification) -> usize {
        self.notifications.lock().send(notification).unwrap_or(0)
    }

    /// Ends every open subscription, as a dropped websocket would.
    pub fn drop_connections(&self) {
        let (tx, _) = broadcast::channel(512);
        *self.notifications.lock() = tx;
    }

    fn emit(&self, notification_type: NotificationType, drive: &TargetDrive, header: &RemoteHeader) {
        self.notify(DriveNotification {
            notification_type,
            target_drive: drive.clone(),
            header: header.clone(),
        });
    }

    fn transfer(
        state: &MemoryDriveState,
        recipients: &[Identity],
        version_tag: &VersionTag,
    ) -> (
        BTreeMap<Identity, TransferOutcome>,
        BTreeMap<Identity, RecipientTransferRecord>,
    ) {
        let mut outcomes = BTreeMap::new();
        let mut records = BTreeMap::new();
        for recipient in recipients {
            let outcome = state
                .recipient_outcomes
                .get(recipient)
                .copied()
                .unwrap_or(TransferOutcome::DeliveredToInbox);
            outcomes.insert(recipient.clone(), outcome);
            records.insert(
                recipient.clone(),
                RecipientTransferRecord {
                    latest_transfer_status: outcome_to_status(outcome),
                    is_in_outbox: outcome == TransferOutcome::Enqueued,
                    is_read_by_recipient: false,
                    latest_successfully_delivered_version_tag: outcome
                        .is_inbox_delivery()
                        .then(|| version_tag.clone()),
                },
            );
        }
        (outcomes, records)
    }
}

fn new_key_header() -> KeyHeader {
    KeyHeader {
        iv_b64: uuid::Uuid::new_v4().simple().to_string(),
        encrypted_aes_key_b64: uuid::Uuid::new_v4().simple().to_string(),
    }
}

fn decode_cursor(cursor: Option<&str>) -> usize {
    cursor.and_then(|raw| raw.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl DrivePlatform for MemoryDrive {
    async fn query_batch(
        &self,
        params: &FileQueryParams,
        options: &QueryBatchOptions,
    ) -> PlatformResult<QueryBatchResponse> {
        let mut state = self.state.lock();
        state.record(
            DriveOp::QueryBatch,
            format!("types={:?} groups={:?}", params.file_types, params.group_ids),
        )?;
        let mut matching: Vec<RemoteHeader> = state
            .files
            .values()
            .filter(|file| matches_query(file, params))
            .filter(|file| {
                options
                    .created_window
                    .map_or(true, |window| window.contains(file.header.metadata.created))
            })
            .map(|file| file.header.clone())
            .collect();
        matching.sort_by(|a, b| b.metadata.created.cmp(&a.metadata.created));

        let offset = decode_cursor(options.cursor_state.as_deref());
        let end = offset.saturating_add(options.max_records).min(matching.len());
        let mut page: Vec<RemoteHeader> = matching
            .get(offset..end)
            .map(<[RemoteHeader]>::to_vec)
            .unwrap_or_default();
        let cursor_state = (end < matching.len()).then(|| end.to_string());
        if !options.include_transfer_history {
            for header in &mut page {
                if let Some(meta) = header.server_metadata.as_mut() {
                    meta.transfer_history = None;
                }
            }
        }
        Ok(QueryBatchResponse {
            search_results: page,
            cursor_state,
            query_time: state.tick(),
        })
    }

    async fn query_modified(
        &self,
        params: &FileQueryParams,
        options: &QueryModifiedOptions,
    ) -> PlatformResult<QueryModifiedResponse> {
        let mut state = self.state.lock();
        state.record(DriveOp::QueryModified, format!("since={}", options.cursor))?;
        let mut matching: Vec<RemoteHeader> = state
            .files
            .values()
            .filter(|file| matches_query(file, params))
            .filter(|file| file.header.metadata.updated >= options.cursor)
            .map(|file| file.header.clone())
            .collect();
        matching.sort_by(|a, b| a.metadata.updated.cmp(&b.metadata.updated));
        matching.truncate(options.max_records);
        let cursor = matching
            .last()
            .map_or(options.cursor, |header| header.metadata.updated);
        Ok(QueryModifiedResponse {
            search_results: matching,
            cursor,
        })
    }

    async fn process_inbox(
        &self,
        drive: &TargetDrive,
        batch_size: usize,
    ) -> PlatformResult<InboxResult> {
        let mut state = self.state.lock();
        state.record(DriveOp::ProcessInbox, format!("batch={batch_size}"))?;
        let mut popped = 0u32;
        let mut kept = VecDeque::new();
        while let Some(item) = state.inbox.pop_front() {
            if popped as usize >= batch_size || !item.drive.matches(drive) {
                kept.push_back(item);
                continue;
            }
            popped += 1;
            let landed = state.tick();
            let existing = item
                .metadata
                .app_data
                .unique_id
                .as_deref()
                .and_then(|unique_id| state.active_by_unique_id(drive, unique_id))
                .map(|file| file.header.file_id.clone());
            let file_id = existing.unwrap_or_else(FileId::generate);
            let header = RemoteHeader {
                file_id: file_id.clone(),
                file_state: FileState::Active,
                metadata: FileMetadata {
                    created: item.created,
                    updated: landed,
                    transit_created: Some(landed),
                    sender: Some(item.sender),
                    version_tag: VersionTag::generate(),
                    is_encrypted: true,
                    app_data: item.metadata.app_data,
                    payloads: descriptors(&item.payloads, &[]),
                },
                server_metadata: None,
                key_header: Some(new_key_header()),
            };
            state.files.insert(
                file_id,
                StoredFile {
                    drive: drive.clone(),
                    header,
                    payloads: item
                        .payloads
                        .into_iter()
                        .map(|payload| (payload.key, payload.bytes))
                        .collect(),
                },
            );
        }
        let remaining = kept.len() as u32;
        state.inbox = kept;
        debug!(popped, remaining, "memory drive: inbox processed");
        Ok(InboxResult {
            total_items: remaining,
            popped_count: popped,
            oldest_item_timestamp: state.inbox.front().map(|item| item.created),
        })
    }

    async fn upload_file(
        &self,
        instructions: &UploadInstructions,
        metadata: &UploadMetadata,
        payloads: &[PayloadUpload],
        thumbnails: &[ThumbnailUpload],
    ) -> PlatformResult<UploadResult> {
        let (header, outcomes, notification) = {
            let mut state = self.state.lock();
            state.record(
                DriveOp::UploadFile,
                metadata.app_data.unique_id.clone().unwrap_or_default(),
            )?;
            let now = state.tick();

            let previous = match &instructions.overwrite_file_id {
                Some(file_id) => {
                    let file = state
                        .files
                        .get(file_id)
                        .ok_or_else(|| PlatformError::NotFound(file_id.to_string()))?;
                    if metadata.version_tag.as_ref() != Some(&file.header.metadata.version_tag) {
                        return Err(PlatformError::VersionConflict {
                            file_id: file_id.clone(),
                        });
                    }
                    Some(file.header.clone())
                }
                None => {
                    if let Some(unique_id) = metadata.app_data.unique_id.as_deref() {
                        if state.active_by_unique_id(&instructions.drive, unique_id).is_some() {
                            return Err(PlatformError::Api {
                                code: shared::error::ErrorCode::Validation,
                                message: format!("unique id {unique_id} already in use"),
                            });
                        }
                    }
                    None
                }
            };

            let version_tag = VersionTag::generate();
            let recipients = instructions
                .transit
                .as_ref()
                .map(|transit| transit.recipients.clone())
                .unwrap_or_default();
            let (outcomes, records) = Self::transfer(&state, &recipients, &version_tag);
            let server_metadata = (!records.is_empty()).then(|| ServerMetadata {
                allow_distribution: metadata.allow_distribution,
                transfer_history: Some(TransferHistory {
                    summary: Some(summarize(&records)),
                    recipients: records,
                }),
            });
            let header = RemoteHeader {
                file_id: instructions
                    .overwrite_file_id
                    .clone()
                    .unwrap_or_else(FileId::generate),
                file_state: FileState::Active,
                metadata: FileMetadata {
                    created: previous
                        .as_ref()
                        .map_or(now, |prev| prev.metadata.created),
                    updated: now,
                    transit_created: None,
                    sender: metadata.sender.clone(),
                    version_tag,
                    is_encrypted: true,
                    app_data: metadata.app_data.clone(),
                    payloads: descriptors(payloads, thumbnails),
                },
                server_metadata,
                key_header: Some(new_key_header()),
            };
            state.files.insert(
                header.file_id.clone(),
                StoredFile {
                    drive: instructions.drive.clone(),
                    header: header.clone(),
                    payloads: payloads
                        .iter()
                        .map(|payload| (payload.key.clone(), payload.bytes.clone()))
                        .collect(),
                },
            );
            let notification = if previous.is_some() {
                NotificationType::FileModified
            } else {
                NotificationType::FileAdded
            };
            (header, outcomes, notification)
        };
        self.emit(notification, &instructions.drive, &header);
        Ok(UploadResult {
            file_id: header.file_id.clone(),
            new_version_tag: header.metadata.version_tag.clone(),
            recipient_status: outcomes,
            key_header: header.key_header,
        })
    }

    async fn patch_file(
        &self,
        _key_header: Option<&KeyHeader>,
        instructions: &UploadInstructions,
        metadata: &UploadMetadata,
        payloads: &[PayloadUpload],
        deleted_payloads: &[String],
    ) -> PlatformResult<PatchResult> {
        let (header, outcomes) = {
            let mut state = self.state.lock();
            let file_id = instructions.overwrite_file_id.clone().ok_or_else(|| {
                PlatformError::Api {
                    code: shared::error::ErrorCode::Validation,
                    message: "patch requires a target file id".into(),
                }
            })?;
            state.record(DriveOp::PatchFile, file_id.to_string())?;
            let now = state.tick();

            if state.forced_conflicts > 0 {
                state.forced_conflicts -= 1;
                if let Some(file) = state.files.get_mut(&file_id) {
                    file.header.metadata.version_tag = VersionTag::generate();
                    file.header.metadata.updated = now;
                }
                return Err(PlatformError::VersionConflict { file_id });
            }

            let recipients = instructions
                .transit
                .as_ref()
                .map(|transit| transit.recipients.clone())
                .unwrap_or_default();
            let version_tag = VersionTag::generate();
            let (outcomes, records) = Self::transfer(&state, &recipients, &version_tag);

            let file = state
                .files
                .get_mut(&file_id)
                .filter(|file| !file.header.is_deleted())
                .ok_or_else(|| PlatformError::NotFound(file_id.to_string()))?;
            if metadata.version_tag.as_ref() != Some(&file.header.metadata.version_tag) {
                return Err(PlatformError::VersionConflict { file_id });
            }

            for key in deleted_payloads {
                file.payloads.remove(key);
                file.header.metadata.payloads.retain(|payload| &payload.key != key);
            }
            for payload in payloads {
                file.payloads.insert(payload.key.clone(), payload.bytes.clone());
                file.header.metadata.payloads.retain(|existing| existing.key != payload.key);
                file.header
                    .metadata
                    .payloads
                    .extend(descriptors(std::slice::from_ref(payload), &[]));
            }
            file.header.metadata.app_data = metadata.app_data.clone();
            file.header.metadata.version_tag = version_tag;
            file.header.metadata.updated = now;
            if !records.is_empty() {
                let meta = file
                    .header
                    .server_metadata
                    .get_or_insert_with(ServerMetadata::default);
                let history = meta.transfer_history.get_or_insert_with(TransferHistory::default);
                history.recipients.extend(records);
                history.summary = Some(summarize(&history.recipients));
            }
            (file.header.clone(), outcomes)
        };
        self.emit(NotificationType::FileModified, &instructions.drive, &header);
        Ok(PatchResult {
            new_version_tag: header.metadata.version_tag,
            recipient_status: outcomes,
        })
    }

    async fn get_file_header(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
    ) -> PlatformResult<Option<RemoteHeader>> {
        let mut state = self.state.lock();
        state.record(DriveOp::GetFileHeader, file_id.to_string())?;
        Ok(state
            .files
            .get(file_id)
            .filter(|file| file.drive.matches(drive) && !file.header.is_deleted())
            .map(|file| file.header.clone()))
    }

    async fn get_file_header_by_unique_id(
        &self,
        drive: &TargetDrive,
        unique_id: &str,
    ) -> PlatformResult<Option<RemoteHeader>> {
        let mut state = self.state.lock();
        state.record(DriveOp::GetFileHeaderByUniqueId, unique_id)?;
        Ok(state
            .active_by_unique_id(drive, unique_id)
            .map(|file| file.header.clone()))
    }

    async fn get_payload(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
        key: &str,
    ) -> PlatformResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        state.record(DriveOp::GetPayload, format!("{file_id}/{key}"))?;
        Ok(state
            .files
            .get(file_id)
            .filter(|file| file.drive.matches(drive))
            .and_then(|file| file.payloads.get(key).cloned()))
    }

    async fn delete_file(
        &self,
        drive: &TargetDrive,
        file_id: &FileId,
        _recipients: &[Identity],
    ) -> PlatformResult<()> {
        let header = {
            let mut state = self.state.lock();
            state.record(DriveOp::DeleteFile, file_id.to_string())?;
            let now = state.tick();
            let file = state
                .files
                .get_mut(file_id)
                .filter(|file| file.drive.matches(drive))
                .ok_or_else(|| PlatformError::NotFound(file_id.to_string()))?;
            file.header.file_state = FileState::Deleted;
            file.header.metadata.updated = now;
            file.payloads.clear();
            file.header.clone()
        };
        self.emit(NotificationType::FileDeleted, drive, &header);
        Ok(())
    }

    async fn delete_files_by_group_id(
        &self,
        drive: &TargetDrive,
        group_id: &str,
        _recipients: &[Identity],
    ) -> PlatformResult<usize> {
        let deleted: Vec<RemoteHeader> = {
            let mut state = self.state.lock();
            state.record(DriveOp::DeleteFilesByGroupId, group_id)?;
            let now = state.tick();
            state
                .files
                .values_mut()
                .filter(|file| {
                    file.drive.matches(drive)
                        && !file.header.is_deleted()
                        && file
                            .header
                            .group_id()
                            .is_some_and(|group| group.eq_ignore_ascii_case(group_id))
                })
                .map(|file| {
                    file.header.file_state = FileState::Deleted;
                    file.header.metadata.updated = now;
                    file.payloads.clear();
                    file.header.clone()
                })
                .collect()
        };
        for header in &deleted {
            self.emit(NotificationType::FileDeleted, drive, header);
        }
        Ok(deleted.len())
    }

    async fn send_read_receipt(
        &self,
        _drive: &TargetDrive,
        file_ids: &[FileId],
    ) -> PlatformResult<ReadReceiptResult> {
        let mut state = self.state.lock();
        state.record(DriveOp::SendReadReceipt, format!("{} files", file_ids.len()))?;
        state.receipts.extend(file_ids.iter().cloned());
        Ok(ReadReceiptResult {
            acknowledged: file_ids.to_vec(),
        })
    }
}

#[async_trait]
impl NotificationSource for MemoryDrive {
    async fn subscribe(
        &self,
        drive: &TargetDrive,
    ) -> PlatformResult<BoxStream<'static, DriveNotification>> {
        self.state
            .lock()
            .record(DriveOp::Subscribe, drive.key())?;
        let rx = self.notifications.lock().subscribe();
        let drive = drive.clone();
        Ok(BroadcastStream::new(rx)
            .filter_map(move |item| {
                future::ready(item.ok().filter(|n| n.target_drive.matches(&drive)))
            })
            .boxed())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
