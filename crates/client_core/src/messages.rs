use std::{collections::BTreeMap, sync::Arc};

use shared::{
    domain::{
        ArchivalStatus, AttachmentKind, ConversationId, DeliveryStatus, Identity, MessageId,
    },
    now_ms,
    protocol::{
        PatchResult, QueryBatchOptions, TransferOutcome, UploadInstructions, UploadMetadata,
        CHAT_MESSAGE_FILE_TYPE, CONTENT_PAYLOAD_KEY, MESSAGE_PAYLOAD_KEY_PREFIX,
    },
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEvent, CacheKey, CacheValue, Page, PagedCollection, UpsertMode},
    codec::{decode_full_body, encode_message},
    conflict::patch_with_retry,
    context::SyncContext,
    error::{Operation, SyncError, SyncResult},
    model::{Attachment, Message, NewAttachment},
    mutation::OptimisticMutation,
};

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub body: String,
    pub reply_id: Option<MessageId>,
    pub attachments: Vec<NewAttachment>,
    pub recipients: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message: Message,
    /// Recipients whose transfer failed; empty on full success.
    pub failed_recipients: Vec<Identity>,
}

pub struct MessageService {
    ctx: Arc<SyncContext>,
}

fn dedup_recipients(me: &Identity, recipients: Vec<Identity>) -> Vec<Identity> {
    let mut unique: Vec<Identity> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if recipient != *me && !unique.contains(&recipient) {
            unique.push(recipient);
        }
    }
    unique
}

fn classify_outcomes(
    recipients: &[Identity],
    outcomes: &BTreeMap<Identity, TransferOutcome>,
) -> (Vec<Identity>, bool) {
    let failed: Vec<Identity> = recipients
        .iter()
        .filter(|recipient| outcomes.get(*recipient).is_some_and(|outcome| outcome.is_failure()))
        .cloned()
        .collect();
    let all_delivered = !recipients.is_empty()
        && recipients.iter().all(|recipient| {
            outcomes
                .get(recipient)
                .is_some_and(|outcome| outcome.is_inbox_delivery())
        });
    (failed, all_delivered)
}

fn describe(recipients: &[Identity]) -> String {
    recipients
        .iter()
        .map(Identity::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl MessageService {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Synchronous read of the cached message window, newest first.
    pub fn list(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.ctx
            .cache
            .messages(conversation_id)
            .map(|collection| collection.items().cloned().collect())
    }

    pub async fn send(&self, request: SendRequest) -> SyncResult<SendOutcome> {
        let ctx = &self.ctx;
        let conversation_id = request.conversation_id.clone();
        let to_self = conversation_id.is_with_yourself();
        let recipients = dedup_recipients(&ctx.me, request.recipients);
        if recipients.is_empty() && !to_self {
            return Err(ctx
                .failures
                .surface(Operation::Send, SyncError::NoRecipients(conversation_id)));
        }

        let now = now_ms();
        let mut message = Message {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            file_id: None,
            version_tag: None,
            key_header: None,
            sender: None,
            body: request.body,
            body_truncated: false,
            reply_id: request.reply_id,
            attachments: request
                .attachments
                .iter()
                .enumerate()
                .map(|(index, attachment)| Attachment {
                    key: format!("{MESSAGE_PAYLOAD_KEY_PREFIX}{index}"),
                    kind: AttachmentKind::from_content_type(&attachment.content_type),
                    content_type: attachment.content_type.clone(),
                    size: attachment.bytes.len() as u64,
                    preview: None,
                })
                .collect(),
            preview_thumbnail: None,
            created: now,
            updated: now,
            received: None,
            delivery_status: DeliveryStatus::Sending,
            delivery_details: BTreeMap::new(),
            is_edited: false,
            archival_status: ArchivalStatus::Active,
        };

        let mutation = OptimisticMutation::begin(
            ctx.cache.clone(),
            [CacheKey::Messages(conversation_id.clone())],
        );
        mutation.apply(CacheEvent::MessageUpserted {
            message: message.clone(),
            mode: UpsertMode::Insert,
        });

        let stored_status = if to_self {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Sent
        };
        let encoded = match encode_message(&message, stored_status, &request.attachments, ctx.limits())
        {
            Ok(encoded) => encoded,
            Err(err) => {
                mutation.rollback();
                return Err(ctx.failures.surface(Operation::Send, err));
            }
        };
        message.preview_thumbnail = encoded.app_data.preview_thumbnail.clone();
        let transit = ctx.transit_for(&conversation_id, &recipients);
        let instructions = UploadInstructions {
            drive: ctx.drive.clone(),
            overwrite_file_id: None,
            transit: transit.clone(),
        };
        let metadata = UploadMetadata {
            version_tag: None,
            allow_distribution: transit.is_some(),
            sender: None,
            app_data: encoded.app_data,
        };

        let result = match ctx
            .platform
            .upload_file(&instructions, &metadata, &encoded.payloads, &encoded.thumbnails)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                mutation.rollback();
                return Err(ctx.failures.surface(Operation::Send, err.into()));
            }
        };
        mutation.commit();

        message.file_id = Some(result.file_id.clone());
        message.version_tag = Some(result.new_version_tag.clone());
        message.key_header = result.key_header.clone();
        message.delivery_status = stored_status;
        info!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            file_id = %result.file_id,
            recipients = recipients.len(),
            "sync: message uploaded"
        );

        let (failed, all_delivered) = classify_outcomes(&recipients, &result.recipient_status);
        self.settle_delivery(&mut message, &failed, all_delivered).await;
        Ok(SendOutcome {
            message,
            failed_recipients: failed,
        })
    }

    /// Advances a freshly written message to `Failed` or `Delivered` from the
    /// immediate transfer outcomes, then folds it into the cache.
    async fn settle_delivery(&self, message: &mut Message, failed: &[Identity], all_delivered: bool) {
        let ctx = &self.ctx;
        if !failed.is_empty() {
            message.delivery_status = DeliveryStatus::Failed;
            ctx.cache.dispatch(CacheEvent::MessageUpserted {
                message: message.clone(),
                mode: UpsertMode::Update,
            });
            if let Err(err) = self.write_message(message, None, &[]).await {
                warn!(message_id = %message.id, "sync: failed status not persisted: {err}");
            }
            ctx.failures.report(
                Operation::Send,
                format!("message could not be delivered to {}", describe(failed)),
            );
        } else if all_delivered {
            let mut promoted = message.clone();
            promoted.delivery_status = DeliveryStatus::Delivered;
            match self.write_message(&mut promoted, None, &[]).await {
                Ok(_) => *message = promoted,
                Err(err) => {
                    warn!(message_id = %message.id, "sync: delivered promotion failed, keeping sent: {err}");
                }
            }
        }
        ctx.cache.dispatch(CacheEvent::MessageUpserted {
            message: message.clone(),
            mode: UpsertMode::Update,
        });
    }

    /// Conditional patch of `message` through the version-conflict retry.
    async fn write_message(
        &self,
        message: &mut Message,
        recipients: Option<&[Identity]>,
        extra_deleted: &[String],
    ) -> SyncResult<PatchResult> {
        let ctx = self.ctx.clone();
        if message.file_id.is_none() {
            return Err(SyncError::NotFound(format!("message {} has no remote file", message.id)));
        }
        let encoded = encode_message(message, message.delivery_status, &[], ctx.limits())?;
        let mut deleted = encoded.deleted_payloads.clone();
        for key in extra_deleted {
            if !deleted.contains(key) {
                deleted.push(key.clone());
            }
        }
        let transit = recipients.and_then(|recipients| ctx.transit_for(&message.conversation_id, recipients));

        let platform = ctx.platform.clone();
        let drive = ctx.drive.clone();
        let patched = patch_with_retry(ctx.platform.as_ref(), &ctx.drive, message, |record: Message| {
            let platform = platform.clone();
            let instructions = UploadInstructions {
                drive: drive.clone(),
                overwrite_file_id: record.file_id.clone(),
                transit: transit.clone(),
            };
            let metadata = UploadMetadata {
                version_tag: record.version_tag.clone(),
                allow_distribution: transit.is_some(),
                sender: None,
                app_data: encoded.app_data.clone(),
            };
            let payloads = encoded.payloads.clone();
            let deleted = deleted.clone();
            async move {
                platform
                    .patch_file(
                        record.key_header.as_ref(),
                        &instructions,
                        &metadata,
                        &payloads,
                        &deleted,
                    )
                    .await
            }
        })
        .await?;
        message.version_tag = Some(patched.new_version_tag.clone());
        debug!(message_id = %message.id, "sync: message patched");
        Ok(patched)
    }

    async fn write_and_cache(
        &self,
        mut message: Message,
        recipients: Option<&[Identity]>,
        extra_deleted: &[String],
        operation: Operation,
    ) -> SyncResult<Message> {
        match self.write_message(&mut message, recipients, extra_deleted).await {
            Ok(_) => {
                self.ctx.cache.dispatch(CacheEvent::MessageUpserted {
                    message: message.clone(),
                    mode: UpsertMode::Update,
                });
                Ok(message)
            }
            // The previous durable state is still correct; the cache is left as is.
            Err(err) => Err(self.ctx.failures.surface(operation, err)),
        }
    }

    /// Persists local changes to an existing message. Not optimistic: the
    /// cache only changes once the write succeeded.
    pub async fn update(&self, message: Message, recipients: &[Identity]) -> SyncResult<Message> {
        self.write_and_cache(message, Some(recipients), &[], Operation::Update)
            .await
    }

    /// Redistributes a message, typically one that previously failed.
    pub async fn resend(&self, message: Message, recipients: &[Identity]) -> SyncResult<SendOutcome> {
        let recipients = dedup_recipients(&self.ctx.me, recipients.to_vec());
        let mut message = match self.load_full_body(message).await {
            Ok(message) => message,
            Err(err) => return Err(self.ctx.failures.surface(Operation::Update, err)),
        };
        message.delivery_status = if message.conversation_id.is_with_yourself() {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Sent
        };
        let patched = match self.write_message(&mut message, Some(&recipients), &[]).await {
            Ok(patched) => patched,
            Err(err) => return Err(self.ctx.failures.surface(Operation::Update, err)),
        };
        let (failed, all_delivered) = classify_outcomes(&recipients, &patched.recipient_status);
        self.settle_delivery(&mut message, &failed, all_delivered).await;
        Ok(SendOutcome {
            message,
            failed_recipients: failed,
        })
    }

    pub async fn edit(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        body: impl Into<String>,
        recipients: &[Identity],
    ) -> SyncResult<Message> {
        let message = match self.get(conversation_id, message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(self
                    .ctx
                    .failures
                    .surface(Operation::Edit, SyncError::NotFound(message_id.to_string())))
            }
            Err(err) => return Err(self.ctx.failures.surface(Operation::Edit, err)),
        };
        let mut message = if message.body_truncated {
            match self.load_full_body(message).await {
                Ok(message) => message,
                Err(err) => return Err(self.ctx.failures.surface(Operation::Edit, err)),
            }
        } else {
            message
        };
        message.body = body.into();
        message.is_edited = true;
        message.updated = now_ms();
        self.write_and_cache(message, Some(recipients), &[], Operation::Edit)
            .await
    }

    /// Clears the body, drops attachment payloads and marks the message
    /// soft-deleted. With `distribute` the change reaches the recipients too.
    pub async fn soft_delete(
        &self,
        message: Message,
        recipients: &[Identity],
        distribute: bool,
    ) -> SyncResult<Message> {
        let mut deleted = message;
        let mut dropped: Vec<String> = deleted
            .attachments
            .drain(..)
            .map(|attachment| attachment.key)
            .collect();
        dropped.push(CONTENT_PAYLOAD_KEY.to_string());
        deleted.preview_thumbnail = None;
        deleted.body.clear();
        deleted.body_truncated = false;
        deleted.archival_status = ArchivalStatus::SoftDeleted;
        deleted.updated = now_ms();
        let recipients = distribute.then_some(recipients);
        self.write_and_cache(deleted, recipients, &dropped, Operation::Delete)
            .await
    }

    pub async fn hard_delete(&self, message: &Message, recipients: &[Identity]) -> SyncResult<()> {
        let ctx = &self.ctx;
        if let Some(file_id) = &message.file_id {
            if let Err(err) = ctx.platform.delete_file(&ctx.drive, file_id, recipients).await {
                return Err(ctx.failures.surface(Operation::Delete, err.into()));
            }
        }
        ctx.cache.dispatch(CacheEvent::MessageRemoved {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(())
    }

    /// Removes every message of the conversation; returns how many were deleted.
    pub async fn clear_conversation(
        &self,
        conversation_id: &ConversationId,
        recipients: &[Identity],
    ) -> SyncResult<usize> {
        let ctx = &self.ctx;
        let removed = match ctx
            .platform
            .delete_files_by_group_id(&ctx.drive, conversation_id.as_str(), recipients)
            .await
        {
            Ok(removed) => removed,
            Err(err) => return Err(ctx.failures.surface(Operation::Delete, err.into())),
        };
        info!(conversation_id = %conversation_id, removed, "sync: conversation cleared");
        ctx.cache.dispatch(CacheEvent::MessagesInvalidated {
            conversation_id: conversation_id.clone(),
        });
        Ok(removed)
    }

    /// Cache first, then the drive by unique id.
    pub async fn get(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> SyncResult<Option<Message>> {
        if let Some(message) = self.ctx.cache.message(conversation_id, message_id) {
            return Ok(Some(message));
        }
        let header = self
            .ctx
            .platform
            .get_file_header_by_unique_id(&self.ctx.drive, message_id.as_str())
            .await?;
        Ok(header.and_then(|header| self.ctx.materialize_message(&header)))
    }

    pub async fn load_full_body(&self, mut message: Message) -> SyncResult<Message> {
        if !message.body_truncated {
            return Ok(message);
        }
        let ctx = &self.ctx;
        let file_id = message
            .file_id
            .clone()
            .ok_or_else(|| SyncError::NotFound(message.id.to_string()))?;
        let bytes = ctx
            .platform
            .get_payload(&ctx.drive, &file_id, CONTENT_PAYLOAD_KEY)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{file_id}/{CONTENT_PAYLOAD_KEY}")))?;
        let body = decode_full_body(&bytes)
            .ok_or_else(|| SyncError::NotFound(format!("{file_id}/{CONTENT_PAYLOAD_KEY}")))?;
        message.body = body;
        message.body_truncated = false;
        ctx.cache.dispatch(CacheEvent::MessageUpserted {
            message: message.clone(),
            mode: UpsertMode::Update,
        });
        Ok(message)
    }

    async fn query_page(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<String>,
        max_records: usize,
    ) -> SyncResult<Page<Message>> {
        let ctx = &self.ctx;
        let params = ctx.query_params(&[CHAT_MESSAGE_FILE_TYPE], vec![conversation_id.to_string()]);
        let options = QueryBatchOptions {
            max_records,
            cursor_state: cursor,
            created_window: None,
            include_metadata_header: true,
            include_transfer_history: true,
        };
        let response = ctx.platform.query_batch(&params, &options).await?;
        let items: Vec<Message> = response
            .search_results
            .iter()
            .filter_map(|header| ctx.materialize_message(header))
            .collect();
        Ok(Page {
            items,
            cursor: response.cursor_state,
        })
    }

    /// Replaces the collection with a fresh first page. Records already cached
    /// that are newer than the fetched page, or not yet uploaded, are kept. An
    /// empty page keeps only the records that were never uploaded.
    /// Returns `false` when a newer fetch or an invalidation superseded it.
    pub async fn fetch_first_page(&self, conversation_id: &ConversationId) -> SyncResult<bool> {
        let ctx = &self.ctx;
        let token = ctx
            .cache
            .begin_fetch(CacheKey::Messages(conversation_id.clone()));
        let page = self
            .query_page(conversation_id, None, ctx.settings.first_page_size)
            .await?;

        let applied = ctx.cache.apply_fetch(&token, move |current| {
            let newest_fetched = page.items.iter().map(|message| message.created).max();
            let mut collection = PagedCollection::single_page(Vec::new(), page.cursor.clone());
            for message in page.items {
                collection.upsert(message, UpsertMode::Auto);
            }
            if let Some(CacheValue::Messages(previous)) = current {
                if let Some(first) = previous.pages.into_iter().next() {
                    for message in first.items {
                        let keep = message.file_id.is_none()
                            || newest_fetched.is_some_and(|newest| message.created > newest);
                        if keep {
                            collection.upsert(message, UpsertMode::Auto);
                        }
                    }
                }
            }
            CacheValue::Messages(collection)
        });
        debug!(conversation_id = %conversation_id, applied, "sync: first message page fetched");
        Ok(applied)
    }

    /// Appends the next page. Returns `false` when there is nothing more to
    /// load or the result was superseded.
    pub async fn load_more(&self, conversation_id: &ConversationId) -> SyncResult<bool> {
        let ctx = &self.ctx;
        let Some(collection) = ctx.cache.messages(conversation_id) else {
            return self.fetch_first_page(conversation_id).await;
        };
        let Some(cursor) = collection.next_cursor().map(str::to_string) else {
            return Ok(false);
        };

        let token = ctx
            .cache
            .begin_fetch(CacheKey::Messages(conversation_id.clone()));
        let page = self
            .query_page(conversation_id, Some(cursor.clone()), ctx.settings.page_size)
            .await?;
        let mut appended = false;
        let applied = ctx.cache.apply_fetch(&token, |current| {
            let mut collection = match current {
                Some(CacheValue::Messages(collection)) => collection,
                _ => PagedCollection::default(),
            };
            if collection.next_cursor() == Some(cursor.as_str()) {
                let items = page
                    .items
                    .into_iter()
                    .filter(|message| collection.find(message.id.as_str()).is_none())
                    .collect();
                collection.pages.push(Page {
                    items,
                    cursor: page.cursor,
                });
                appended = true;
            }
            CacheValue::Messages(collection)
        });
        Ok(applied && appended)
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
