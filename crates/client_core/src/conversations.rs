use std::sync::Arc;

use shared::{
    domain::{ArchivalStatus, ConversationId, Identity},
    now_ms,
    protocol::{
        PatchResult, QueryBatchOptions, UploadInstructions, UploadMetadata,
        CHAT_CONVERSATION_FILE_TYPE,
    },
};
use tracing::{debug, info};

use crate::{
    cache::{CacheEvent, CacheKey, CacheValue, Page, PagedCollection, UpsertMode},
    codec::{decode_conversation, encode_conversation},
    conflict::patch_with_retry,
    context::SyncContext,
    error::{Operation, SyncError, SyncResult},
    model::{participants_with, Conversation},
    mutation::OptimisticMutation,
};

pub struct ConversationService {
    ctx: Arc<SyncContext>,
}

impl ConversationService {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Cached conversation list, most recently updated first.
    pub fn list(&self) -> Option<Vec<Conversation>> {
        self.ctx
            .cache
            .conversations()
            .map(|collection| collection.items().cloned().collect())
    }

    /// Creates a conversation with `recipients`. A one-to-one conversation
    /// uses the id both sides derive from the pair, and an existing one is
    /// returned as is.
    pub async fn create(
        &self,
        recipients: Vec<Identity>,
        title: Option<String>,
    ) -> SyncResult<Conversation> {
        let ctx = &self.ctx;
        let participants = participants_with(&ctx.me, recipients);
        let others: Vec<Identity> = participants
            .iter()
            .filter(|participant| **participant != ctx.me)
            .cloned()
            .collect();
        if others.is_empty() {
            return Ok(Conversation::with_yourself(&ctx.me));
        }

        let id = if others.len() == 1 {
            ConversationId::for_pair(&ctx.me, &others[0])
        } else {
            ConversationId::generate()
        };
        if others.len() == 1 {
            match self.get(&id).await {
                Ok(Some(existing)) => {
                    debug!(conversation_id = %id, "sync: reusing one-to-one conversation");
                    return Ok(existing);
                }
                Ok(None) => {}
                Err(err) => return Err(ctx.failures.surface(Operation::CreateConversation, err)),
            }
        }

        let now = now_ms();
        let mut conversation = Conversation {
            id: id.clone(),
            file_id: None,
            version_tag: None,
            key_header: None,
            participants,
            title,
            archival_status: ArchivalStatus::Active,
            last_read_time: now,
            created: now,
            updated: now,
        };

        let mutation = OptimisticMutation::begin(
            ctx.cache.clone(),
            [CacheKey::ConversationList, CacheKey::Conversation(id.clone())],
        );
        mutation.apply(CacheEvent::ConversationUpserted {
            conversation: conversation.clone(),
            mode: UpsertMode::Insert,
        });

        let app_data = match encode_conversation(&conversation) {
            Ok(app_data) => app_data,
            Err(err) => {
                mutation.rollback();
                return Err(ctx.failures.surface(Operation::CreateConversation, err));
            }
        };
        let transit = ctx.transit_for(&id, &others);
        let instructions = UploadInstructions {
            drive: ctx.drive.clone(),
            overwrite_file_id: None,
            transit: transit.clone(),
        };
        let metadata = UploadMetadata {
            version_tag: None,
            allow_distribution: transit.is_some(),
            sender: None,
            app_data,
        };
        let result = match ctx
            .platform
            .upload_file(&instructions, &metadata, &[], &[])
            .await
        {
            Ok(result) => result,
            Err(err) => {
                mutation.rollback();
                return Err(ctx
                    .failures
                    .surface(Operation::CreateConversation, err.into()));
            }
        };
        mutation.commit();

        conversation.file_id = Some(result.file_id.clone());
        conversation.version_tag = Some(result.new_version_tag);
        conversation.key_header = result.key_header;
        ctx.cache.dispatch(CacheEvent::ConversationUpserted {
            conversation: conversation.clone(),
            mode: UpsertMode::Update,
        });
        info!(conversation_id = %id, file_id = %result.file_id, participants = conversation.participants.len(), "sync: conversation created");
        Ok(conversation)
    }

    /// The note-to-self conversation is synthetic; everything else comes
    /// from the cache, then the drive.
    pub async fn get(&self, conversation_id: &ConversationId) -> SyncResult<Option<Conversation>> {
        let ctx = &self.ctx;
        if conversation_id.is_with_yourself() {
            return Ok(Some(Conversation::with_yourself(&ctx.me)));
        }
        if let Some(conversation) = ctx.cache.conversation(conversation_id) {
            return Ok(Some(conversation));
        }
        let Some(header) = ctx
            .platform
            .get_file_header_by_unique_id(&ctx.drive, conversation_id.as_str())
            .await?
        else {
            return Ok(None);
        };
        let conversation = decode_conversation(&header, &ctx.me);
        if let Some(conversation) = &conversation {
            ctx.cache.set(
                CacheKey::Conversation(conversation.id.clone()),
                CacheValue::Conversation(conversation.clone()),
            );
        }
        Ok(conversation)
    }

    async fn write(&self, conversation: &mut Conversation) -> SyncResult<PatchResult> {
        let ctx = self.ctx.clone();
        if conversation.file_id.is_none() {
            return Err(SyncError::NotFound(format!(
                "conversation {} has no remote file",
                conversation.id
            )));
        }
        let app_data = encode_conversation(conversation)?;
        let platform = ctx.platform.clone();
        let drive = ctx.drive.clone();
        let patched = patch_with_retry(
            ctx.platform.as_ref(),
            &ctx.drive,
            conversation,
            |record: Conversation| {
                let platform = platform.clone();
                let instructions = UploadInstructions {
                    drive: drive.clone(),
                    overwrite_file_id: record.file_id.clone(),
                    transit: None,
                };
                let metadata = UploadMetadata {
                    version_tag: record.version_tag.clone(),
                    allow_distribution: false,
                    sender: None,
                    app_data: app_data.clone(),
                };
                async move {
                    platform
                        .patch_file(record.key_header.as_ref(), &instructions, &metadata, &[], &[])
                        .await
                }
            },
        )
        .await?;
        conversation.version_tag = Some(patched.new_version_tag.clone());
        Ok(patched)
    }

    /// Persists conversation metadata. The cache is updated once the write
    /// succeeded.
    pub async fn update(&self, conversation: Conversation) -> SyncResult<Conversation> {
        self.update_as(conversation, Operation::UpdateConversation)
            .await
    }

    async fn update_as(
        &self,
        mut conversation: Conversation,
        operation: Operation,
    ) -> SyncResult<Conversation> {
        if conversation.id.is_with_yourself() {
            return Ok(conversation);
        }
        match self.write(&mut conversation).await {
            Ok(_) => {
                self.ctx.cache.dispatch(CacheEvent::ConversationUpserted {
                    conversation: conversation.clone(),
                    mode: UpsertMode::Update,
                });
                debug!(conversation_id = %conversation.id, "sync: conversation updated");
                Ok(conversation)
            }
            Err(err) => Err(self.ctx.failures.surface(operation, err)),
        }
    }

    async fn require(
        &self,
        conversation_id: &ConversationId,
        operation: Operation,
    ) -> SyncResult<Conversation> {
        match self.get(conversation_id).await {
            Ok(Some(conversation)) => Ok(conversation),
            Ok(None) => Err(self.ctx.failures.surface(
                operation,
                SyncError::NotFound(conversation_id.to_string()),
            )),
            Err(err) => Err(self.ctx.failures.surface(operation, err)),
        }
    }

    pub async fn rename(
        &self,
        conversation_id: &ConversationId,
        title: Option<String>,
    ) -> SyncResult<Conversation> {
        let mut conversation = self
            .require(conversation_id, Operation::UpdateConversation)
            .await?;
        conversation.title = title;
        conversation.updated = now_ms();
        self.update(conversation).await
    }

    pub async fn add_recipients(
        &self,
        conversation_id: &ConversationId,
        recipients: Vec<Identity>,
    ) -> SyncResult<Conversation> {
        let mut conversation = self
            .require(conversation_id, Operation::UpdateConversation)
            .await?;
        let mut participants = conversation.participants.clone();
        participants.extend(recipients);
        conversation.participants = participants_with(&self.ctx.me, participants);
        conversation.updated = now_ms();
        self.update(conversation).await
    }

    /// Advances the read marker. The marker never moves backwards.
    pub async fn set_last_read_time(
        &self,
        conversation_id: &ConversationId,
        last_read_time: i64,
    ) -> SyncResult<Conversation> {
        let mut conversation = self
            .require(conversation_id, Operation::MarkAsRead)
            .await?;
        if last_read_time <= conversation.last_read_time {
            return Ok(conversation);
        }
        conversation.last_read_time = last_read_time;
        self.update_as(conversation, Operation::MarkAsRead).await
    }

    /// Deletes every message of the conversation, then marks it soft-deleted.
    /// The conversation file itself is kept so late messages can still attach.
    pub async fn archive(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        let ctx = &self.ctx;
        let mut conversation = self
            .require(conversation_id, Operation::ArchiveConversation)
            .await?;
        let recipients = conversation.recipients(&ctx.me);
        let removed = match ctx
            .platform
            .delete_files_by_group_id(&ctx.drive, conversation_id.as_str(), &recipients)
            .await
        {
            Ok(removed) => removed,
            Err(err) => {
                return Err(ctx
                    .failures
                    .surface(Operation::ArchiveConversation, err.into()))
            }
        };
        ctx.cache.dispatch(CacheEvent::MessagesInvalidated {
            conversation_id: conversation_id.clone(),
        });

        conversation.archival_status = ArchivalStatus::SoftDeleted;
        conversation.updated = now_ms();
        let conversation = self
            .update_as(conversation, Operation::ArchiveConversation)
            .await?;
        info!(conversation_id = %conversation_id, removed, "sync: conversation archived");
        Ok(conversation)
    }

    pub async fn restore(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        let ctx = &self.ctx;
        let mut conversation = self
            .require(conversation_id, Operation::RestoreConversation)
            .await?;
        if conversation.is_active() {
            return Ok(conversation);
        }
        conversation.archival_status = ArchivalStatus::Active;
        conversation.updated = now_ms();
        let conversation = self
            .update_as(conversation, Operation::RestoreConversation)
            .await?;
        ctx.cache.dispatch(CacheEvent::ConversationInvalidated {
            conversation_id: conversation_id.clone(),
        });
        ctx.cache.dispatch(CacheEvent::ConversationListInvalidated);
        ctx.cache.dispatch(CacheEvent::MessagesInvalidated {
            conversation_id: conversation_id.clone(),
        });
        info!(conversation_id = %conversation_id, "sync: conversation restored");
        Ok(conversation)
    }

    async fn query_page(&self, cursor: Option<String>) -> SyncResult<Page<Conversation>> {
        let ctx = &self.ctx;
        let params = ctx.query_params(&[CHAT_CONVERSATION_FILE_TYPE], Vec::new());
        let options = QueryBatchOptions {
            max_records: ctx.settings.conversation_page_size,
            cursor_state: cursor,
            created_window: None,
            include_metadata_header: true,
            include_transfer_history: false,
        };
        let response = ctx.platform.query_batch(&params, &options).await?;
        let mut items: Vec<Conversation> = response
            .search_results
            .iter()
            .filter_map(|header| decode_conversation(header, &ctx.me))
            .collect();
        items.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(Page {
            items,
            cursor: response.cursor_state,
        })
    }

    /// Replaces the cached list with a fresh first page. Returns `false` when
    /// the result was superseded.
    pub async fn fetch_list(&self) -> SyncResult<bool> {
        let ctx = &self.ctx;
        let token = ctx.cache.begin_fetch(CacheKey::ConversationList);
        let page = self.query_page(None).await?;
        let count = page.items.len();
        let applied = ctx.cache.apply_fetch(&token, move |_| {
            CacheValue::Conversations(PagedCollection::single_page(page.items, page.cursor))
        });
        debug!(count, applied, "sync: conversation list fetched");
        Ok(applied)
    }

    pub async fn load_more(&self) -> SyncResult<bool> {
        let ctx = &self.ctx;
        let Some(collection) = ctx.cache.conversations() else {
            return self.fetch_list().await;
        };
        let Some(cursor) = collection.next_cursor().map(str::to_string) else {
            return Ok(false);
        };
        let token = ctx.cache.begin_fetch(CacheKey::ConversationList);
        let page = self.query_page(Some(cursor.clone())).await?;
        let mut appended = false;
        let applied = ctx.cache.apply_fetch(&token, |current| {
            let mut collection = match current {
                Some(CacheValue::Conversations(collection)) => collection,
                _ => PagedCollection::default(),
            };
            if collection.next_cursor() == Some(cursor.as_str()) {
                let items = page
                    .items
                    .into_iter()
                    .filter(|conversation| collection.find(conversation.id.as_str()).is_none())
                    .collect();
                collection.pages.push(Page {
                    items,
                    cursor: page.cursor,
                });
                appended = true;
            }
            CacheValue::Conversations(collection)
        });
        Ok(applied && appended)
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
