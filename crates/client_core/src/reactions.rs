use std::sync::Arc;

use shared::{
    domain::{ConversationId, Identity, MessageId, ReactionId},
    now_ms,
    protocol::{QueryBatchOptions, UploadInstructions, UploadMetadata, CHAT_REACTION_FILE_TYPE},
};
use tracing::debug;

use crate::{
    cache::{CacheEvent, CacheKey, CacheValue},
    codec::{decode_reaction, encode_reaction},
    context::SyncContext,
    error::{Operation, SyncResult},
    model::Reaction,
    mutation::OptimisticMutation,
};

/// Reactions are small files grouped under the message they react to.
pub struct ReactionService {
    ctx: Arc<SyncContext>,
}

impl ReactionService {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn list(&self, message_id: &MessageId) -> Option<Vec<Reaction>> {
        self.ctx.cache.reactions(message_id)
    }

    /// Loads every reaction of `message_id` into the cache.
    pub async fn fetch(&self, message_id: &MessageId) -> SyncResult<bool> {
        let ctx = &self.ctx;
        let token = ctx.cache.begin_fetch(CacheKey::Reactions(message_id.clone()));
        let params = ctx.query_params(&[CHAT_REACTION_FILE_TYPE], vec![message_id.to_string()]);
        let mut reactions = Vec::new();
        let mut cursor = None;
        loop {
            let options = QueryBatchOptions {
                max_records: ctx.settings.page_size,
                cursor_state: cursor,
                created_window: None,
                include_metadata_header: true,
                include_transfer_history: false,
            };
            let response = ctx.platform.query_batch(&params, &options).await?;
            reactions.extend(
                response
                    .search_results
                    .iter()
                    .filter_map(|header| decode_reaction(header, &ctx.me)),
            );
            match response.cursor_state {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        reactions.sort_by_key(|reaction| reaction.created);
        let count = reactions.len();
        let applied = ctx
            .cache
            .apply_fetch(&token, move |_| CacheValue::Reactions(reactions));
        debug!(message_id = %message_id, count, applied, "sync: reactions fetched");
        Ok(applied)
    }

    pub async fn add(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        emoji: impl Into<String>,
        recipients: &[Identity],
    ) -> SyncResult<Reaction> {
        let ctx = &self.ctx;
        let now = now_ms();
        let mut reaction = Reaction {
            id: ReactionId::generate(),
            message_id: message_id.clone(),
            file_id: None,
            sender: None,
            emoji: emoji.into(),
            created: now,
            updated: now,
        };

        let mutation =
            OptimisticMutation::begin(ctx.cache.clone(), [CacheKey::Reactions(message_id.clone())]);
        mutation.apply(CacheEvent::ReactionUpserted(reaction.clone()));

        let app_data = match encode_reaction(&reaction) {
            Ok(app_data) => app_data,
            Err(err) => {
                mutation.rollback();
                return Err(ctx.failures.surface(Operation::React, err));
            }
        };
        let transit = ctx.transit_for(conversation_id, recipients);
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
        match ctx
            .platform
            .upload_file(&instructions, &metadata, &[], &[])
            .await
        {
            Ok(result) => {
                mutation.commit();
                reaction.file_id = Some(result.file_id);
                ctx.cache
                    .dispatch(CacheEvent::ReactionUpserted(reaction.clone()));
                Ok(reaction)
            }
            Err(err) => {
                mutation.rollback();
                Err(ctx.failures.surface(Operation::React, err.into()))
            }
        }
    }

    pub async fn remove(&self, reaction: &Reaction, recipients: &[Identity]) -> SyncResult<()> {
        let ctx = &self.ctx;
        if let Some(file_id) = &reaction.file_id {
            if let Err(err) = ctx.platform.delete_file(&ctx.drive, file_id, recipients).await {
                return Err(ctx.failures.surface(Operation::React, err.into()));
            }
        }
        ctx.cache.dispatch(CacheEvent::ReactionRemoved {
            message_id: reaction.message_id.clone(),
            reaction_id: reaction.id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
