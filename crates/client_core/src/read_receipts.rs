use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use shared::domain::{ConversationId, DeliveryStatus, FileId, Identity};
use tracing::{debug, info};

use crate::{
    context::SyncContext,
    conversations::ConversationService,
    error::{Operation, SyncError, SyncResult},
    model::{Conversation, Message},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A previous call for the same conversation has not settled yet.
    Skipped,
    NothingToMark,
    Marked { count: usize, last_read_time: i64 },
}

/// Messages from others that arrived after the read marker and are not yet
/// acknowledged.
pub fn unread_messages<'a>(
    me: &Identity,
    conversation: &Conversation,
    messages: impl IntoIterator<Item = &'a Message>,
) -> Vec<&'a Message> {
    messages
        .into_iter()
        .filter(|message| {
            !message.is_own(me)
                && message.file_id.is_some()
                && message.activity_time() > conversation.last_read_time
                && message.delivery_status < DeliveryStatus::Read
        })
        .collect()
}

pub struct MarkAsReadCoordinator {
    ctx: Arc<SyncContext>,
    conversations: Arc<ConversationService>,
    in_flight: Mutex<HashSet<ConversationId>>,
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<ConversationId>>,
    conversation_id: ConversationId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.conversation_id);
    }
}

impl MarkAsReadCoordinator {
    pub fn new(ctx: Arc<SyncContext>, conversations: Arc<ConversationService>) -> Self {
        Self {
            ctx,
            conversations,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn enter(&self, conversation_id: &ConversationId) -> Option<InFlight<'_>> {
        self.in_flight
            .lock()
            .insert(conversation_id.clone())
            .then(|| InFlight {
                set: &self.in_flight,
                conversation_id: conversation_id.clone(),
            })
    }

    /// Sends read receipts for the unread part of the loaded message window,
    /// then advances the conversation's read marker. The marker stays where
    /// it was when the receipts could not be sent.
    pub async fn mark_as_read(&self, conversation_id: &ConversationId) -> SyncResult<MarkOutcome> {
        let Some(_in_flight) = self.enter(conversation_id) else {
            debug!(conversation_id = %conversation_id, "sync: mark-as-read already running");
            return Ok(MarkOutcome::Skipped);
        };
        let ctx = &self.ctx;

        let conversation = match self.conversations.get(conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                return Err(ctx.failures.surface(
                    Operation::MarkAsRead,
                    SyncError::NotFound(conversation_id.to_string()),
                ))
            }
            Err(err) => return Err(ctx.failures.surface(Operation::MarkAsRead, err)),
        };
        let Some(window) = ctx.cache.messages(conversation_id) else {
            return Ok(MarkOutcome::NothingToMark);
        };
        let unread = unread_messages(&ctx.me, &conversation, window.items());
        let Some(last_read_time) = unread.iter().map(|message| message.activity_time()).max() else {
            return Ok(MarkOutcome::NothingToMark);
        };
        let file_ids: Vec<FileId> = unread
            .iter()
            .filter_map(|message| message.file_id.clone())
            .collect();

        if let Err(err) = ctx.platform.send_read_receipt(&ctx.drive, &file_ids).await {
            return Err(ctx.failures.surface(Operation::MarkAsRead, err.into()));
        }
        self.conversations
            .set_last_read_time(conversation_id, last_read_time)
            .await?;
        info!(
            conversation_id = %conversation_id,
            count = file_ids.len(),
            last_read_time,
            "sync: conversation marked as read"
        );
        Ok(MarkOutcome::Marked {
            count: file_ids.len(),
            last_read_time,
        })
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
