use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{ConversationId, Identity, MessageId};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::info;

pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod context;
pub mod conversations;
pub mod delivery;
pub mod error;
pub mod inbox;
pub mod live;
pub mod memory;
pub mod messages;
pub mod model;
pub mod mutation;
pub mod platform;
pub mod reactions;
pub mod read_receipts;

use cache::CacheStore;
use checkpoint::{CheckpointStore, MemoryCheckpointStore};
use config::{normalize_database_url, SyncSettings};
use context::SyncContext;
use conversations::ConversationService;
use error::{Operation, OperationFailure, SyncError, SyncResult};
use inbox::{CatchUpReport, InboxProcessor};
use live::{ConnectionState, LiveProcessor};
use memory::MemoryDrive;
use messages::{MessageService, SendOutcome, SendRequest};
use model::{Conversation, Message, NewAttachment, Reaction};
use platform::{DrivePlatform, NotificationSource};
use reactions::ReactionService;
use read_receipts::{MarkAsReadCoordinator, MarkOutcome};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    CatchUpFinished(CatchUpReport),
    OperationFailed(OperationFailure),
    Error(String),
}

/// Operations a presentation layer drives. Reads are synchronous cache
/// lookups; writes are asynchronous and update the cache optimistically
/// where the operation allows it.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    fn list(&self, conversation_id: &ConversationId) -> Option<Vec<Message>>;
    fn conversations(&self) -> Option<Vec<Conversation>>;
    async fn refresh_conversations(&self) -> SyncResult<bool>;
    async fn refresh_messages(&self, conversation_id: &ConversationId) -> SyncResult<bool>;
    async fn load_more_messages(&self, conversation_id: &ConversationId) -> SyncResult<bool>;
    async fn send(
        &self,
        conversation_id: &ConversationId,
        body: &str,
        attachments: Vec<NewAttachment>,
    ) -> SyncResult<SendOutcome>;
    async fn update(&self, message: Message) -> SyncResult<Message>;
    async fn edit(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        body: &str,
    ) -> SyncResult<Message>;
    async fn soft_delete(&self, message: Message, for_everyone: bool) -> SyncResult<Message>;
    async fn react(&self, message: &Message, emoji: &str) -> SyncResult<Reaction>;
    async fn mark_as_read(&self, conversation_id: &ConversationId) -> SyncResult<MarkOutcome>;
    async fn create_conversation(
        &self,
        recipients: Vec<Identity>,
        title: Option<String>,
    ) -> SyncResult<Conversation>;
    async fn rename_conversation(
        &self,
        conversation_id: &ConversationId,
        title: Option<String>,
    ) -> SyncResult<Conversation>;
    async fn archive_conversation(&self, conversation_id: &ConversationId)
        -> SyncResult<Conversation>;
    async fn restore_conversation(&self, conversation_id: &ConversationId)
        -> SyncResult<Conversation>;
    async fn catch_up(&self) -> SyncResult<CatchUpReport>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    fn failures(&self) -> Vec<OperationFailure>;
}

pub struct ChatClient {
    ctx: Arc<SyncContext>,
    messages: MessageService,
    conversations: Arc<ConversationService>,
    reactions: ReactionService,
    inbox: Arc<InboxProcessor>,
    live: Arc<LiveProcessor>,
    read_receipts: MarkAsReadCoordinator,
}

/// Background live connection started by [`ChatClient::spawn_live`].
pub struct LiveTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LiveTask {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!("live: task ended abnormally: {err}");
        }
    }
}

impl ChatClient {
    pub fn new(
        platform: Arc<dyn DrivePlatform>,
        notifications: Arc<dyn NotificationSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: SyncSettings,
        me: Identity,
    ) -> Arc<Self> {
        let ctx = Arc::new(SyncContext::new(platform, settings, me));
        let conversations = Arc::new(ConversationService::new(ctx.clone()));
        let inbox = Arc::new(InboxProcessor::new(ctx.clone(), checkpoints));
        let live = Arc::new(LiveProcessor::new(
            ctx.clone(),
            notifications,
            inbox.clone(),
            conversations.clone(),
        ));
        Arc::new(Self {
            messages: MessageService::new(ctx.clone()),
            reactions: ReactionService::new(ctx.clone()),
            read_receipts: MarkAsReadCoordinator::new(ctx.clone(), conversations.clone()),
            conversations,
            inbox,
            live,
            ctx,
        })
    }

    /// Client over an in-memory drive with an in-memory checkpoint.
    pub fn with_memory_drive(drive: Arc<MemoryDrive>, settings: SyncSettings, me: Identity) -> Arc<Self> {
        Self::new(
            drive.clone(),
            drive,
            Arc::new(MemoryCheckpointStore::new()),
            settings,
            me,
        )
    }

    /// Client whose catch-up checkpoint lives in the SQLite database named by
    /// `settings.database_url`.
    pub async fn with_storage(
        platform: Arc<dyn DrivePlatform>,
        notifications: Arc<dyn NotificationSource>,
        settings: SyncSettings,
        me: Identity,
    ) -> Result<Arc<Self>> {
        let database_url = normalize_database_url(&settings.database_url);
        let storage = storage::Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open checkpoint database {database_url}"))?;
        info!(database_url = %database_url, "sync: checkpoint database ready");
        Ok(Self::new(
            platform,
            notifications,
            Arc::new(storage),
            settings,
            me,
        ))
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.ctx.cache
    }

    pub fn me(&self) -> &Identity {
        &self.ctx.me
    }

    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    pub fn conversation_service(&self) -> &ConversationService {
        &self.conversations
    }

    pub fn reactions(&self) -> &ReactionService {
        &self.reactions
    }

    pub fn live(&self) -> &Arc<LiveProcessor> {
        &self.live
    }

    pub fn dismiss_failure(&self, id: u64) -> bool {
        self.ctx.failures.dismiss(id)
    }

    /// Runs the live processor on a background task until the returned
    /// handle is stopped.
    pub fn spawn_live(&self) -> LiveTask {
        let (shutdown, rx) = watch::channel(false);
        let live = self.live.clone();
        let handle = tokio::spawn(async move {
            live.run(rx).await;
        });
        LiveTask { shutdown, handle }
    }

    /// Recipients of a write; a failed lookup is reported against `operation`.
    async fn recipients(
        &self,
        conversation_id: &ConversationId,
        operation: Operation,
    ) -> SyncResult<Vec<Identity>> {
        if conversation_id.is_with_yourself() {
            return Ok(Vec::new());
        }
        match self.conversations.get(conversation_id).await {
            Ok(Some(conversation)) => Ok(conversation.recipients(&self.ctx.me)),
            Ok(None) => Err(self.ctx.failures.surface(
                operation,
                SyncError::NotFound(conversation_id.to_string()),
            )),
            Err(err) => Err(self.ctx.failures.surface(operation, err)),
        }
    }
}

#[async_trait]
impl ChatHandle for ChatClient {
    fn list(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.messages.list(conversation_id)
    }

    fn conversations(&self) -> Option<Vec<Conversation>> {
        self.conversations.list()
    }

    async fn refresh_conversations(&self) -> SyncResult<bool> {
        self.conversations.fetch_list().await
    }

    async fn refresh_messages(&self, conversation_id: &ConversationId) -> SyncResult<bool> {
        self.messages.fetch_first_page(conversation_id).await
    }

    async fn load_more_messages(&self, conversation_id: &ConversationId) -> SyncResult<bool> {
        self.messages.load_more(conversation_id).await
    }

    async fn send(
        &self,
        conversation_id: &ConversationId,
        body: &str,
        attachments: Vec<NewAttachment>,
    ) -> SyncResult<SendOutcome> {
        let recipients = self.recipients(conversation_id, Operation::Send).await?;
        self.messages
            .send(SendRequest {
                conversation_id: conversation_id.clone(),
                body: body.to_string(),
                reply_id: None,
                attachments,
                recipients,
            })
            .await
    }

    async fn update(&self, message: Message) -> SyncResult<Message> {
        let recipients = self
            .recipients(&message.conversation_id, Operation::Update)
            .await?;
        self.messages.update(message, &recipients).await
    }

    async fn edit(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        body: &str,
    ) -> SyncResult<Message> {
        let recipients = self.recipients(conversation_id, Operation::Edit).await?;
        self.messages
            .edit(conversation_id, message_id, body, &recipients)
            .await
    }

    async fn soft_delete(&self, message: Message, for_everyone: bool) -> SyncResult<Message> {
        let recipients = self
            .recipients(&message.conversation_id, Operation::Delete)
            .await?;
        self.messages
            .soft_delete(message, &recipients, for_everyone)
            .await
    }

    async fn react(&self, message: &Message, emoji: &str) -> SyncResult<Reaction> {
        let recipients = self
            .recipients(&message.conversation_id, Operation::React)
            .await?;
        self.reactions
            .add(&message.conversation_id, &message.id, emoji, &recipients)
            .await
    }

    async fn mark_as_read(&self, conversation_id: &ConversationId) -> SyncResult<MarkOutcome> {
        self.read_receipts.mark_as_read(conversation_id).await
    }

    async fn create_conversation(
        &self,
        recipients: Vec<Identity>,
        title: Option<String>,
    ) -> SyncResult<Conversation> {
        self.conversations.create(recipients, title).await
    }

    async fn rename_conversation(
        &self,
        conversation_id: &ConversationId,
        title: Option<String>,
    ) -> SyncResult<Conversation> {
        self.conversations.rename(conversation_id, title).await
    }

    async fn archive_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Conversation> {
        self.conversations.archive(conversation_id).await
    }

    async fn restore_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Conversation> {
        self.conversations.restore(conversation_id).await
    }

    async fn catch_up(&self) -> SyncResult<CatchUpReport> {
        self.inbox.run().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.subscribe_events()
    }

    fn failures(&self) -> Vec<OperationFailure> {
        self.ctx.failures.active()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
