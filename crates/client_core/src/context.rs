use std::sync::Arc;

use shared::{
    domain::{ConversationId, Identity},
    protocol::{
        AppNotificationOptions, FileQueryParams, RemoteHeader, TargetDrive, TransitOptions,
        CHAT_APP_ID,
    },
};
use tokio::sync::broadcast;

use crate::{
    cache::CacheStore,
    codec::{decode_message, CodecLimits, DecodeContext},
    config::SyncSettings,
    error::FailureCenter,
    model::Message,
    platform::DrivePlatform,
    ClientEvent,
};

/// Shared state every sync component works against.
pub struct SyncContext {
    pub platform: Arc<dyn DrivePlatform>,
    pub cache: Arc<CacheStore>,
    pub failures: Arc<FailureCenter>,
    pub settings: SyncSettings,
    pub drive: TargetDrive,
    /// Identity of the signed-in user.
    pub me: Identity,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncContext {
    pub fn new(platform: Arc<dyn DrivePlatform>, settings: SyncSettings, me: Identity) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            platform,
            cache: Arc::new(CacheStore::new()),
            failures: Arc::new(FailureCenter::new(events.clone())),
            drive: settings.target_drive(),
            settings,
            me,
            events,
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn limits(&self) -> CodecLimits {
        CodecLimits::from(&self.settings)
    }

    pub fn query_params(&self, file_types: &[u32], group_ids: Vec<String>) -> FileQueryParams {
        FileQueryParams {
            target_drive: self.drive.clone(),
            file_types: file_types.to_vec(),
            group_ids,
        }
    }

    /// Recipients of a cached conversation, excluding the current user.
    pub fn recipients_of(&self, conversation_id: &ConversationId) -> Vec<Identity> {
        self.cache
            .conversation(conversation_id)
            .map(|conversation| conversation.recipients(&self.me))
            .unwrap_or_default()
    }

    pub fn materialize_message(&self, header: &RemoteHeader) -> Option<Message> {
        let conversation_id = ConversationId::new(header.group_id()?);
        let recipients = self.recipients_of(&conversation_id);
        decode_message(
            header,
            &DecodeContext {
                me: &self.me,
                recipients: &recipients,
            },
        )
    }

    /// Distribution options for a chat write; `None` when nobody else receives it.
    pub fn transit_for(
        &self,
        conversation_id: &ConversationId,
        recipients: &[Identity],
    ) -> Option<TransitOptions> {
        let recipients: Vec<Identity> = recipients
            .iter()
            .filter(|recipient| **recipient != self.me)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return None;
        }
        Some(TransitOptions {
            recipients,
            notification: Some(AppNotificationOptions {
                app_id: CHAT_APP_ID.to_string(),
                type_id: conversation_id.to_string(),
                tag_id: uuid::Uuid::new_v4().to_string(),
                silent: false,
            }),
        })
    }
}
