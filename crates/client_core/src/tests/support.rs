//! Fixtures shared by the unit tests.

use std::{collections::BTreeMap, sync::Arc};

use shared::{
    domain::{ArchivalStatus, ConversationId, DeliveryStatus, Identity, MessageId},
    protocol::{AppData, RemoteHeader, UploadMetadata},
};

use crate::{
    cache::{CacheKey, CacheValue, PagedCollection},
    codec::{decode_conversation, encode_conversation, encode_message, CodecLimits},
    config::SyncSettings,
    context::SyncContext,
    memory::MemoryDrive,
    model::{participants_with, Conversation, Message},
};

pub(crate) fn me() -> Identity {
    Identity::new("me.example")
}

pub(crate) fn peer() -> Identity {
    Identity::new("peer.example")
}

pub(crate) fn third() -> Identity {
    Identity::new("third.example")
}

pub(crate) fn test_settings() -> SyncSettings {
    SyncSettings {
        live_flush_interval_ms: 20,
        reconnect_delay_ms: 20,
        ..SyncSettings::default()
    }
}

pub(crate) fn context(drive: &Arc<MemoryDrive>) -> Arc<SyncContext> {
    Arc::new(SyncContext::new(drive.clone(), test_settings(), me()))
}

pub(crate) fn limits() -> CodecLimits {
    CodecLimits::from(&SyncSettings::default())
}

pub(crate) fn message(conversation_id: &ConversationId, body: &str, created: i64) -> Message {
    Message {
        id: MessageId::generate(),
        conversation_id: conversation_id.clone(),
        file_id: None,
        version_tag: None,
        key_header: None,
        sender: None,
        body: body.to_string(),
        body_truncated: false,
        reply_id: None,
        attachments: Vec::new(),
        preview_thumbnail: None,
        created,
        updated: created,
        received: None,
        delivery_status: DeliveryStatus::Sent,
        delivery_details: BTreeMap::new(),
        is_edited: false,
        archival_status: ArchivalStatus::Active,
    }
}

pub(crate) fn message_app_data(message: &Message) -> AppData {
    encode_message(message, message.delivery_status, &[], limits())
        .expect("encode message")
        .app_data
}

pub(crate) fn conversation(others: &[Identity], last_read_time: i64) -> Conversation {
    let id = match others {
        [single] => ConversationId::for_pair(&me(), single),
        _ => ConversationId::generate(),
    };
    Conversation {
        id,
        file_id: None,
        version_tag: None,
        key_header: None,
        participants: participants_with(&me(), others.to_vec()),
        title: None,
        archival_status: ArchivalStatus::Active,
        last_read_time,
        created: 1,
        updated: 1,
    }
}

/// Stores `conversation` on the drive as if this user had created it earlier.
pub(crate) fn seed_conversation(drive: &MemoryDrive, conversation: &Conversation) -> Conversation {
    let app_data = encode_conversation(conversation).expect("encode conversation");
    let header = drive.seed_from(
        &SyncSettings::default().target_drive(),
        None,
        app_data,
        conversation.created,
        Vec::new(),
    );
    decode_conversation(&header, &me()).expect("decode seeded conversation")
}

/// Stores a message from `sender` (`None` for this user) on the drive.
pub(crate) fn seed_message(
    drive: &MemoryDrive,
    conversation_id: &ConversationId,
    sender: Option<Identity>,
    body: &str,
    created: i64,
) -> RemoteHeader {
    let message = message(conversation_id, body, created);
    drive.seed_from(
        &SyncSettings::default().target_drive(),
        sender,
        message_app_data(&message),
        created,
        Vec::new(),
    )
}

/// Queues a transfer from `sender` in the drive's inbox.
pub(crate) fn push_peer_message(
    drive: &MemoryDrive,
    conversation_id: &ConversationId,
    sender: &Identity,
    body: &str,
    created: i64,
) -> MessageId {
    let message = message(conversation_id, body, created);
    drive.push_inbox(
        &SyncSettings::default().target_drive(),
        sender.clone(),
        UploadMetadata {
            version_tag: None,
            allow_distribution: true,
            sender: Some(sender.clone()),
            app_data: message_app_data(&message),
        },
        Vec::new(),
        created,
    );
    message.id
}

/// Marks the message collection of `conversation_id` as loaded and empty.
pub(crate) fn load_empty_messages(ctx: &SyncContext, conversation_id: &ConversationId) {
    ctx.cache.set(
        CacheKey::Messages(conversation_id.clone()),
        CacheValue::Messages(PagedCollection::default()),
    );
}

pub(crate) fn cache_conversation(ctx: &SyncContext, conversation: &Conversation) {
    ctx.cache.set(
        CacheKey::Conversation(conversation.id.clone()),
        CacheValue::Conversation(conversation.clone()),
    );
}
