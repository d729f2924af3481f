//! Maps platform file headers to chat records and back.
//!
//! Decoding is total: a header that cannot be read yields `None`, and callers
//! fall back to invalidating the owning collection.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    domain::{AttachmentKind, ConversationId, DeliveryStatus, Identity, MessageId, ReactionId},
    protocol::{
        AppData, EmbeddedThumb, PayloadUpload, RemoteHeader, ThumbnailUpload,
        CHAT_CONVERSATION_FILE_TYPE, CHAT_MESSAGE_FILE_TYPE, CHAT_REACTION_FILE_TYPE,
        CONTENT_PAYLOAD_KEY, MESSAGE_PAYLOAD_KEY_PREFIX,
    },
};
use tracing::debug;

use crate::{
    config::SyncSettings,
    delivery::{resolve_outgoing, DeliveryInputs},
    error::{SyncError, SyncResult},
    model::{
        participants_with, Attachment, Conversation, ConversationContent, Message, MessageContent,
        NewAttachment, Reaction, ReactionContent,
    },
};

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub inline_content_limit: usize,
    pub preview_chars: usize,
}

impl From<&SyncSettings> for CodecLimits {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            inline_content_limit: settings.inline_content_limit,
            preview_chars: settings.preview_chars,
        }
    }
}

pub struct DecodeContext<'a> {
    pub me: &'a Identity,
    /// Recipients of the owning conversation, excluding `me`.
    pub recipients: &'a [Identity],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub app_data: AppData,
    pub payloads: Vec<PayloadUpload>,
    pub thumbnails: Vec<ThumbnailUpload>,
    /// Payload keys a patch must remove.
    pub deleted_payloads: Vec<String>,
}

fn non_empty_content(header: &RemoteHeader) -> Option<&str> {
    header
        .metadata
        .app_data
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
}

fn normalized_sender(header: &RemoteHeader, me: &Identity) -> Option<Identity> {
    header
        .metadata
        .sender
        .clone()
        .filter(|sender| !sender.as_str().is_empty() && sender != me)
}

pub fn decode_message(header: &RemoteHeader, ctx: &DecodeContext<'_>) -> Option<Message> {
    if header.file_type() != CHAT_MESSAGE_FILE_TYPE || header.is_deleted() {
        return None;
    }
    let id = MessageId::new(header.unique_id()?);
    let conversation_id = ConversationId::new(header.group_id()?);
    let raw = non_empty_content(header)?;
    let content: MessageContent = match serde_json::from_str(raw) {
        Ok(content) => content,
        Err(err) => {
            debug!(file_id = %header.file_id, "sync: message content unreadable: {err}");
            return None;
        }
    };

    let sender = normalized_sender(header, ctx.me);
    let delivery_status = if sender.is_none() {
        resolve_outgoing(&DeliveryInputs {
            conversation_id: &conversation_id,
            stored: content.delivery_status,
            details: &content.delivery_details,
            history: header.transfer_history(),
            recipients: ctx.recipients,
        })
    } else {
        content.delivery_status
    };

    let metadata = &header.metadata;
    let attachments = metadata
        .payloads
        .iter()
        .filter(|payload| payload.key != CONTENT_PAYLOAD_KEY)
        .map(|payload| Attachment {
            key: payload.key.clone(),
            kind: AttachmentKind::from_content_type(&payload.content_type),
            content_type: payload.content_type.clone(),
            size: payload.bytes_written,
            preview: payload.preview_thumbnail.clone(),
        })
        .collect();

    Some(Message {
        id,
        conversation_id,
        file_id: Some(header.file_id.clone()),
        version_tag: Some(metadata.version_tag.clone()),
        key_header: header.key_header.clone(),
        sender,
        body: content.message,
        body_truncated: metadata
            .payloads
            .iter()
            .any(|payload| payload.key == CONTENT_PAYLOAD_KEY),
        reply_id: content.reply_id,
        attachments,
        preview_thumbnail: metadata.app_data.preview_thumbnail.clone(),
        created: metadata.created,
        updated: metadata.updated,
        received: metadata.transit_created,
        delivery_status,
        delivery_details: content.delivery_details,
        is_edited: content.is_edited,
        archival_status: metadata.app_data.archival_status,
    })
}

/// Reads the full body out of the side payload written for oversized content.
pub fn decode_full_body(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<MessageContent>(bytes)
        .ok()
        .map(|content| content.message)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn message_content(message: &Message, status: DeliveryStatus) -> MessageContent {
    MessageContent {
        message: message.body.clone(),
        reply_id: message.reply_id.clone(),
        delivery_status: status,
        delivery_details: message.delivery_details.clone(),
        is_edited: message.is_edited,
    }
}

/// Encodes a message for upload or patch, persisting `status` as its delivery status.
pub fn encode_message(
    message: &Message,
    status: DeliveryStatus,
    attachments: &[NewAttachment],
    limits: CodecLimits,
) -> SyncResult<EncodedRecord> {
    if message.body_truncated {
        return Err(SyncError::Encode(format!(
            "message {} only holds a preview of its body",
            message.id
        )));
    }

    let content = message_content(message, status);
    let full = serde_json::to_string(&content)?;
    let mut payloads = Vec::new();
    let mut deleted_payloads = Vec::new();

    let inline = if full.len() > limits.inline_content_limit {
        let preview = MessageContent {
            message: truncate_chars(&message.body, limits.preview_chars),
            ..content
        };
        payloads.push(PayloadUpload {
            key: CONTENT_PAYLOAD_KEY.to_string(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            bytes: full.into_bytes(),
            descriptor_content: None,
        });
        serde_json::to_string(&preview)?
    } else {
        deleted_payloads.push(CONTENT_PAYLOAD_KEY.to_string());
        full
    };

    let mut thumbnails = Vec::new();
    // Patches carry no attachments; keep the thumbnail already on the header.
    let mut preview_thumbnail = if attachments.is_empty() {
        message.preview_thumbnail.clone()
    } else {
        None
    };
    for (index, attachment) in attachments.iter().enumerate() {
        let key = format!("{MESSAGE_PAYLOAD_KEY_PREFIX}{index}");
        payloads.push(PayloadUpload {
            key: key.clone(),
            content_type: attachment.content_type.clone(),
            bytes: attachment.bytes.clone(),
            descriptor_content: None,
        });
        if let Some(thumb) = &attachment.thumbnail {
            if preview_thumbnail.is_none() {
                preview_thumbnail = Some(EmbeddedThumb {
                    pixel_width: thumb.pixel_width,
                    pixel_height: thumb.pixel_height,
                    content_type: thumb.content_type.clone(),
                    content_b64: STANDARD.encode(&thumb.bytes),
                });
            }
            thumbnails.push(ThumbnailUpload {
                key,
                pixel_width: thumb.pixel_width,
                pixel_height: thumb.pixel_height,
                content_type: thumb.content_type.clone(),
                bytes: thumb.bytes.clone(),
            });
        }
    }

    Ok(EncodedRecord {
        app_data: AppData {
            unique_id: Some(message.id.to_string()),
            group_id: Some(message.conversation_id.to_string()),
            file_type: CHAT_MESSAGE_FILE_TYPE,
            user_date: Some(message.created),
            content: Some(inline),
            archival_status: message.archival_status,
            preview_thumbnail,
        },
        payloads,
        thumbnails,
        deleted_payloads,
    })
}

pub fn decode_conversation(header: &RemoteHeader, me: &Identity) -> Option<Conversation> {
    if header.file_type() != CHAT_CONVERSATION_FILE_TYPE || header.is_deleted() {
        return None;
    }
    let id = ConversationId::new(header.unique_id()?);
    let content: ConversationContent = serde_json::from_str(non_empty_content(header)?).ok()?;
    let (others, title, last_read_time) = match content {
        ConversationContent::MultiRecipient {
            recipients,
            title,
            last_read_time,
        } => (recipients, title, last_read_time),
        ConversationContent::SingleRecipient {
            recipient,
            title,
            last_read_time,
        } => (vec![recipient], title, last_read_time),
    };

    Some(Conversation {
        id,
        file_id: Some(header.file_id.clone()),
        version_tag: Some(header.metadata.version_tag.clone()),
        key_header: header.key_header.clone(),
        participants: participants_with(me, others),
        title,
        archival_status: header.metadata.app_data.archival_status,
        last_read_time,
        created: header.metadata.created,
        updated: header.metadata.updated,
    })
}

pub fn encode_conversation(conversation: &Conversation) -> SyncResult<AppData> {
    let content = ConversationContent::MultiRecipient {
        recipients: conversation.participants.clone(),
        title: conversation.title.clone(),
        last_read_time: conversation.last_read_time,
    };
    Ok(AppData {
        unique_id: Some(conversation.id.to_string()),
        group_id: None,
        file_type: CHAT_CONVERSATION_FILE_TYPE,
        user_date: Some(conversation.created),
        content: Some(serde_json::to_string(&content)?),
        archival_status: conversation.archival_status,
        preview_thumbnail: None,
    })
}

pub fn decode_reaction(header: &RemoteHeader, me: &Identity) -> Option<Reaction> {
    if header.file_type() != CHAT_REACTION_FILE_TYPE || header.is_deleted() {
        return None;
    }
    let content: ReactionContent = serde_json::from_str(non_empty_content(header)?).ok()?;
    if content.message.is_empty() {
        return None;
    }
    Some(Reaction {
        id: ReactionId::new(header.unique_id()?),
        message_id: MessageId::new(header.group_id()?),
        file_id: Some(header.file_id.clone()),
        sender: normalized_sender(header, me),
        emoji: content.message,
        created: header.metadata.created,
        updated: header.metadata.updated,
    })
}

pub fn encode_reaction(reaction: &Reaction) -> SyncResult<AppData> {
    let content = ReactionContent {
        message: reaction.emoji.clone(),
    };
    Ok(AppData {
        unique_id: Some(reaction.id.to_string()),
        group_id: Some(reaction.message_id.to_string()),
        file_type: CHAT_REACTION_FILE_TYPE,
        user_date: Some(reaction.created),
        content: Some(serde_json::to_string(&content)?),
        archival_status: Default::default(),
        preview_thumbnail: None,
    })
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
