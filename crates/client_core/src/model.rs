use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        ArchivalStatus, AttachmentKind, ConversationId, DeliveryStatus, FileId, Identity,
        MessageId, ReactionId, VersionTag,
    },
    protocol::{EmbeddedThumb, KeyHeader},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub key: String,
    pub kind: AttachmentKind,
    pub content_type: String,
    pub size: u64,
    pub preview: Option<EmbeddedThumb>,
}

/// Attachment handed in by the caller; bytes and thumbnail are already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub thumbnail: Option<NewThumbnail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThumbnail {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub file_id: Option<FileId>,
    pub version_tag: Option<VersionTag>,
    pub key_header: Option<KeyHeader>,
    /// `None` when the current user wrote the message.
    pub sender: Option<Identity>,
    pub body: String,
    /// The header only carried a preview; the full body lives in a payload.
    pub body_truncated: bool,
    pub reply_id: Option<MessageId>,
    pub attachments: Vec<Attachment>,
    /// Header-level thumbnail of the first attachment, kept across patches.
    pub preview_thumbnail: Option<EmbeddedThumb>,
    pub created: i64,
    pub updated: i64,
    pub received: Option<i64>,
    pub delivery_status: DeliveryStatus,
    pub delivery_details: BTreeMap<Identity, DeliveryStatus>,
    pub is_edited: bool,
    pub archival_status: ArchivalStatus,
}

impl Message {
    pub fn is_own(&self, me: &Identity) -> bool {
        self.sender.as_ref().map_or(true, |sender| sender == me)
    }

    pub fn is_deleted(&self) -> bool {
        self.archival_status == ArchivalStatus::SoftDeleted
    }

    /// Time the message became visible to this device.
    pub fn activity_time(&self) -> i64 {
        self.received.unwrap_or(self.created)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub file_id: Option<FileId>,
    pub version_tag: Option<VersionTag>,
    pub key_header: Option<KeyHeader>,
    /// Always contains the current user.
    pub participants: Vec<Identity>,
    pub title: Option<String>,
    pub archival_status: ArchivalStatus,
    pub last_read_time: i64,
    pub created: i64,
    pub updated: i64,
}

impl Conversation {
    /// Synthetic note-to-self conversation; it has no remote file.
    pub fn with_yourself(me: &Identity) -> Self {
        Self {
            id: ConversationId::with_yourself(),
            file_id: None,
            version_tag: None,
            key_header: None,
            participants: vec![me.clone()],
            title: None,
            archival_status: ArchivalStatus::Active,
            last_read_time: 0,
            created: 0,
            updated: 0,
        }
    }

    pub fn recipients(&self, me: &Identity) -> Vec<Identity> {
        self.participants
            .iter()
            .filter(|participant| *participant != me)
            .cloned()
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.archival_status.is_active()
    }
}

/// Builds a participant list: deduplicated, current user included.
pub fn participants_with(me: &Identity, others: impl IntoIterator<Item = Identity>) -> Vec<Identity> {
    let mut participants: Vec<Identity> = Vec::new();
    for identity in others.into_iter().chain(std::iter::once(me.clone())) {
        if !participants.contains(&identity) {
            participants.push(identity);
        }
    }
    participants
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub message_id: MessageId,
    pub file_id: Option<FileId>,
    pub sender: Option<Identity>,
    pub emoji: String,
    pub created: i64,
    pub updated: i64,
}

/// JSON body of a message file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageContent {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<MessageId>,
    pub delivery_status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery_details: BTreeMap<Identity, DeliveryStatus>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_edited: bool,
}

/// JSON body of a conversation file. Older records name a single recipient,
/// newer ones carry the full list; both resolve to one participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ConversationContent {
    #[serde(rename_all = "camelCase")]
    MultiRecipient {
        recipients: Vec<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        last_read_time: i64,
    },
    #[serde(rename_all = "camelCase")]
    SingleRecipient {
        recipient: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        last_read_time: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReactionContent {
    pub message: String,
}
