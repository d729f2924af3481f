use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifiers issued by the drive platform are GUID strings compared
/// case-insensitively, so every constructor lower-cases its input.
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(value.as_ref().trim().to_ascii_lowercase())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ReactionId);
id_newtype!(FileId);
id_newtype!(VersionTag);
id_newtype!(Identity);

/// Fixed id of the note-to-self conversation.
pub const CONVERSATION_WITH_YOURSELF_ID: &str = "e4ef2382-ab3c-405d-a8b5-ad3e09e980dd";

impl ConversationId {
    pub fn with_yourself() -> Self {
        Self::new(CONVERSATION_WITH_YOURSELF_ID)
    }

    pub fn is_with_yourself(&self) -> bool {
        self.0 == CONVERSATION_WITH_YOURSELF_ID
    }

    /// Deterministic id for a one-to-one conversation; both sides derive the same value.
    pub fn for_pair(a: &Identity, b: &Identity) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let name = format!("{}|{}", low.as_str(), high.as_str());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }
}

/// Delivery state of an outgoing message. The numeric values are the ones
/// persisted in message content and define the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DeliveryStatus {
    Sending = 15,
    Sent = 20,
    Delivered = 30,
    Read = 40,
    Failed = 50,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }
}

impl From<DeliveryStatus> for u8 {
    fn from(value: DeliveryStatus) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for DeliveryStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(Self::Sending),
            20 => Ok(Self::Sent),
            30 => Ok(Self::Delivered),
            40 => Ok(Self::Read),
            50 => Ok(Self::Failed),
            other => Err(format!("unknown delivery status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ArchivalStatus {
    #[default]
    Active = 0,
    Archived = 1,
    SoftDeleted = 2,
}

impl ArchivalStatus {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl From<ArchivalStatus> for u8 {
    fn from(value: ArchivalStatus) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ArchivalStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Active),
            1 => Ok(Self::Archived),
            2 => Ok(Self::SoftDeleted),
            other => Err(format!("unknown archival status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            Self::Image
        } else if content_type.starts_with("video/") {
            Self::Video
        } else if content_type.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }
}
