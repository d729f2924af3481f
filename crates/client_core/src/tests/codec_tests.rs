use super::*;
use std::collections::BTreeMap;

use base64::Engine as _;
use shared::{
    domain::{ArchivalStatus, FileId, VersionTag},
    protocol::{
        FileMetadata, FileState, PayloadDescriptor, RecipientTransferRecord, ServerMetadata,
        TransferHistory, TransferStatus, TransferSummary,
    },
};

use crate::{
    model::NewThumbnail,
    test_support::{conversation, limits, me, message, peer, third},
};

fn header(app_data: AppData, sender: Option<Identity>) -> RemoteHeader {
    RemoteHeader {
        file_id: FileId::new("file-1"),
        file_state: FileState::Active,
        metadata: FileMetadata {
            created: 100,
            updated: 150,
            transit_created: sender.as_ref().map(|_| 120),
            sender,
            version_tag: VersionTag::new("v1"),
            is_encrypted: true,
            app_data,
            payloads: Vec::new(),
        },
        server_metadata: None,
        key_header: None,
    }
}

fn decode_as_me(header: &RemoteHeader, recipients: &[Identity]) -> Option<Message> {
    decode_message(
        header,
        &DecodeContext {
            me: &me(),
            recipients,
        },
    )
}

#[test]
fn peer_message_keeps_its_stored_status_and_receive_time() {
    let conversation_id = ConversationId::new("conv-1");
    let mut original = message(&conversation_id, "hi there", 100);
    original.delivery_status = DeliveryStatus::Delivered;
    let encoded = encode_message(&original, DeliveryStatus::Delivered, &[], limits())
        .expect("encode");

    let decoded = decode_as_me(&header(encoded.app_data, Some(peer())), &[])
        .expect("peer message decodes");

    assert_eq!(decoded.id, original.id);
    assert_eq!(decoded.conversation_id, conversation_id);
    assert_eq!(decoded.sender, Some(peer()));
    assert_eq!(decoded.body, "hi there");
    assert_eq!(decoded.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(decoded.received, Some(120));
    assert_eq!(decoded.activity_time(), 120);
    assert!(!decoded.is_own(&me()));
}

#[test]
fn own_sender_is_normalized_to_none() {
    let conversation_id = ConversationId::new("conv-1");
    let original = message(&conversation_id, "mine", 100);
    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");

    let decoded = decode_as_me(&header(encoded.app_data, Some(me())), &[]).expect("decodes");

    assert_eq!(decoded.sender, None);
    assert!(decoded.is_own(&me()));
}

#[test]
fn own_message_status_comes_from_transfer_history() {
    let conversation_id = ConversationId::new("conv-1");
    let original = message(&conversation_id, "tracked", 100);
    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");
    let mut remote = header(encoded.app_data, None);
    remote.server_metadata = Some(ServerMetadata {
        allow_distribution: true,
        transfer_history: Some(TransferHistory {
            recipients: BTreeMap::from([(
                peer(),
                RecipientTransferRecord {
                    latest_transfer_status: TransferStatus::Delivered,
                    is_in_outbox: false,
                    is_read_by_recipient: true,
                    latest_successfully_delivered_version_tag: Some(VersionTag::new("v1")),
                },
            )]),
            summary: Some(TransferSummary {
                total_in_outbox: 0,
                total_failed: 0,
                total_delivered: 1,
                total_read_by_recipient: 1,
            }),
        }),
    });

    let decoded = decode_as_me(&remote, &[peer()]).expect("decodes");

    assert_eq!(decoded.delivery_status, DeliveryStatus::Read);
}

#[test]
fn self_conversation_messages_always_read() {
    let conversation_id = ConversationId::with_yourself();
    let original = message(&conversation_id, "note", 100);
    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");

    let decoded = decode_as_me(&header(encoded.app_data, None), &[]).expect("decodes");

    assert_eq!(decoded.delivery_status, DeliveryStatus::Read);
}

#[test]
fn unreadable_or_foreign_headers_do_not_decode() {
    let conversation_id = ConversationId::new("conv-1");
    let original = message(&conversation_id, "x", 100);
    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");

    let mut garbage = header(encoded.app_data.clone(), None);
    garbage.metadata.app_data.content = Some("{not json".into());
    assert!(decode_as_me(&garbage, &[]).is_none());

    let mut empty = header(encoded.app_data.clone(), None);
    empty.metadata.app_data.content = Some("   ".into());
    assert!(decode_as_me(&empty, &[]).is_none());

    let mut deleted = header(encoded.app_data.clone(), None);
    deleted.file_state = FileState::Deleted;
    assert!(decode_as_me(&deleted, &[]).is_none());

    let mut reaction = header(encoded.app_data.clone(), None);
    reaction.metadata.app_data.file_type = CHAT_REACTION_FILE_TYPE;
    assert!(decode_as_me(&reaction, &[]).is_none());

    let mut no_group = header(encoded.app_data, None);
    no_group.metadata.app_data.group_id = None;
    assert!(decode_as_me(&no_group, &[]).is_none());
}

#[test]
fn oversized_body_moves_to_payload_with_preview_inline() {
    let conversation_id = ConversationId::new("conv-1");
    let body = "a".repeat(limits().inline_content_limit + 10);
    let original = message(&conversation_id, &body, 100);

    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");

    assert_eq!(encoded.payloads.len(), 1);
    assert_eq!(encoded.payloads[0].key, CONTENT_PAYLOAD_KEY);
    assert!(encoded.deleted_payloads.is_empty());
    let full = decode_full_body(&encoded.payloads[0].bytes).expect("full body");
    assert_eq!(full, body);

    let mut remote = header(encoded.app_data, None);
    remote.metadata.payloads.push(PayloadDescriptor {
        key: CONTENT_PAYLOAD_KEY.into(),
        content_type: JSON_CONTENT_TYPE.into(),
        bytes_written: body.len() as u64,
        descriptor_content: None,
        preview_thumbnail: None,
    });
    let decoded = decode_as_me(&remote, &[]).expect("decodes");
    assert!(decoded.body_truncated);
    assert_eq!(decoded.body.chars().count(), limits().preview_chars);
    assert!(decoded.attachments.is_empty());
}

#[test]
fn small_body_requests_removal_of_stale_content_payload() {
    let original = message(&ConversationId::new("conv-1"), "short", 100);
    let encoded = encode_message(&original, DeliveryStatus::Sent, &[], limits()).expect("encode");
    assert!(encoded.payloads.is_empty());
    assert_eq!(encoded.deleted_payloads, vec![CONTENT_PAYLOAD_KEY.to_string()]);
}

#[test]
fn truncated_message_refuses_to_encode() {
    let mut original = message(&ConversationId::new("conv-1"), "preview only", 100);
    original.body_truncated = true;
    let err = encode_message(&original, DeliveryStatus::Sent, &[], limits())
        .expect_err("preview must not overwrite the full body");
    assert!(matches!(err, SyncError::Encode(_)));
}

#[test]
fn attachments_get_indexed_keys_and_first_thumbnail_is_embedded() {
    let original = message(&ConversationId::new("conv-1"), "photos", 100);
    let attachments = vec![
        NewAttachment {
            content_type: "application/pdf".into(),
            bytes: vec![1, 2, 3],
            thumbnail: None,
        },
        NewAttachment {
            content_type: "image/png".into(),
            bytes: vec![4, 5],
            thumbnail: Some(NewThumbnail {
                pixel_width: 20,
                pixel_height: 10,
                content_type: "image/webp".into(),
                bytes: vec![9, 9],
            }),
        },
    ];

    let encoded =
        encode_message(&original, DeliveryStatus::Sent, &attachments, limits()).expect("encode");

    let keys: Vec<&str> = encoded.payloads.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec!["chat_mbl0", "chat_mbl1"]);
    assert_eq!(encoded.thumbnails.len(), 1);
    assert_eq!(encoded.thumbnails[0].key, "chat_mbl1");
    let preview = encoded.app_data.preview_thumbnail.expect("embedded preview");
    assert_eq!(preview.pixel_width, 20);
    assert_eq!(preview.content_b64, STANDARD.encode([9, 9]));
}

#[test]
fn conversation_round_trip_includes_me_once() {
    let original = conversation(&[peer(), third()], 42);
    let app_data = encode_conversation(&original).expect("encode");
    let decoded = decode_conversation(&header(app_data, None), &me()).expect("decodes");

    assert_eq!(decoded.id, original.id);
    assert_eq!(decoded.last_read_time, 42);
    assert_eq!(decoded.recipients(&me()), vec![peer(), third()]);
    assert_eq!(
        decoded.participants.iter().filter(|p| **p == me()).count(),
        1
    );
}

#[test]
fn legacy_single_recipient_conversation_decodes() {
    let app_data = AppData {
        unique_id: Some("conv-legacy".into()),
        group_id: None,
        file_type: CHAT_CONVERSATION_FILE_TYPE,
        user_date: None,
        content: Some(r#"{"recipient":"peer.example","title":"old"}"#.into()),
        archival_status: ArchivalStatus::Archived,
        preview_thumbnail: None,
    };

    let decoded = decode_conversation(&header(app_data, None), &me()).expect("decodes");

    assert_eq!(decoded.recipients(&me()), vec![peer()]);
    assert_eq!(decoded.title.as_deref(), Some("old"));
    assert_eq!(decoded.last_read_time, 0);
    assert_eq!(decoded.archival_status, ArchivalStatus::Archived);
    assert!(!decoded.is_active());
}

#[test]
fn reaction_requires_an_emoji() {
    let reaction = Reaction {
        id: ReactionId::new("r-1"),
        message_id: MessageId::new("m-1"),
        file_id: None,
        sender: None,
        emoji: "👍".into(),
        created: 5,
        updated: 5,
    };
    let app_data = encode_reaction(&reaction).expect("encode");
    let decoded = decode_reaction(&header(app_data.clone(), Some(peer())), &me()).expect("decodes");
    assert_eq!(decoded.emoji, "👍");
    assert_eq!(decoded.message_id, MessageId::new("m-1"));
    assert_eq!(decoded.sender, Some(peer()));

    let mut empty = header(app_data, None);
    empty.metadata.app_data.content = Some(r#"{"message":""}"#.into());
    assert!(decode_reaction(&empty, &me()).is_none());
}
