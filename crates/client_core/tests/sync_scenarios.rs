use std::{collections::BTreeMap, sync::Arc};

use client_core::{
    cache::CacheKey,
    checkpoint::MemoryCheckpointStore,
    codec::{encode_message, CodecLimits},
    config::SyncSettings,
    error::SyncError,
    memory::{DriveOp, MemoryDrive},
    model::{Conversation, Message},
    read_receipts::MarkOutcome,
    ChatClient, ChatHandle,
};
use shared::{
    domain::{ArchivalStatus, ConversationId, DeliveryStatus, Identity, MessageId},
    error::PlatformError,
    now_ms,
    protocol::{DriveNotification, NotificationType, UploadMetadata},
};
use storage::CatchUpMode;

fn me() -> Identity {
    Identity::new("me.example")
}

fn peer() -> Identity {
    Identity::new("peer.example")
}

fn settings() -> SyncSettings {
    SyncSettings {
        live_flush_interval_ms: 20,
        reconnect_delay_ms: 20,
        ..SyncSettings::default()
    }
}

fn client_with_checkpoint(drive: &Arc<MemoryDrive>, checkpoint: Option<i64>) -> Arc<ChatClient> {
    let store = match checkpoint {
        Some(at) => MemoryCheckpointStore::with_checkpoint(&settings().target_drive().key(), at),
        None => MemoryCheckpointStore::new(),
    };
    ChatClient::new(
        drive.clone(),
        drive.clone(),
        Arc::new(store),
        settings(),
        me(),
    )
}

async fn one_to_one(client: &ChatClient) -> Conversation {
    let conversation = client
        .create_conversation(vec![peer()], None)
        .await
        .expect("create conversation");
    client
        .refresh_messages(&conversation.id)
        .await
        .expect("load messages");
    conversation
}

/// Queues a message from the peer in this user's inbox.
fn deliver_from_peer(
    drive: &MemoryDrive,
    conversation_id: &ConversationId,
    body: &str,
    created: i64,
) -> MessageId {
    let message = Message {
        id: MessageId::generate(),
        conversation_id: conversation_id.clone(),
        file_id: None,
        version_tag: None,
        key_header: None,
        sender: Some(peer()),
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
    };
    let encoded = encode_message(
        &message,
        DeliveryStatus::Sent,
        &[],
        CodecLimits::from(&settings()),
    )
    .expect("encode");
    drive.push_inbox(
        &settings().target_drive(),
        peer(),
        UploadMetadata {
            version_tag: None,
            allow_distribution: true,
            sender: Some(peer()),
            app_data: encoded.app_data,
        },
        encoded.payloads,
        created,
    );
    message.id
}

fn occurrences(client: &ChatClient, conversation_id: &ConversationId, id: &MessageId) -> usize {
    client
        .list(conversation_id)
        .unwrap_or_default()
        .iter()
        .filter(|message| &message.id == id)
        .count()
}

#[tokio::test]
async fn catch_up_window_then_live_echo_never_duplicates() {
    let drive = Arc::new(MemoryDrive::new());
    let checkpoint = now_ms() - 10_000;
    let client = client_with_checkpoint(&drive, Some(checkpoint));
    let conversation = one_to_one(&client).await;
    let before = deliver_from_peer(&drive, &conversation.id, "just before", checkpoint - 1);
    let after = deliver_from_peer(&drive, &conversation.id, "just after", checkpoint + 100);

    let report = client.catch_up().await.expect("catch-up");

    assert_eq!(report.mode, CatchUpMode::Windowed);
    assert_eq!(occurrences(&client, &conversation.id, &before), 1);
    assert_eq!(occurrences(&client, &conversation.id, &after), 1);

    // The live stream may report the same file again after reconnecting.
    let header = drive
        .header_by_unique_id(&settings().target_drive(), after.as_str())
        .expect("landed");
    client
        .live()
        .handle_notification(DriveNotification {
            notification_type: NotificationType::FileModified,
            target_drive: settings().target_drive(),
            header,
        })
        .await;
    assert_eq!(occurrences(&client, &conversation.id, &after), 1);
    assert_eq!(client.list(&conversation.id).map(|l| l.len()), Some(2));
}

#[tokio::test]
async fn failed_send_leaves_cache_exactly_as_before() {
    let drive = Arc::new(MemoryDrive::new());
    let client = client_with_checkpoint(&drive, None);
    let conversation = one_to_one(&client).await;
    client
        .send(&conversation.id, "first", Vec::new())
        .await
        .expect("send");
    let key = CacheKey::Messages(conversation.id.clone());
    let before = client.cache().get(&key).expect("cached");
    drive.fail_next(DriveOp::UploadFile, PlatformError::Transport("offline".into()));

    client
        .send(&conversation.id, "second", Vec::new())
        .await
        .expect_err("upload fails");

    assert_eq!(client.cache().get(&key), Some(before));
    assert_eq!(client.failures().len(), 1);
}

#[tokio::test]
async fn read_marker_moves_only_after_receipts() {
    let drive = Arc::new(MemoryDrive::new());
    let client = client_with_checkpoint(&drive, Some(now_ms() - 5_000));
    let conversation = one_to_one(&client).await;
    let now = now_ms();
    for offset in [10, 20, 30] {
        deliver_from_peer(&drive, &conversation.id, "hey", now + offset);
    }
    client.catch_up().await.expect("catch-up");
    let newest = client
        .list(&conversation.id)
        .expect("loaded")
        .iter()
        .map(|message| message.received.unwrap_or(message.created))
        .max()
        .expect("messages");

    drive.fail_next(
        DriveOp::SendReadReceipt,
        PlatformError::Transport("offline".into()),
    );
    client
        .mark_as_read(&conversation.id)
        .await
        .expect_err("receipts rejected");
    let unchanged = client
        .conversation_service()
        .get(&conversation.id)
        .await
        .expect("lookup")
        .expect("found");
    assert_eq!(unchanged.last_read_time, 0);

    drive.clear_calls();
    let outcome = client.mark_as_read(&conversation.id).await.expect("mark");
    assert_eq!(
        outcome,
        MarkOutcome::Marked {
            count: 3,
            last_read_time: newest
        }
    );
    let ops: Vec<DriveOp> = drive.calls().into_iter().map(|call| call.op).collect();
    let receipt = ops
        .iter()
        .position(|op| *op == DriveOp::SendReadReceipt)
        .expect("receipt sent");
    let patch = ops
        .iter()
        .position(|op| *op == DriveOp::PatchFile)
        .expect("marker patched");
    assert!(receipt < patch);
}

#[tokio::test]
async fn orphaned_messages_do_not_disturb_other_conversations() {
    let drive = Arc::new(MemoryDrive::new());
    let client = client_with_checkpoint(&drive, Some(now_ms() - 5_000));
    let conversation = one_to_one(&client).await;
    let orphan = ConversationId::new("deleted-long-ago");
    deliver_from_peer(&drive, &orphan, "anyone there?", now_ms());
    let kept = deliver_from_peer(&drive, &conversation.id, "hello", now_ms());

    client.catch_up().await.expect("catch-up survives orphans");

    assert_eq!(occurrences(&client, &conversation.id, &kept), 1);
    assert!(client.list(&orphan).is_none());
}

#[tokio::test]
async fn concurrent_edit_is_retried_once_only() {
    let drive = Arc::new(MemoryDrive::new());
    let client = client_with_checkpoint(&drive, None);
    let conversation = one_to_one(&client).await;

    drive.clear_calls();
    drive.force_conflicts(1);
    let renamed = client
        .rename_conversation(&conversation.id, Some("plans".into()))
        .await
        .expect("one conflict is absorbed");
    assert_eq!(renamed.title.as_deref(), Some("plans"));
    assert_eq!(drive.calls_of(DriveOp::PatchFile), 2);
    assert_eq!(drive.calls_of(DriveOp::GetFileHeaderByUniqueId), 1);

    drive.clear_calls();
    drive.force_conflicts(2);
    let err = client
        .rename_conversation(&conversation.id, Some("other plans".into()))
        .await
        .expect_err("second conflict surfaces");
    assert!(matches!(err, SyncError::VersionConflict { .. }));
    assert_eq!(drive.calls_of(DriveOp::PatchFile), 2);
    assert_eq!(client.failures().len(), 1);
}
