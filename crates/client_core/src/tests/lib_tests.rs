use super::*;

use std::time::Duration;

use shared::{
    domain::DeliveryStatus,
    error::PlatformError,
    protocol::{DriveNotification, NotificationType},
};
use tokio::time::{sleep, timeout};

use crate::{
    inbox::CatchUpState,
    memory::DriveOp,
    test_support::{me, message, peer, seed_message, test_settings},
};

fn client() -> (Arc<MemoryDrive>, Arc<ChatClient>) {
    let drive = Arc::new(MemoryDrive::new());
    let client = ChatClient::with_memory_drive(drive.clone(), test_settings(), me());
    (drive, client)
}

#[tokio::test]
async fn create_send_and_list() {
    let (_drive, client) = client();
    let conversation = client
        .create_conversation(vec![peer()], None)
        .await
        .expect("create");
    assert!(client
        .refresh_messages(&conversation.id)
        .await
        .expect("refresh"));

    let outcome = client
        .send(&conversation.id, "hello there", Vec::new())
        .await
        .expect("send");

    assert_eq!(outcome.message.delivery_status, DeliveryStatus::Delivered);
    assert!(outcome.failed_recipients.is_empty());
    let listed = client.list(&conversation.id).expect("loaded");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].body, "hello there");
    assert!(client.failures().is_empty());
}

#[tokio::test]
async fn send_to_unknown_conversation_fails() {
    let (drive, client) = client();

    let err = client
        .send(&ConversationId::new("nobody-knows"), "hi", Vec::new())
        .await
        .expect_err("unknown conversation");

    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(drive.calls_of(DriveOp::UploadFile), 0);
    let failures = client.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].operation, error::Operation::Send);
}

#[tokio::test]
async fn failed_recipient_lookup_is_reported_for_the_operation() {
    let (drive, client) = client();
    let stranded = ConversationId::new("not-cached");
    let message = message(&stranded, "hi", 10);
    drive.fail_next(
        DriveOp::GetFileHeaderByUniqueId,
        PlatformError::Transport("offline".into()),
    );

    let err = client.react(&message, "👍").await.expect_err("lookup fails");

    assert!(matches!(err, SyncError::Remote(_)));
    let failures = client.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].operation, error::Operation::React);
}

#[tokio::test]
async fn note_to_self_needs_no_conversation_file() {
    let (drive, client) = client();
    let own = ConversationId::with_yourself();
    client.refresh_messages(&own).await.expect("refresh");

    let outcome = client.send(&own, "remember milk", Vec::new()).await.expect("send");

    assert_eq!(outcome.message.delivery_status, DeliveryStatus::Read);
    assert_eq!(drive.calls_of(DriveOp::GetFileHeaderByUniqueId), 0);
}

#[tokio::test]
async fn failures_are_broadcast_and_dismissable() {
    let (drive, client) = client();
    let conversation = client
        .create_conversation(vec![peer()], None)
        .await
        .expect("create");
    client
        .refresh_messages(&conversation.id)
        .await
        .expect("refresh");
    let mut events = client.subscribe_events();
    drive.fail_next(DriveOp::UploadFile, PlatformError::Transport("offline".into()));

    client
        .send(&conversation.id, "lost", Vec::new())
        .await
        .expect_err("upload fails");

    let failure = match events.try_recv().expect("event") {
        ClientEvent::OperationFailed(failure) => failure,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(failure.operation, error::Operation::Send);
    assert_eq!(client.failures(), vec![failure.clone()]);
    assert_eq!(client.list(&conversation.id).map(|l| l.len()), Some(0));
    assert!(client.dismiss_failure(failure.id));
    assert!(client.failures().is_empty());
}

#[tokio::test]
async fn react_and_mark_as_read() {
    let (drive, client) = client();
    let conversation = client
        .create_conversation(vec![peer()], None)
        .await
        .expect("create");
    seed_message(&drive, &conversation.id, Some(peer()), "ping", 10);
    client
        .refresh_messages(&conversation.id)
        .await
        .expect("refresh");
    let incoming = client.list(&conversation.id).expect("loaded")[0].clone();

    let reaction = client.react(&incoming, "👍").await.expect("react");
    assert_eq!(reaction.message_id, incoming.id);

    let outcome = client.mark_as_read(&conversation.id).await.expect("mark");
    assert_eq!(
        outcome,
        MarkOutcome::Marked {
            count: 1,
            last_read_time: incoming.activity_time()
        }
    );
    assert_eq!(drive.read_receipts().len(), 1);
}

#[tokio::test]
async fn catch_up_through_facade() {
    let (_drive, client) = client();

    let report = client.catch_up().await.expect("catch-up");

    assert_eq!(report.mode, storage::CatchUpMode::Invalidated);
    let second = client.catch_up().await.expect("catch-up");
    assert_eq!(second.mode, storage::CatchUpMode::Windowed);
}

#[tokio::test]
async fn checkpoint_survives_in_sqlite() {
    let drive = Arc::new(MemoryDrive::new());
    let settings = SyncSettings {
        database_url: "sqlite::memory:".into(),
        ..test_settings()
    };
    let client = ChatClient::with_storage(drive.clone(), drive, settings, me())
        .await
        .expect("open storage");

    let first = client.catch_up().await.expect("first");
    let second = client.catch_up().await.expect("second");

    assert_eq!(first.mode, storage::CatchUpMode::Invalidated);
    assert_eq!(second.mode, storage::CatchUpMode::Windowed);
}

#[tokio::test]
async fn spawned_live_task_applies_notifications() {
    let (drive, client) = client();
    let conversation = client
        .create_conversation(vec![peer()], None)
        .await
        .expect("create");
    client
        .refresh_messages(&conversation.id)
        .await
        .expect("refresh");
    let mut state = client.live().watch_state();

    let task = client.spawn_live();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("connects")
    .expect("state channel open");

    let header = seed_message(&drive, &conversation.id, Some(peer()), "live hello", 20);
    drive.notify(DriveNotification {
        notification_type: NotificationType::FileAdded,
        target_drive: client.context().drive.clone(),
        header,
    });
    timeout(Duration::from_secs(2), async {
        while client.list(&conversation.id).map_or(0, |l| l.len()) < 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message arrives");

    task.stop().await;
    assert_eq!(client.live().connection_state(), ConnectionState::Disconnected);
    assert_ne!(client.inbox.state(), CatchUpState::Draining);
}
