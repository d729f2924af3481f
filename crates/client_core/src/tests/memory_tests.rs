use super::*;

use shared::protocol::{TransitOptions, CHAT_MESSAGE_FILE_TYPE};

fn drive() -> TargetDrive {
    TargetDrive::chat()
}

fn app_data(unique_id: &str, group_id: &str) -> AppData {
    AppData {
        unique_id: Some(unique_id.into()),
        group_id: Some(group_id.into()),
        file_type: CHAT_MESSAGE_FILE_TYPE,
        user_date: None,
        content: Some("{}".into()),
        archival_status: Default::default(),
        preview_thumbnail: None,
    }
}

fn upload_metadata(unique_id: &str) -> UploadMetadata {
    UploadMetadata {
        version_tag: None,
        allow_distribution: true,
        sender: None,
        app_data: app_data(unique_id, "conv-1"),
    }
}

fn instructions(recipients: &[&str]) -> UploadInstructions {
    UploadInstructions {
        drive: drive(),
        overwrite_file_id: None,
        transit: (!recipients.is_empty()).then(|| TransitOptions {
            recipients: recipients.iter().map(|r| Identity::new(r)).collect(),
            notification: None,
        }),
    }
}

fn params() -> FileQueryParams {
    FileQueryParams {
        target_drive: drive(),
        file_types: vec![CHAT_MESSAGE_FILE_TYPE],
        group_ids: Vec::new(),
    }
}

#[tokio::test]
async fn upload_records_transfer_outcomes_per_recipient() {
    let memory = MemoryDrive::new();
    memory.set_recipient_outcome(Identity::new("down.example"), TransferOutcome::RecipientDenied);

    let result = memory
        .upload_file(
            &instructions(&["up.example", "down.example"]),
            &upload_metadata("m-1"),
            &[],
            &[],
        )
        .await
        .expect("upload");

    assert_eq!(
        result.recipient_status.get(&Identity::new("up.example")),
        Some(&TransferOutcome::DeliveredToInbox)
    );
    assert_eq!(
        result.recipient_status.get(&Identity::new("down.example")),
        Some(&TransferOutcome::RecipientDenied)
    );
    let header = memory.header(&result.file_id).expect("stored");
    let summary = header
        .transfer_history()
        .and_then(|history| history.summary)
        .expect("summary");
    assert_eq!(summary.total_delivered, 1);
    assert_eq!(summary.total_failed, 1);
}

#[tokio::test]
async fn duplicate_unique_id_is_rejected() {
    let memory = MemoryDrive::new();
    memory
        .upload_file(&instructions(&[]), &upload_metadata("m-1"), &[], &[])
        .await
        .expect("first upload");

    let err = memory
        .upload_file(&instructions(&[]), &upload_metadata("M-1"), &[], &[])
        .await
        .expect_err("duplicate");
    assert!(matches!(err, PlatformError::Api { .. }));
}

#[tokio::test]
async fn patch_requires_current_version_tag() {
    let memory = MemoryDrive::new();
    let uploaded = memory
        .upload_file(&instructions(&[]), &upload_metadata("m-1"), &[], &[])
        .await
        .expect("upload");
    let mut overwrite = instructions(&[]);
    overwrite.overwrite_file_id = Some(uploaded.file_id.clone());

    let mut stale = upload_metadata("m-1");
    stale.version_tag = Some(VersionTag::new("stale"));
    let err = memory
        .patch_file(None, &overwrite, &stale, &[], &[])
        .await
        .expect_err("stale tag");
    assert!(err.is_version_conflict());

    let mut current = upload_metadata("m-1");
    current.version_tag = Some(uploaded.new_version_tag.clone());
    let patched = memory
        .patch_file(None, &overwrite, &current, &[], &[])
        .await
        .expect("patch");
    assert_ne!(patched.new_version_tag, uploaded.new_version_tag);
}

#[tokio::test]
async fn process_inbox_lands_transfers_with_receive_time() {
    let memory = MemoryDrive::new();
    let peer = Identity::new("peer.example");
    memory.push_inbox(
        &drive(),
        peer.clone(),
        UploadMetadata {
            sender: Some(peer.clone()),
            ..upload_metadata("m-1")
        },
        Vec::new(),
        10,
    );
    assert_eq!(memory.inbox_len(), 1);

    let result = memory.process_inbox(&drive(), 10).await.expect("process");

    assert_eq!(result.popped_count, 1);
    assert_eq!(memory.inbox_len(), 0);
    let header = memory
        .header_by_unique_id(&drive(), "m-1")
        .expect("landed");
    assert_eq!(header.metadata.created, 10);
    assert_eq!(header.metadata.sender, Some(peer));
    assert!(header.metadata.transit_created.is_some_and(|at| at > 10));
}

#[tokio::test]
async fn query_batch_pages_newest_first() {
    let memory = MemoryDrive::new();
    for (index, created) in [10, 30, 20].into_iter().enumerate() {
        memory.seed_from(
            &drive(),
            None,
            app_data(&format!("m-{index}"), "conv-1"),
            created,
            Vec::new(),
        );
    }
    let options = |cursor: Option<String>| QueryBatchOptions {
        max_records: 2,
        cursor_state: cursor,
        created_window: None,
        include_metadata_header: true,
        include_transfer_history: false,
    };

    let first = memory.query_batch(&params(), &options(None)).await.expect("page 1");
    let created: Vec<i64> = first.search_results.iter().map(|h| h.metadata.created).collect();
    assert_eq!(created, vec![30, 20]);
    let second = memory
        .query_batch(&params(), &options(first.cursor_state.clone()))
        .await
        .expect("page 2");
    assert_eq!(second.search_results.len(), 1);
    assert_eq!(second.search_results[0].metadata.created, 10);
    assert!(second.cursor_state.is_none());
}

#[tokio::test]
async fn deletes_are_broadcast_and_hidden_from_queries() {
    let memory = MemoryDrive::new();
    let mut feed = memory.subscribe(&drive()).await.expect("subscribe");
    let seeded = memory.seed_from(&drive(), None, app_data("m-1", "conv-1"), 5, Vec::new());

    let removed = memory
        .delete_files_by_group_id(&drive(), "CONV-1", &[])
        .await
        .expect("delete");

    assert_eq!(removed, 1);
    assert_eq!(memory.file_count(), 0);
    let notification = feed.next().await.expect("notification");
    assert_eq!(notification.notification_type, NotificationType::FileDeleted);
    assert_eq!(notification.header.file_id, seeded.file_id);
    assert!(memory
        .get_file_header(&drive(), &seeded.file_id)
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn injected_failures_apply_once_in_order() {
    let memory = MemoryDrive::new();
    memory.fail_next(DriveOp::ProcessInbox, PlatformError::Transport("down".into()));

    assert!(memory.process_inbox(&drive(), 1).await.is_err());
    assert!(memory.process_inbox(&drive(), 1).await.is_ok());
    assert_eq!(memory.calls_of(DriveOp::ProcessInbox), 2);
}

#[tokio::test]
async fn dropped_connections_end_open_streams() {
    let memory = MemoryDrive::new();
    let mut feed = memory.subscribe(&drive()).await.expect("subscribe");

    memory.drop_connections();

    assert!(feed.next().await.is_none());
}
