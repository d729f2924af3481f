use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    checkpoint::MemoryCheckpointStore,
    codec::{encode_message, CodecLimits},
    config::{load_settings, load_settings_from, SyncSettings},
    memory::MemoryDrive,
    model::Message,
    ChatClient, ChatHandle,
};
use shared::{
    domain::{ArchivalStatus, ConversationId, DeliveryStatus, Identity, MessageId},
    now_ms,
    protocol::UploadMetadata,
};
use tracing_subscriber::EnvFilter;

/// Headless driver: syncs a scripted conversation against the in-memory drive.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "me.example")]
    me: String,
    #[arg(long, default_value = "peer.example")]
    peer: String,
    /// Messages the peer sends while this client is offline.
    #[arg(long, default_value_t = 3)]
    backlog: usize,
    /// Keep the catch-up checkpoint in memory instead of the database.
    #[arg(long)]
    memory_checkpoint: bool,
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn peer_message(conversation_id: &ConversationId, body: String) -> Message {
    let now = now_ms();
    Message {
        id: MessageId::generate(),
        conversation_id: conversation_id.clone(),
        file_id: None,
        version_tag: None,
        key_header: None,
        sender: None,
        body,
        body_truncated: false,
        reply_id: None,
        attachments: Vec::new(),
        preview_thumbnail: None,
        created: now,
        updated: now,
        received: None,
        delivery_status: DeliveryStatus::Sent,
        delivery_details: BTreeMap::new(),
        is_edited: false,
        archival_status: ArchivalStatus::Active,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings: SyncSettings = match &args.settings {
        Some(path) => load_settings_from(path, |key| std::env::var(key).ok()),
        None => load_settings(),
    };

    let me = Identity::new(&args.me);
    let peer = Identity::new(&args.peer);
    tracing::info!(me = %me, peer = %peer, backlog = args.backlog, "desktop: starting headless sync");
    let drive = Arc::new(MemoryDrive::new());
    let client = if args.memory_checkpoint {
        ChatClient::new(
            drive.clone(),
            drive.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings.clone(),
            me.clone(),
        )
    } else {
        ChatClient::with_storage(drive.clone(), drive.clone(), settings.clone(), me.clone()).await?
    };

    let conversation = client
        .create_conversation(vec![peer.clone()], None)
        .await
        .context("failed to create conversation")?;
    println!("conversation {} with {}", conversation.id, peer);

    let limits = CodecLimits::from(&settings);
    for index in 0..args.backlog {
        let message = peer_message(&conversation.id, format!("offline message {}", index + 1));
        let encoded = encode_message(&message, DeliveryStatus::Sent, &[], limits)?;
        drive.push_inbox(
            &settings.target_drive(),
            peer.clone(),
            UploadMetadata {
                version_tag: None,
                allow_distribution: true,
                sender: Some(peer.clone()),
                app_data: encoded.app_data,
            },
            encoded.payloads,
            message.created,
        );
    }

    let live = client.spawn_live();
    client.live().gate().wait().await;
    client.refresh_messages(&conversation.id).await?;

    let outcome = client
        .send(&conversation.id, "hello from the desktop driver", Vec::new())
        .await?;
    println!(
        "sent {} status={:?} failed_recipients={}",
        outcome.message.id,
        outcome.message.delivery_status,
        outcome.failed_recipients.len()
    );
    let marked = client.mark_as_read(&conversation.id).await?;
    println!("mark as read: {marked:?}");

    tokio::time::sleep(settings.live_flush_interval() + Duration::from_millis(100)).await;
    live.stop().await;

    let messages = client.list(&conversation.id).unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&messages)?);
    for failure in client.failures() {
        println!("failure #{} {}: {}", failure.id, failure.operation, failure.message);
    }
    Ok(())
}
