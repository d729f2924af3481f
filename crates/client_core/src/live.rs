//! Live notification processing.
//!
//! Every (re)connect runs an inbox catch-up before the subscription opens, so
//! the live stream only ever reports changes the catch-up window did not
//! already cover. Notifications are handled one at a time in arrival order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures::StreamExt;
use parking_lot::Mutex;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{
        DriveNotification, NotificationType, RemoteHeader, CHAT_CONVERSATION_FILE_TYPE,
        CHAT_MESSAGE_FILE_TYPE, CHAT_REACTION_FILE_TYPE,
    },
};
use tokio::{
    sync::watch,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEvent, UpsertMode},
    codec::decode_conversation,
    context::SyncContext,
    conversations::ConversationService,
    error::SyncResult,
    inbox::InboxProcessor,
    model::Message,
    platform::NotificationSource,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One-shot completion signal that can be re-armed for the next connection.
pub struct ReadinessGate {
    open: watch::Sender<bool>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn reset(&self) {
        self.open.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Own messages echoed back by the live stream, held briefly so bursts from
/// this device land in the cache as one batch.
#[derive(Default)]
struct EchoQueue {
    pending: BTreeMap<ConversationId, HashMap<MessageId, Message>>,
    len: usize,
}

impl EchoQueue {
    fn push(&mut self, message: Message) {
        let slot = self
            .pending
            .entry(message.conversation_id.clone())
            .or_default();
        match slot.get(&message.id) {
            Some(queued) if queued.updated > message.updated => {}
            Some(_) => {
                slot.insert(message.id.clone(), message);
            }
            None => {
                slot.insert(message.id.clone(), message);
                self.len += 1;
            }
        }
    }

    fn drain(&mut self) -> BTreeMap<ConversationId, HashMap<MessageId, Message>> {
        self.len = 0;
        std::mem::take(&mut self.pending)
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the loop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct LiveProcessor {
    ctx: Arc<SyncContext>,
    source: Arc<dyn NotificationSource>,
    inbox: Arc<InboxProcessor>,
    conversations: Arc<ConversationService>,
    gate: ReadinessGate,
    state: watch::Sender<ConnectionState>,
    echoes: Mutex<EchoQueue>,
}

impl LiveProcessor {
    pub fn new(
        ctx: Arc<SyncContext>,
        source: Arc<dyn NotificationSource>,
        inbox: Arc<InboxProcessor>,
        conversations: Arc<ConversationService>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            ctx,
            source,
            inbox,
            conversations,
            gate: ReadinessGate::new(),
            state,
            echoes: Mutex::new(EchoQueue::default()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "live: connection state changed");
            self.ctx.emit(ClientEvent::ConnectionChanged(next));
        }
    }

    /// Connects once and processes notifications until the stream ends. The
    /// backlog must drain first; a failed catch-up never subscribes.
    pub async fn connect_once(&self) -> SyncResult<()> {
        self.set_state(ConnectionState::Connecting);
        self.gate.reset();
        if let Err(err) = self.inbox.run().await {
            warn!("live: catch-up before subscribing failed: {err}");
            self.set_state(ConnectionState::Disconnected);
            return Err(err);
        }
        self.gate.open();

        let mut notifications = match self.source.subscribe(&self.ctx.drive).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };
        self.set_state(ConnectionState::Connected);

        let mut flush = interval(self.ctx.settings.live_flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                next = notifications.next() => match next {
                    Some(notification) => self.handle_notification(notification).await,
                    None => break,
                },
                _ = flush.tick() => {
                    self.flush_echoes();
                }
            }
        }

        self.flush_echoes();
        self.set_state(ConnectionState::Disconnected);
        info!(drive = %self.ctx.drive.key(), "live: notification stream ended");
        Ok(())
    }

    /// Keeps the live connection up, reconnecting after `reconnect_delay_ms`,
    /// until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                result = self.connect_once() => {
                    if let Err(err) = result {
                        warn!("live: connection failed: {err}");
                        self.ctx.emit(ClientEvent::Error(format!("live connection failed: {err}")));
                    }
                }
                _ = stop_requested(&mut shutdown) => break,
            }
            tokio::select! {
                _ = sleep(self.ctx.settings.reconnect_delay()) => {}
                _ = stop_requested(&mut shutdown) => break,
            }
        }
        self.flush_echoes();
        self.set_state(ConnectionState::Disconnected);
    }

    pub async fn handle_notification(&self, notification: DriveNotification) {
        let ctx = &self.ctx;
        if !notification.target_drive.matches(&ctx.drive) {
            debug!(drive = %notification.target_drive.key(), "live: ignoring notification for another drive");
            return;
        }
        let kind = notification.notification_type;
        let header = &notification.header;
        match header.file_type() {
            CHAT_MESSAGE_FILE_TYPE => self.on_message(kind, header).await,
            CHAT_REACTION_FILE_TYPE => {
                if let Some(message_id) = header.group_id() {
                    ctx.cache.dispatch(CacheEvent::ReactionsInvalidated {
                        message_id: MessageId::new(message_id),
                    });
                }
            }
            CHAT_CONVERSATION_FILE_TYPE => self.on_conversation(kind, header),
            other => debug!(file_type = other, "live: ignoring unrelated file type"),
        }
    }

    async fn on_message(&self, kind: NotificationType, header: &RemoteHeader) {
        let ctx = &self.ctx;
        let Some(group_id) = header.group_id() else {
            warn!(file_id = %header.file_id, "live: message without a conversation");
            return;
        };
        let conversation_id = ConversationId::new(group_id);

        if kind == NotificationType::FileDeleted {
            if let Some(unique_id) = header.unique_id() {
                ctx.cache.dispatch(CacheEvent::MessageRemoved {
                    conversation_id,
                    message_id: MessageId::new(unique_id),
                });
            }
            return;
        }

        // Only new messages check the owning conversation; modifications are
        // echoes of files the cache already placed.
        if kind == NotificationType::FileAdded {
            let conversation = match self.conversations.get(&conversation_id).await {
                Ok(Some(conversation)) => conversation,
                Ok(None) => {
                    warn!(conversation_id = %conversation_id, file_id = %header.file_id, "live: orphaned message, conversation unknown");
                    return;
                }
                Err(err) => {
                    warn!(conversation_id = %conversation_id, "live: orphaned message, conversation lookup failed: {err}");
                    return;
                }
            };
            if !conversation.is_active() {
                if let Err(err) = self.conversations.restore(&conversation_id).await {
                    warn!(conversation_id = %conversation_id, "live: could not restore conversation: {err}");
                }
            }
        }

        let Some(message) = ctx.materialize_message(header) else {
            warn!(conversation_id = %conversation_id, file_id = %header.file_id, "live: undecodable message, invalidating conversation");
            ctx.cache
                .dispatch(CacheEvent::MessagesInvalidated { conversation_id });
            return;
        };

        if message.is_own(&ctx.me) {
            self.queue_echo(message);
            return;
        }
        let mode = if kind == NotificationType::FileAdded {
            UpsertMode::Insert
        } else {
            UpsertMode::Update
        };
        let outcome = ctx.cache.dispatch(CacheEvent::MessageUpserted { message, mode });
        debug!(conversation_id = %conversation_id, ?outcome, "live: message applied");
    }

    fn on_conversation(&self, kind: NotificationType, header: &RemoteHeader) {
        let ctx = &self.ctx;
        match decode_conversation(header, &ctx.me) {
            Some(conversation) => {
                let mode = if kind == NotificationType::FileAdded {
                    UpsertMode::Insert
                } else {
                    UpsertMode::Update
                };
                ctx.cache
                    .dispatch(CacheEvent::ConversationUpserted { conversation, mode });
            }
            None => {
                debug!(file_id = %header.file_id, "live: conversation without content, invalidating list");
                ctx.cache.dispatch(CacheEvent::ConversationListInvalidated);
            }
        }
    }

    fn queue_echo(&self, message: Message) {
        let queued = {
            let mut echoes = self.echoes.lock();
            echoes.push(message);
            echoes.len
        };
        if queued >= self.ctx.settings.live_flush_threshold {
            self.flush_echoes();
        }
    }

    /// Applies queued own-message echoes; returns how many were flushed.
    pub fn flush_echoes(&self) -> usize {
        let pending = self.echoes.lock().drain();
        let mut flushed = 0;
        for (conversation_id, messages) in pending {
            let messages: Vec<Message> = messages.into_values().collect();
            flushed += messages.len();
            self.ctx.cache.dispatch(CacheEvent::MessagesUpserted {
                conversation_id,
                messages,
            });
        }
        if flushed > 0 {
            debug!(flushed, "live: own message echoes flushed");
        }
        flushed
    }

    pub fn pending_echoes(&self) -> usize {
        self.echoes.lock().len
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
