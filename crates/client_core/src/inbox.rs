//! Inbox catch-up: drains the platform's transit backlog, then reconciles the
//! cache with everything created or modified since the last successful run.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::ConversationId,
    now_ms,
    protocol::{
        QueryBatchOptions, QueryModifiedOptions, RemoteHeader, TimeWindow,
        CHAT_CONVERSATION_FILE_TYPE, CHAT_MESSAGE_FILE_TYPE,
    },
};
use storage::{CatchUpMode, CatchUpRun};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEvent, DispatchOutcome, UpsertMode},
    checkpoint::CheckpointStore,
    codec::decode_conversation,
    context::SyncContext,
    error::{SyncError, SyncResult},
    model::Message,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpState {
    Idle,
    Draining,
    CaughtUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub mode: CatchUpMode,
    pub inbox_popped: u32,
    /// Records dispatched into the cache; zero for a wholesale invalidation.
    pub records_applied: u32,
    pub started_at: i64,
    pub finished_at: i64,
}

pub struct InboxProcessor {
    ctx: Arc<SyncContext>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Mutex<CatchUpState>,
}

/// Puts the processor back to `Idle` when a run ends without finishing.
struct DrainGuard<'a> {
    state: &'a Mutex<CatchUpState>,
    finished: bool,
}

impl DrainGuard<'_> {
    fn finish(mut self) {
        self.finished = true;
        *self.state.lock() = CatchUpState::CaughtUp;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = CatchUpState::Idle;
        }
    }
}

/// Keeps one header per unique id, preferring the most recently updated.
fn dedup_latest(headers: impl IntoIterator<Item = RemoteHeader>) -> Vec<RemoteHeader> {
    let mut latest: HashMap<String, RemoteHeader> = HashMap::new();
    for header in headers {
        let key = header
            .unique_id()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| header.file_id.to_string());
        match latest.get(&key) {
            Some(existing) if existing.metadata.updated >= header.metadata.updated => {}
            _ => {
                latest.insert(key, header);
            }
        }
    }
    let mut headers: Vec<RemoteHeader> = latest.into_values().collect();
    headers.sort_by(|a, b| a.metadata.created.cmp(&b.metadata.created));
    headers
}

impl InboxProcessor {
    pub fn new(ctx: Arc<SyncContext>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            ctx,
            checkpoints,
            state: Mutex::new(CatchUpState::Idle),
        }
    }

    pub fn state(&self) -> CatchUpState {
        *self.state.lock()
    }

    fn begin(&self) -> SyncResult<DrainGuard<'_>> {
        let mut state = self.state.lock();
        if *state == CatchUpState::Draining {
            return Err(SyncError::InProgress("inbox catch-up"));
        }
        *state = CatchUpState::Draining;
        Ok(DrainGuard {
            state: &self.state,
            finished: false,
        })
    }

    /// Runs one catch-up pass. The checkpoint only advances when the backlog
    /// was drained; failed window queries fall back to invalidating every
    /// message collection.
    pub async fn run(&self) -> SyncResult<CatchUpReport> {
        let guard = self.begin()?;
        let ctx = &self.ctx;
        let drive_key = ctx.drive.key();
        let started_at = now_ms();

        let inbox = ctx
            .platform
            .process_inbox(&ctx.drive, ctx.settings.inbox_batch_size)
            .await
            .map_err(|err| {
                warn!(drive = %drive_key, "inbox: backlog processing failed: {err}");
                SyncError::from(err)
            })?;
        debug!(
            popped = inbox.popped_count,
            remaining = inbox.total_items,
            "inbox: backlog processed"
        );

        let checkpoint = match self.checkpoints.load_checkpoint(&drive_key).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(drive = %drive_key, "inbox: checkpoint unreadable, treating as cold start: {err}");
                None
            }
        };
        let usable = checkpoint.filter(|at| started_at - *at <= ctx.settings.max_catch_up_age_ms);
        if checkpoint.is_some() && usable.is_none() {
            info!(drive = %drive_key, "inbox: checkpoint too old for a windowed catch-up");
        }

        let windowed = match usable {
            Some(checkpoint) => match self.windowed_catch_up(checkpoint, started_at).await {
                Ok(applied) => Some(applied),
                Err(err) => {
                    warn!(drive = %drive_key, "inbox: safety-window query failed: {err}");
                    None
                }
            },
            None => None,
        };
        let (mode, records_applied) = match windowed {
            Some(applied) => (CatchUpMode::Windowed, applied),
            None => {
                ctx.cache.dispatch(CacheEvent::AllMessagesInvalidated);
                (CatchUpMode::Invalidated, 0)
            }
        };

        if let Err(err) = self.checkpoints.save_checkpoint(&drive_key, started_at).await {
            warn!(drive = %drive_key, "inbox: checkpoint not saved: {err}");
        }
        let finished_at = now_ms();
        let run = CatchUpRun {
            drive_key: drive_key.clone(),
            mode,
            started_at_ms: started_at,
            finished_at_ms: finished_at,
            inbox_popped: inbox.popped_count,
            records_applied,
        };
        if let Err(err) = self.checkpoints.record_run(&run).await {
            debug!(drive = %drive_key, "inbox: run history not recorded: {err}");
        }
        guard.finish();

        let report = CatchUpReport {
            mode,
            inbox_popped: inbox.popped_count,
            records_applied,
            started_at,
            finished_at,
        };
        info!(
            drive = %drive_key,
            mode = %mode,
            popped = report.inbox_popped,
            applied = report.records_applied,
            "inbox: caught up"
        );
        ctx.emit(ClientEvent::CatchUpFinished(report.clone()));
        Ok(report)
    }

    /// Queries records created or modified since shortly before `checkpoint`
    /// and folds them into the cache. Returns the number of records applied.
    async fn windowed_catch_up(&self, checkpoint: i64, now: i64) -> SyncResult<u32> {
        let ctx = &self.ctx;
        let since = checkpoint - ctx.settings.safety_window_ms;

        let created = ctx
            .platform
            .query_batch(
                &ctx.query_params(&[CHAT_MESSAGE_FILE_TYPE], Vec::new()),
                &QueryBatchOptions {
                    max_records: ctx.settings.inbox_batch_size,
                    cursor_state: None,
                    created_window: Some(TimeWindow {
                        oldest: since,
                        newest: now,
                    }),
                    include_metadata_header: true,
                    include_transfer_history: true,
                },
            )
            .await?;
        let modified = ctx
            .platform
            .query_modified(
                &ctx.query_params(&[CHAT_MESSAGE_FILE_TYPE, CHAT_CONVERSATION_FILE_TYPE], Vec::new()),
                &QueryModifiedOptions {
                    max_records: ctx.settings.inbox_batch_size,
                    cursor: since,
                    include_header_content: true,
                    include_transfer_history: true,
                },
            )
            .await?;

        let headers = dedup_latest(
            created
                .search_results
                .into_iter()
                .chain(modified.search_results),
        );
        let (conversations, messages): (Vec<_>, Vec<_>) = headers
            .into_iter()
            .partition(|header| header.file_type() == CHAT_CONVERSATION_FILE_TYPE);

        let mut applied = 0u32;
        // Conversations first so message decoding sees current recipients.
        for header in &conversations {
            let Some(conversation) = decode_conversation(header, &ctx.me) else {
                ctx.cache.dispatch(CacheEvent::ConversationListInvalidated);
                continue;
            };
            if ctx.cache.dispatch(CacheEvent::ConversationUpserted {
                conversation,
                mode: UpsertMode::Auto,
            }) == DispatchOutcome::Applied
            {
                applied += 1;
            }
        }

        let mut grouped: BTreeMap<ConversationId, Vec<Message>> = BTreeMap::new();
        for header in &messages {
            match ctx.materialize_message(header) {
                Some(message) => grouped
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .push(message),
                None => {
                    if let Some(group_id) = header.group_id() {
                        warn!(file_id = %header.file_id, "inbox: undecodable message, invalidating its conversation");
                        ctx.cache.dispatch(CacheEvent::MessagesInvalidated {
                            conversation_id: ConversationId::new(group_id),
                        });
                    }
                }
            }
        }
        for (conversation_id, messages) in grouped {
            let count = messages.len() as u32;
            if ctx.cache.dispatch(CacheEvent::MessagesUpserted {
                conversation_id,
                messages,
            }) == DispatchOutcome::Applied
            {
                applied += count;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
#[path = "tests/inbox_tests.rs"]
mod tests;
