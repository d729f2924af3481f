//! Keyed in-memory store of conversation, message and reaction collections.
//!
//! The store is the single writer of cached state. Every mutation bumps a
//! logical clock recorded on the touched entry, and broadcasts a
//! [`CacheChange`] so readers can re-render. Operations that target a
//! collection which is not loaded never fail; they record a refetch request
//! instead.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use shared::domain::{ConversationId, DeliveryStatus, MessageId, ReactionId};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{Conversation, Message, Reaction};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ConversationList,
    Conversation(ConversationId),
    Messages(ConversationId),
    Reactions(MessageId),
}

pub trait CacheRecord: Clone {
    fn record_id(&self) -> &str;
    fn updated(&self) -> i64;
    /// Collections are ordered by this key, newest first.
    fn sort_key(&self) -> i64;
    /// Carries state that must not regress across a replacement.
    fn carry_forward(&mut self, _previous: &Self) {}
}

impl CacheRecord for Message {
    fn record_id(&self) -> &str {
        self.id.as_str()
    }

    fn updated(&self) -> i64 {
        self.updated
    }

    fn sort_key(&self) -> i64 {
        self.created
    }

    fn carry_forward(&mut self, previous: &Self) {
        // Remote snapshots may trail a status this device already observed.
        // Failed is not carried so a resend can move the message back to Sent.
        if previous.delivery_status != DeliveryStatus::Failed
            && previous.delivery_status > self.delivery_status
        {
            self.delivery_status = previous.delivery_status;
        }
    }
}

impl CacheRecord for Conversation {
    fn record_id(&self) -> &str {
        self.id.as_str()
    }

    fn updated(&self) -> i64 {
        self.updated
    }

    fn sort_key(&self) -> i64 {
        self.updated
    }
}

impl CacheRecord for Reaction {
    fn record_id(&self) -> &str {
        self.id.as_str()
    }

    fn updated(&self) -> i64 {
        self.updated
    }

    fn sort_key(&self) -> i64 {
        self.created
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation cursor for the page after this one.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedCollection<T> {
    pub pages: Vec<Page<T>>,
}

impl<T> Default for PagedCollection<T> {
    fn default() -> Self {
        Self { pages: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Replace in place when present, otherwise insert.
    Auto,
    /// A newly created record: head-insert into the first page.
    Insert,
    /// A modified record: replace in place; only inserted when it falls
    /// inside the loaded range.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Incoming record is older than the cached copy.
    Stale,
    /// Modified record outside the loaded pages.
    OutOfRange,
}

impl<T: CacheRecord> PagedCollection<T> {
    pub fn single_page(items: Vec<T>, cursor: Option<String>) -> Self {
        Self {
            pages: vec![Page { items, cursor }],
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: &str) -> Option<&T> {
        self.items().find(|item| item.record_id() == id)
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.pages.last().and_then(|page| page.cursor.as_deref())
    }

    fn position(&self, id: &str) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(page_index, page)| {
            page.items
                .iter()
                .position(|item| item.record_id() == id)
                .map(|item_index| (page_index, item_index))
        })
    }

    fn within_loaded_range(&self, record: &T) -> bool {
        if self.next_cursor().is_none() {
            return true;
        }
        self.items()
            .map(CacheRecord::sort_key)
            .min()
            .map_or(true, |oldest| record.sort_key() >= oldest)
    }

    /// Applies the insertion rule: one entry per identity across all pages,
    /// new records land in the first page in sort order, later pages and all
    /// cursors stay as they are. A record already on a later page is replaced
    /// where it sits, whatever the mode.
    pub fn upsert(&mut self, mut record: T, mode: UpsertMode) -> UpsertOutcome {
        let existing = self.position(record.record_id());

        if let Some((page_index, item_index)) = existing {
            let previous = &self.pages[page_index].items[item_index];
            if record.updated() < previous.updated() {
                return UpsertOutcome::Stale;
            }
            record.carry_forward(previous);
            if mode != UpsertMode::Insert || page_index > 0 {
                self.pages[page_index].items[item_index] = record;
                return UpsertOutcome::Replaced;
            }
            self.pages[page_index].items.remove(item_index);
        } else if mode == UpsertMode::Update && !self.within_loaded_range(&record) {
            return UpsertOutcome::OutOfRange;
        }

        if self.pages.is_empty() {
            self.pages.push(Page {
                items: Vec::new(),
                cursor: None,
            });
        }
        let first = &mut self.pages[0].items;
        let newer_than_head = first
            .first()
            .map_or(true, |head| record.sort_key() >= head.sort_key());
        first.insert(0, record);
        if !newer_than_head {
            first.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        }

        if existing.is_some() {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let (page_index, item_index) = self.position(id)?;
        Some(self.pages[page_index].items.remove(item_index))
    }

    pub fn trim_to_first_page(&mut self) {
        self.pages.truncate(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Conversations(PagedCollection<Conversation>),
    Conversation(Conversation),
    Messages(PagedCollection<Message>),
    Reactions(Vec<Reaction>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: CacheValue,
    /// Logical clock value of the last write.
    pub version: u64,
    /// Marked by invalidation; readers should refetch.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Updated(CacheKey),
    Invalidated(CacheKey),
    Removed(CacheKey),
    RefetchRequested(CacheKey),
}

/// Typed mutations folded into the store through [`CacheStore::dispatch`].
#[derive(Debug, Clone)]
pub enum CacheEvent {
    MessageUpserted {
        message: Message,
        mode: UpsertMode,
    },
    MessagesUpserted {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ConversationUpserted {
        conversation: Conversation,
        mode: UpsertMode,
    },
    ReactionUpserted(Reaction),
    ReactionRemoved {
        message_id: MessageId,
        reaction_id: ReactionId,
    },
    ReactionsInvalidated {
        message_id: MessageId,
    },
    MessagesInvalidated {
        conversation_id: ConversationId,
    },
    ConversationInvalidated {
        conversation_id: ConversationId,
    },
    ConversationListInvalidated,
    /// Trims every message collection to its first page and marks it stale.
    AllMessagesInvalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    Unchanged,
    /// Target collection not loaded; a refetch was requested.
    RefetchRequested,
}

/// Proof that a fetch was started; stale tokens are refused on apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchToken {
    key: CacheKey,
    epoch: u64,
}

impl FetchToken {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    epochs: HashMap<CacheKey, u64>,
    refetch: HashSet<CacheKey>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn bump_epoch(&mut self, key: &CacheKey) -> u64 {
        let epoch = self.epochs.entry(key.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }
}

pub struct CacheStore {
    state: RwLock<CacheState>,
    changes: broadcast::Sender<CacheChange>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(CacheState::default()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: CacheChange) {
        let _ = self.changes.send(change);
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.read().entries.get(key).cloned()
    }

    pub fn set(&self, key: CacheKey, value: CacheValue) {
        {
            let mut state = self.state.write();
            let version = state.tick();
            state.refetch.remove(&key);
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    version,
                    stale: false,
                },
            );
        }
        self.notify(CacheChange::Updated(key));
    }

    /// Puts back an entry exactly as it was captured, or removes the key
    /// when nothing was cached.
    pub fn restore(&self, key: CacheKey, entry: Option<CacheEntry>) {
        {
            let mut state = self.state.write();
            match entry {
                Some(entry) => {
                    state.entries.insert(key.clone(), entry);
                }
                None => {
                    state.entries.remove(&key);
                }
            }
        }
        self.notify(CacheChange::Updated(key));
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let found = {
            let mut state = self.state.write();
            state.bump_epoch(key);
            let version = state.tick();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.stale = true;
                    entry.version = version;
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify(CacheChange::Invalidated(key.clone()));
        }
        found
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = {
            let mut state = self.state.write();
            state.bump_epoch(key);
            state.entries.remove(key)
        };
        if removed.is_some() {
            self.notify(CacheChange::Removed(key.clone()));
        }
        removed
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.state
            .read()
            .entries
            .get(key)
            .map_or(true, |entry| entry.stale)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.state.read().entries.keys().cloned().collect()
    }

    fn request_refetch(&self, key: CacheKey) -> DispatchOutcome {
        debug!(?key, "sync: collection not loaded, refetch requested");
        self.state.write().refetch.insert(key.clone());
        self.notify(CacheChange::RefetchRequested(key));
        DispatchOutcome::RefetchRequested
    }

    /// Keys whose collections were targeted while not loaded.
    pub fn take_refetch_requests(&self) -> Vec<CacheKey> {
        self.state.write().refetch.drain().collect()
    }

    pub fn begin_fetch(&self, key: CacheKey) -> FetchToken {
        let epoch = self.state.write().bump_epoch(&key);
        FetchToken { key, epoch }
    }

    /// Applies a fetch result unless a newer fetch or an invalidation
    /// happened since `token` was issued. Returns whether it was applied.
    pub fn apply_fetch(
        &self,
        token: &FetchToken,
        apply: impl FnOnce(Option<CacheValue>) -> CacheValue,
    ) -> bool {
        {
            let mut state = self.state.write();
            if state.epochs.get(&token.key).copied().unwrap_or(0) != token.epoch {
                debug!(key = ?token.key, "sync: discarding superseded fetch result");
                return false;
            }
            let current = state.entries.get(&token.key).map(|entry| entry.value.clone());
            let value = apply(current);
            let version = state.tick();
            state.refetch.remove(&token.key);
            state.entries.insert(
                token.key.clone(),
                CacheEntry {
                    value,
                    version,
                    stale: false,
                },
            );
        }
        self.notify(CacheChange::Updated(token.key.clone()));
        true
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Option<PagedCollection<Message>> {
        match self
            .get(&CacheKey::Messages(conversation_id.clone()))
            .map(|entry| entry.value)
        {
            Some(CacheValue::Messages(collection)) => Some(collection),
            _ => None,
        }
    }

    pub fn message(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        self.messages(conversation_id)
            .and_then(|collection| collection.find(message_id.as_str()).cloned())
    }

    pub fn conversations(&self) -> Option<PagedCollection<Conversation>> {
        match self.get(&CacheKey::ConversationList).map(|entry| entry.value) {
            Some(CacheValue::Conversations(collection)) => Some(collection),
            _ => None,
        }
    }

    /// Looks at the single-conversation entry first, then the list.
    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        if let Some(CacheValue::Conversation(conversation)) = self
            .get(&CacheKey::Conversation(conversation_id.clone()))
            .map(|entry| entry.value)
        {
            return Some(conversation);
        }
        self.conversations()
            .and_then(|collection| collection.find(conversation_id.as_str()).cloned())
    }

    pub fn reactions(&self, message_id: &MessageId) -> Option<Vec<Reaction>> {
        match self
            .get(&CacheKey::Reactions(message_id.clone()))
            .map(|entry| entry.value)
        {
            Some(CacheValue::Reactions(reactions)) => Some(reactions),
            _ => None,
        }
    }

    /// Edits the value at `key` in place under the write lock.
    /// Returns `None` when the key is not cached.
    fn modify<R>(&self, key: &CacheKey, edit: impl FnOnce(&mut CacheValue) -> (bool, R)) -> Option<R> {
        let (changed, result) = {
            let mut state = self.state.write();
            let version = state.clock + 1;
            let entry = state.entries.get_mut(key)?;
            let (changed, result) = edit(&mut entry.value);
            if changed {
                entry.version = version;
                state.clock = version;
            }
            (changed, result)
        };
        if changed {
            self.notify(CacheChange::Updated(key.clone()));
        }
        Some(result)
    }

    fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
        mode: UpsertMode,
    ) -> DispatchOutcome {
        let key = CacheKey::Messages(conversation_id.clone());
        let applied = self.modify(&key, |value| match value {
            CacheValue::Messages(collection) => {
                let mut changed = false;
                for message in messages {
                    let outcome = collection.upsert(message, mode);
                    debug!(conversation_id = %conversation_id, ?outcome, "sync: message upsert");
                    changed |= matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Replaced);
                }
                (changed, changed)
            }
            _ => (false, false),
        });
        match applied {
            Some(true) => DispatchOutcome::Applied,
            Some(false) => DispatchOutcome::Unchanged,
            None => self.request_refetch(key),
        }
    }

    fn upsert_conversation(&self, conversation: Conversation, mode: UpsertMode) -> DispatchOutcome {
        let single_key = CacheKey::Conversation(conversation.id.clone());
        let single_is_newer = match self.get(&single_key).map(|entry| entry.value) {
            Some(CacheValue::Conversation(existing)) => existing.updated > conversation.updated,
            _ => false,
        };
        if !single_is_newer {
            self.set(single_key, CacheValue::Conversation(conversation.clone()));
        }

        let list_result = self.modify(&CacheKey::ConversationList, |value| match value {
            CacheValue::Conversations(collection) => {
                let outcome = collection.upsert(conversation, mode);
                let changed = matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Replaced);
                if changed {
                    if let Some(first) = collection.pages.first_mut() {
                        first.items.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
                    }
                }
                (changed, changed)
            }
            _ => (false, false),
        });
        if !single_is_newer || list_result.unwrap_or(false) {
            DispatchOutcome::Applied
        } else {
            DispatchOutcome::Unchanged
        }
    }

    pub fn dispatch(&self, event: CacheEvent) -> DispatchOutcome {
        match event {
            CacheEvent::MessageUpserted { message, mode } => {
                let conversation_id = message.conversation_id.clone();
                self.upsert_messages(&conversation_id, vec![message], mode)
            }
            CacheEvent::MessagesUpserted {
                conversation_id,
                messages,
            } => {
                if messages.is_empty() {
                    return DispatchOutcome::Unchanged;
                }
                self.upsert_messages(&conversation_id, messages, UpsertMode::Auto)
            }
            CacheEvent::MessageRemoved {
                conversation_id,
                message_id,
            } => {
                let key = CacheKey::Messages(conversation_id);
                match self.modify(&key, |value| match value {
                    CacheValue::Messages(collection) => {
                        let removed = collection.remove(message_id.as_str()).is_some();
                        (removed, removed)
                    }
                    _ => (false, false),
                }) {
                    Some(true) => DispatchOutcome::Applied,
                    _ => DispatchOutcome::Unchanged,
                }
            }
            CacheEvent::ConversationUpserted { conversation, mode } => {
                self.upsert_conversation(conversation, mode)
            }
            CacheEvent::ReactionUpserted(reaction) => {
                let key = CacheKey::Reactions(reaction.message_id.clone());
                let applied = self.modify(&key, |value| match value {
                    CacheValue::Reactions(reactions) => {
                        reactions.retain(|existing| existing.id != reaction.id);
                        reactions.push(reaction);
                        (true, ())
                    }
                    _ => (false, ()),
                });
                match applied {
                    Some(()) => DispatchOutcome::Applied,
                    None => self.request_refetch(key),
                }
            }
            CacheEvent::ReactionRemoved {
                message_id,
                reaction_id,
            } => {
                let key = CacheKey::Reactions(message_id);
                match self.modify(&key, |value| match value {
                    CacheValue::Reactions(reactions) => {
                        let before = reactions.len();
                        reactions.retain(|existing| existing.id != reaction_id);
                        let removed = reactions.len() != before;
                        (removed, removed)
                    }
                    _ => (false, false),
                }) {
                    Some(true) => DispatchOutcome::Applied,
                    _ => DispatchOutcome::Unchanged,
                }
            }
            CacheEvent::ReactionsInvalidated { message_id } => {
                self.invalidate_or_refetch(CacheKey::Reactions(message_id))
            }
            CacheEvent::MessagesInvalidated { conversation_id } => {
                self.invalidate_or_refetch(CacheKey::Messages(conversation_id))
            }
            CacheEvent::ConversationInvalidated { conversation_id } => {
                self.invalidate_or_refetch(CacheKey::Conversation(conversation_id))
            }
            CacheEvent::ConversationListInvalidated => {
                self.invalidate_or_refetch(CacheKey::ConversationList)
            }
            CacheEvent::AllMessagesInvalidated => self.invalidate_all_messages(),
        }
    }

    fn invalidate_or_refetch(&self, key: CacheKey) -> DispatchOutcome {
        if self.invalidate(&key) {
            DispatchOutcome::Applied
        } else {
            self.request_refetch(key)
        }
    }

    fn invalidate_all_messages(&self) -> DispatchOutcome {
        let keys: Vec<CacheKey> = {
            let mut state = self.state.write();
            let keys: Vec<CacheKey> = state
                .entries
                .keys()
                .filter(|key| matches!(key, CacheKey::Messages(_)))
                .cloned()
                .collect();
            for key in &keys {
                state.bump_epoch(key);
                let version = state.tick();
                if let Some(entry) = state.entries.get_mut(key) {
                    if let CacheValue::Messages(collection) = &mut entry.value {
                        collection.trim_to_first_page();
                    }
                    entry.stale = true;
                    entry.version = version;
                }
            }
            keys
        };
        if keys.is_empty() {
            return DispatchOutcome::Unchanged;
        }
        for key in keys {
            self.notify(CacheChange::Invalidated(key));
        }
        DispatchOutcome::Applied
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
