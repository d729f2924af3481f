use super::*;

use crate::test_support::{conversation, message, peer, third};

fn conv_id() -> ConversationId {
    ConversationId::new("conv-1")
}

fn ids(collection: &PagedCollection<Message>) -> Vec<String> {
    collection.items().map(|m| m.body.clone()).collect()
}

fn loaded(store: &CacheStore, messages: Vec<Message>, cursor: Option<&str>) {
    store.set(
        CacheKey::Messages(conv_id()),
        CacheValue::Messages(PagedCollection::single_page(
            messages,
            cursor.map(str::to_string),
        )),
    );
}

#[test]
fn insert_lands_in_first_page_in_sort_order() {
    let mut collection = PagedCollection::single_page(
        vec![message(&conv_id(), "30", 30), message(&conv_id(), "10", 10)],
        None,
    );

    assert_eq!(
        collection.upsert(message(&conv_id(), "40", 40), UpsertMode::Insert),
        UpsertOutcome::Inserted
    );
    assert_eq!(
        collection.upsert(message(&conv_id(), "20", 20), UpsertMode::Insert),
        UpsertOutcome::Inserted
    );

    assert_eq!(ids(&collection), vec!["40", "30", "20", "10"]);
}

#[test]
fn one_entry_per_identity_across_pages() {
    let old = message(&conv_id(), "old", 5);
    let mut collection = PagedCollection {
        pages: vec![
            Page {
                items: vec![message(&conv_id(), "new", 50)],
                cursor: Some("1".into()),
            },
            Page {
                items: vec![old.clone()],
                cursor: Some("2".into()),
            },
        ],
    };

    let mut edited = old.clone();
    edited.body = "edited".into();
    edited.updated = 60;
    assert_eq!(collection.upsert(edited.clone(), UpsertMode::Auto), UpsertOutcome::Replaced);
    assert_eq!(collection.len(), 2);
    assert_eq!(collection.pages[1].items[0].body, "edited");

    // Insert mode leaves a later-page record where it is.
    let mut again = edited;
    again.body = "edited twice".into();
    again.updated = 70;
    assert_eq!(collection.upsert(again, UpsertMode::Insert), UpsertOutcome::Replaced);
    assert_eq!(collection.len(), 2);
    assert_eq!(ids(&collection), vec!["new", "edited twice"]);
    assert_eq!(collection.pages[0].items.len(), 1);
    assert_eq!(collection.pages[0].cursor.as_deref(), Some("1"));
    assert_eq!(collection.next_cursor(), Some("2"));
}

#[test]
fn insert_of_first_page_record_keeps_sort_order() {
    let moved = message(&conv_id(), "moved", 20);
    let mut collection = PagedCollection {
        pages: vec![
            Page {
                items: vec![message(&conv_id(), "30", 30), moved.clone()],
                cursor: Some("1".into()),
            },
            Page {
                items: vec![message(&conv_id(), "5", 5)],
                cursor: None,
            },
        ],
    };

    let mut newer = moved;
    newer.created = 40;
    newer.updated = 40;
    assert_eq!(collection.upsert(newer, UpsertMode::Insert), UpsertOutcome::Replaced);

    assert_eq!(ids(&collection), vec!["moved", "30", "5"]);
    assert_eq!(collection.pages[1].items.len(), 1);
}

#[test]
fn older_snapshot_is_stale() {
    let mut current = message(&conv_id(), "current", 10);
    current.updated = 100;
    let mut collection = PagedCollection::single_page(vec![current.clone()], None);

    let mut older = current.clone();
    older.body = "older".into();
    older.updated = 90;

    assert_eq!(collection.upsert(older, UpsertMode::Auto), UpsertOutcome::Stale);
    assert_eq!(collection.find(current.id.as_str()).map(|m| m.body.as_str()), Some("current"));
}

#[test]
fn update_outside_loaded_range_is_dropped() {
    let mut collection =
        PagedCollection::single_page(vec![message(&conv_id(), "50", 50)], Some("more".into()));

    assert_eq!(
        collection.upsert(message(&conv_id(), "10", 10), UpsertMode::Update),
        UpsertOutcome::OutOfRange
    );
    assert_eq!(
        collection.upsert(message(&conv_id(), "60", 60), UpsertMode::Update),
        UpsertOutcome::Inserted
    );

    // Without a continuation cursor everything is in range.
    let mut complete = PagedCollection::single_page(vec![message(&conv_id(), "50", 50)], None);
    assert_eq!(
        complete.upsert(message(&conv_id(), "10", 10), UpsertMode::Update),
        UpsertOutcome::Inserted
    );
}

#[test]
fn delivery_status_does_not_regress_except_from_failed() {
    let mut delivered = message(&conv_id(), "m", 10);
    delivered.delivery_status = DeliveryStatus::Delivered;
    let mut collection = PagedCollection::single_page(vec![delivered.clone()], None);

    let mut snapshot = delivered.clone();
    snapshot.delivery_status = DeliveryStatus::Sent;
    collection.upsert(snapshot, UpsertMode::Auto);
    assert_eq!(
        collection.find(delivered.id.as_str()).map(|m| m.delivery_status),
        Some(DeliveryStatus::Delivered)
    );

    let mut failed = delivered.clone();
    failed.delivery_status = DeliveryStatus::Failed;
    collection.upsert(failed.clone(), UpsertMode::Auto);
    let mut resent = failed;
    resent.delivery_status = DeliveryStatus::Sent;
    collection.upsert(resent, UpsertMode::Auto);
    assert_eq!(
        collection.find(delivered.id.as_str()).map(|m| m.delivery_status),
        Some(DeliveryStatus::Sent)
    );
}

#[test]
fn dispatch_into_unloaded_collection_requests_refetch() {
    let store = CacheStore::new();
    let mut changes = store.subscribe();

    let outcome = store.dispatch(CacheEvent::MessageUpserted {
        message: message(&conv_id(), "m", 1),
        mode: UpsertMode::Insert,
    });

    assert_eq!(outcome, DispatchOutcome::RefetchRequested);
    assert!(store.messages(&conv_id()).is_none());
    assert_eq!(
        changes.try_recv().expect("change"),
        CacheChange::RefetchRequested(CacheKey::Messages(conv_id()))
    );
    assert_eq!(store.take_refetch_requests(), vec![CacheKey::Messages(conv_id())]);
    assert!(store.take_refetch_requests().is_empty());
}

#[test]
fn batch_upsert_applies_once_and_bumps_version() {
    let store = CacheStore::new();
    loaded(&store, Vec::new(), None);
    let before = store.get(&CacheKey::Messages(conv_id())).expect("entry").version;

    let outcome = store.dispatch(CacheEvent::MessagesUpserted {
        conversation_id: conv_id(),
        messages: vec![message(&conv_id(), "a", 1), message(&conv_id(), "b", 2)],
    });

    assert_eq!(outcome, DispatchOutcome::Applied);
    let entry = store.get(&CacheKey::Messages(conv_id())).expect("entry");
    assert!(entry.version > before);
    match entry.value {
        CacheValue::Messages(collection) => assert_eq!(ids(&collection), vec!["b", "a"]),
        other => panic!("unexpected value {other:?}"),
    }

    assert_eq!(
        store.dispatch(CacheEvent::MessagesUpserted {
            conversation_id: conv_id(),
            messages: Vec::new(),
        }),
        DispatchOutcome::Unchanged
    );
}

#[test]
fn removing_unknown_message_is_unchanged() {
    let store = CacheStore::new();
    let kept = message(&conv_id(), "kept", 1);
    loaded(&store, vec![kept.clone()], None);

    assert_eq!(
        store.dispatch(CacheEvent::MessageRemoved {
            conversation_id: conv_id(),
            message_id: MessageId::new("missing"),
        }),
        DispatchOutcome::Unchanged
    );
    assert_eq!(
        store.dispatch(CacheEvent::MessageRemoved {
            conversation_id: conv_id(),
            message_id: kept.id.clone(),
        }),
        DispatchOutcome::Applied
    );
    assert!(store.message(&conv_id(), &kept.id).is_none());
}

#[test]
fn all_messages_invalidated_trims_to_first_page() {
    let store = CacheStore::new();
    store.set(
        CacheKey::Messages(conv_id()),
        CacheValue::Messages(PagedCollection {
            pages: vec![
                Page {
                    items: vec![message(&conv_id(), "new", 20)],
                    cursor: Some("1".into()),
                },
                Page {
                    items: vec![message(&conv_id(), "old", 10)],
                    cursor: None,
                },
            ],
        }),
    );
    store.set(
        CacheKey::ConversationList,
        CacheValue::Conversations(PagedCollection::default()),
    );

    assert_eq!(store.dispatch(CacheEvent::AllMessagesInvalidated), DispatchOutcome::Applied);

    let collection = store.messages(&conv_id()).expect("still cached");
    assert_eq!(collection.pages.len(), 1);
    assert_eq!(ids(&collection), vec!["new"]);
    assert!(store.is_stale(&CacheKey::Messages(conv_id())));
    assert!(!store.is_stale(&CacheKey::ConversationList));
}

#[test]
fn fetch_superseded_by_invalidation_is_discarded() {
    let store = CacheStore::new();
    let key = CacheKey::Messages(conv_id());
    let token = store.begin_fetch(key.clone());
    loaded(&store, vec![message(&conv_id(), "live", 5)], None);
    store.invalidate(&key);

    let applied = store.apply_fetch(&token, |_| {
        CacheValue::Messages(PagedCollection::single_page(Vec::new(), None))
    });

    assert!(!applied);
    assert_eq!(store.messages(&conv_id()).map(|c| c.len()), Some(1));
}

#[test]
fn newer_fetch_wins_over_older_one() {
    let store = CacheStore::new();
    let key = CacheKey::Messages(conv_id());
    let first = store.begin_fetch(key.clone());
    let second = store.begin_fetch(key.clone());

    assert!(store.apply_fetch(&second, |_| {
        CacheValue::Messages(PagedCollection::single_page(
            vec![message(&conv_id(), "second", 2)],
            None,
        ))
    }));
    assert!(!store.apply_fetch(&first, |_| {
        CacheValue::Messages(PagedCollection::single_page(
            vec![message(&conv_id(), "first", 1)],
            None,
        ))
    }));
    let collection = store.messages(&conv_id()).expect("cached");
    assert_eq!(ids(&collection), vec!["second"]);
    assert!(!store.is_stale(&key));
}

#[test]
fn conversation_upsert_updates_entry_and_list() {
    let store = CacheStore::new();
    let older = conversation(&[peer()], 0);
    let mut newer = conversation(&[third()], 0);
    newer.updated = 10;
    store.set(
        CacheKey::ConversationList,
        CacheValue::Conversations(PagedCollection::single_page(vec![newer.clone()], None)),
    );

    let mut bumped = older.clone();
    bumped.updated = 20;
    assert_eq!(
        store.dispatch(CacheEvent::ConversationUpserted {
            conversation: bumped.clone(),
            mode: UpsertMode::Insert,
        }),
        DispatchOutcome::Applied
    );

    let list: Vec<ConversationId> = store
        .conversations()
        .expect("list")
        .items()
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(list, vec![bumped.id.clone(), newer.id.clone()]);
    assert_eq!(store.conversation(&bumped.id), Some(bumped.clone()));

    // A stale copy neither replaces the entry nor the list item.
    assert_eq!(
        store.dispatch(CacheEvent::ConversationUpserted {
            conversation: older,
            mode: UpsertMode::Update,
        }),
        DispatchOutcome::Unchanged
    );
    assert_eq!(store.conversation(&bumped.id).map(|c| c.updated), Some(20));
}

#[test]
fn reactions_replace_by_id() {
    let store = CacheStore::new();
    let message_id = MessageId::new("m-1");
    let reaction = Reaction {
        id: ReactionId::new("r-1"),
        message_id: message_id.clone(),
        file_id: None,
        sender: None,
        emoji: "👍".into(),
        created: 1,
        updated: 1,
    };

    assert_eq!(
        store.dispatch(CacheEvent::ReactionUpserted(reaction.clone())),
        DispatchOutcome::RefetchRequested
    );
    store.set(CacheKey::Reactions(message_id.clone()), CacheValue::Reactions(Vec::new()));
    store.dispatch(CacheEvent::ReactionUpserted(reaction.clone()));
    let mut changed = reaction.clone();
    changed.emoji = "🎉".into();
    store.dispatch(CacheEvent::ReactionUpserted(changed));

    let reactions = store.reactions(&message_id).expect("cached");
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].emoji, "🎉");

    assert_eq!(
        store.dispatch(CacheEvent::ReactionRemoved {
            message_id: message_id.clone(),
            reaction_id: reaction.id,
        }),
        DispatchOutcome::Applied
    );
    assert_eq!(store.reactions(&message_id).map(|r| r.len()), Some(0));
}
