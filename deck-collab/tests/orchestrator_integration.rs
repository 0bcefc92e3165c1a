//! Shard residency and multi-actor editing through the orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use common::{eventually, hub_context, ids, slide, RefusingConnector};
use deck_collab::{
    CollabContext, DeckEvent, DocumentShardOrchestrator, Identity, LoadMode, RoomHub, ShardState, SyncConfig,
    SyncError,
};
use deck_core::{ComponentPatch, MetadataPatch, SlidePatch};

/// Wait for the first event matching `want`.
async fn next_matching(events: &mut Receiver<DeckEvent>, want: impl Fn(&DeckEvent) -> bool) -> bool {
    let found = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => break true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break false,
            }
        }
    })
    .await;
    matches!(found, Ok(true))
}

fn state_of(orch: &DocumentShardOrchestrator, shard_id: usize) -> ShardState {
    orch.shard_states()[shard_id].state
}

#[tokio::test]
async fn test_idle_unload_spares_visible_shards() {
    let hub = Arc::new(RoomHub::with_defaults());
    let ctx = hub_context(&hub, "alice", |c| {
        c.shards.slides_per_shard = 1;
        c.shards.max_loaded_documents = 2;
        c.pool.max_connections = 5;
    });
    let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
    orch.initialize(&ids(3));

    orch.set_visible_slides(&["s0".to_string()], LoadMode::Sync).await;
    assert_eq!(state_of(&orch, 0), ShardState::Loaded);
    tokio::time::sleep(Duration::from_millis(5)).await;
    orch.load_document_for_slide("s1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    orch.load_document_for_slide("s2").await.unwrap();
    assert_eq!(orch.loaded_count(), 3);

    // Shard 0 is the oldest but visible, so shard 1 goes
    assert_eq!(orch.unload_idle_documents().await, 1);
    assert_eq!(state_of(&orch, 0), ShardState::Loaded);
    assert_eq!(state_of(&orch, 1), ShardState::Unloaded);
    assert_eq!(state_of(&orch, 2), ShardState::Loaded);
    assert_eq!(orch.unload_idle_documents().await, 0);

    // Unloaded shards come back on demand
    orch.load_document_for_slide("s1").await.unwrap();
    assert_eq!(state_of(&orch, 1), ShardState::Loaded);

    orch.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_prioritize_current_loads_rest_in_background() {
    let hub = Arc::new(RoomHub::with_defaults());
    let ctx = hub_context(&hub, "alice", |c| c.shards.slides_per_shard = 1);
    let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
    orch.initialize(&ids(2));
    let mut events = ctx.subscribe();

    orch.set_visible_slides(&ids(2), LoadMode::PrioritizeCurrent).await;
    assert_eq!(state_of(&orch, 0), ShardState::Loaded);
    assert!(!state_of(&orch, 1).is_loaded());

    assert!(next_matching(&mut events, |e| matches!(e, DeckEvent::ShardLoaded { shard_id: 1, .. })).await);
    assert_eq!(state_of(&orch, 1), ShardState::Loaded);
    assert_eq!(orch.visible_slides(), ids(2));
    assert!(orch.shard_states().iter().all(|s| s.visible));

    orch.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_full_pool_unloads_least_recent_shard() {
    let hub = Arc::new(RoomHub::with_defaults());
    let ctx = hub_context(&hub, "alice", |c| {
        c.shards.slides_per_shard = 1;
        c.pool.max_connections = 2;
    });
    let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
    orch.initialize(&ids(3));

    orch.load_document_for_slide("s0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    orch.load_document_for_slide("s1").await.unwrap();
    orch.load_document_for_slide("s2").await.unwrap();

    assert_eq!(state_of(&orch, 0), ShardState::Unloaded);
    assert_eq!(state_of(&orch, 1), ShardState::Loaded);
    assert_eq!(state_of(&orch, 2), ShardState::Loaded);
    let status = ctx.pool().status();
    assert_eq!(status.active, 2);
    assert_eq!(status.active + status.idle + status.creating, 2);

    orch.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_load_can_be_retried() {
    let hub = Arc::new(RoomHub::with_defaults());
    let ctx = hub_context(&hub, "alice", |c| {
        c.shards.slides_per_shard = 1;
        c.pool.max_connections = 1;
    });
    let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
    orch.initialize(&ids(2));
    orch.set_visible_slides(&["s0".to_string()], LoadMode::Sync).await;
    assert_eq!(state_of(&orch, 0), ShardState::Loaded);

    // Shard 0 is pinned, so shard 1 queues for the only connection. The
    // first load is abandoned while a second caller waits on it.
    let (cancelled, waiter) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(50), orch.load_document_for_slide("s1")),
        orch.load_document_for_slide("s1"),
    );
    assert!(cancelled.is_err());
    let Err(err) = waiter else {
        panic!("the waiting load should fail with its leader");
    };
    assert!(matches!(&err, SyncError::ShardUnavailable { slide_id } if slide_id == "s1"));
    assert_eq!(err.to_string(), "shard for slide s1 is unavailable");
    assert_eq!(state_of(&orch, 1), ShardState::NotLoaded);
    assert_eq!(ctx.pool().status().queued, 0);

    orch.set_visible_slides(&[], LoadMode::Async).await;
    orch.load_document_for_slide("s1").await.unwrap();
    assert_eq!(state_of(&orch, 0), ShardState::Unloaded);
    assert_eq!(state_of(&orch, 1), ShardState::Loaded);

    orch.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_load_reports_shard_error() {
    let ctx = CollabContext::new(
        SyncConfig::default(),
        Identity::new("alice", "Alice"),
        Arc::new(RefusingConnector::default()),
    );
    let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
    orch.initialize(&ids(1));
    let mut events = ctx.subscribe();

    orch.set_visible_slides(&ids(1), LoadMode::Sync).await;
    assert_eq!(state_of(&orch, 0), ShardState::NotLoaded);
    assert!(next_matching(&mut events, |e| matches!(e, DeckEvent::ShardError { shard_id: 0, .. })).await);

    // Per-slide operations degrade instead of failing loudly
    assert!(orch.get_slide_data("s0").await.is_none());
    assert!(!orch.request_lock("s0", "c1").await.granted);

    orch.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_two_actors_edit_the_same_deck() {
    let hub = Arc::new(RoomHub::with_defaults());
    let alice_ctx = hub_context(&hub, "alice", |c| {
        c.shards.slides_per_shard = 2;
        c.compressor.max_batch_delay_ms = 10;
    });
    let bob_ctx = hub_context(&hub, "bob", |c| {
        c.shards.slides_per_shard = 2;
        c.compressor.max_batch_delay_ms = 10;
    });

    let alice = DocumentShardOrchestrator::open(alice_ctx.clone(), "deck").await.unwrap();
    assert_eq!(alice.deck_metadata().unwrap().deck_id, "deck");
    assert_eq!(alice.add_slide(slide("s1", &["title"]), None).await.unwrap(), 0);
    assert_eq!(alice.add_slide(slide("s2", &["subtitle"]), None).await.unwrap(), 0);
    assert_eq!(alice.add_slide(slide("s3", &["heading"]), Some(0)).await.unwrap(), 1);
    assert_eq!(alice.slide_order(), vec!["s3", "s1", "s2"]);
    alice.flush().await.unwrap();

    let bob = DocumentShardOrchestrator::open(bob_ctx.clone(), "deck").await.unwrap();
    eventually("bob to see the slide order", || bob.slide_order().len() == 3).await;
    assert_eq!(bob.slide_order(), vec!["s3", "s1", "s2"]);
    assert_eq!(bob.shard_for_slide("s3"), Some(1));

    bob.set_visible_slides(&["s1".to_string()], LoadMode::Sync).await;
    let data = bob.get_slide_data("s1").await.unwrap();
    assert_eq!(data.slide.title, "Slide s1");
    assert_eq!(data.components.len(), 1);

    assert!(
        bob.update_component("s1", "title", &ComponentPatch::default().set("text", "Hello"))
            .await
    );
    assert!(bob.update_slide("s1", &SlidePatch::title("Welcome")).await);
    bob.flush().await.unwrap();

    let alice_shard = alice.load_document_for_slide("s1").await.unwrap();
    eventually("alice to see bob's edits", || {
        alice_shard
            .get_slide_data("s1")
            .is_some_and(|d| d.slide.title == "Welcome" && d.components[0].props["text"] == "Hello")
    })
    .await;

    alice
        .update_deck_metadata(&MetadataPatch {
            name: Some("Quarterly review".into()),
        })
        .unwrap();
    alice.move_slide("s3", 2).unwrap();
    alice.flush().await.unwrap();
    eventually("bob to see the new name", || {
        bob.deck_metadata().is_some_and(|m| m.name == "Quarterly review")
    })
    .await;
    eventually("bob to see the move", || bob.slide_order() == vec!["s1", "s2", "s3"]).await;

    for orch in [&alice, &bob] {
        orch.shutdown().await;
    }
    alice_ctx.shutdown().await;
    bob_ctx.shutdown().await;
}

#[tokio::test]
async fn test_slides_added_elsewhere_become_routable() {
    let hub = Arc::new(RoomHub::with_defaults());
    let alice_ctx = hub_context(&hub, "alice", |c| c.compressor.max_batch_delay_ms = 10);
    let bob_ctx = hub_context(&hub, "bob", |c| c.compressor.max_batch_delay_ms = 10);

    let alice = DocumentShardOrchestrator::open(alice_ctx.clone(), "deck").await.unwrap();
    let bob = DocumentShardOrchestrator::open(bob_ctx.clone(), "deck").await.unwrap();
    assert_eq!(bob.shard_for_slide("late"), None);

    alice.add_slide(slide("late", &["body"]), None).await.unwrap();
    alice.flush().await.unwrap();

    eventually("bob to route the new slide", || bob.shard_for_slide("late").is_some()).await;
    let shard = bob.load_document_for_slide("late").await.unwrap();
    eventually("the slide content to arrive", || shard.get_slide_data("late").is_some()).await;

    alice.remove_slide("late").await.unwrap();
    assert!(alice.slide_order().is_empty());
    alice.flush().await.unwrap();
    eventually("bob to see the removal", || bob.slide_order().is_empty()).await;

    for orch in [&alice, &bob] {
        orch.shutdown().await;
    }
    alice_ctx.shutdown().await;
    bob_ctx.shutdown().await;
}
