//! Component locks negotiated between two actors through one room hub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, hub_context, slide};
use tokio::sync::broadcast::error::RecvError;

use deck_collab::{CollabContext, DeckEvent, DocumentShardOrchestrator, LoadMode, RoomHub};

async fn two_actors() -> (DocumentShardOrchestrator, DocumentShardOrchestrator, Vec<Arc<CollabContext>>) {
    let hub = Arc::new(RoomHub::with_defaults());
    let alice_ctx = hub_context(&hub, "alice", |c| c.compressor.max_batch_delay_ms = 10);
    let bob_ctx = hub_context(&hub, "bob", |c| c.compressor.max_batch_delay_ms = 10);

    let alice = DocumentShardOrchestrator::open(alice_ctx.clone(), "deck").await.unwrap();
    alice.add_slide(slide("s1", &["title", "body"]), None).await.unwrap();
    alice.flush().await.unwrap();

    let bob = DocumentShardOrchestrator::open(bob_ctx.clone(), "deck").await.unwrap();
    eventually("bob to learn about s1", || bob.shard_for_slide("s1").is_some()).await;
    (alice, bob, vec![alice_ctx, bob_ctx])
}

async fn teardown(orchestrators: &[&DocumentShardOrchestrator], contexts: Vec<Arc<CollabContext>>) {
    for orch in orchestrators {
        orch.shutdown().await;
    }
    for ctx in contexts {
        ctx.shutdown().await;
    }
}

#[tokio::test]
async fn test_lock_contention_between_actors() {
    let (alice, bob, contexts) = two_actors().await;
    let mut alice_events = contexts[0].subscribe();

    let granted = alice.request_lock("s1", "body").await;
    assert!(granted.granted);
    alice.flush().await.unwrap();

    let bob_shard = bob.load_document_for_slide("s1").await.unwrap();
    eventually("bob to see alice's lock", || bob_shard.is_component_locked("s1", "body")).await;

    let denied = bob.request_lock("s1", "body").await;
    assert!(!denied.granted);
    let holder = denied.current_lock_holder.unwrap();
    assert_eq!(holder.actor_id, "alice");
    assert_eq!(holder.display_name, "Alice");

    // Alice's replica learns about the request
    bob.flush().await.unwrap();
    eventually("alice to see bob's request", || !alice.pending_lock_requests().is_empty()).await;
    let requests = alice.pending_lock_requests();
    assert_eq!(requests[0].requester_actor_id, "bob");

    let notified = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match alice_events.recv().await {
                Ok(DeckEvent::LockRequested { request }) if request.requester_actor_id == "bob" => break true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break false,
            }
        }
    })
    .await;
    assert!(matches!(notified, Ok(true)));

    assert!(alice.release_lock("s1", "body", false).await);
    alice.flush().await.unwrap();
    eventually("bob to see the release", || !bob_shard.is_component_locked("s1", "body")).await;

    let retried = bob.request_lock("s1", "body").await;
    assert!(retried.granted);
    assert!(bob.get_component_lock("s1", "body").await.is_some());

    teardown(&[&alice, &bob], contexts).await;
}

#[tokio::test]
async fn test_denied_request_disappears_for_both() {
    let (alice, bob, contexts) = two_actors().await;

    assert!(alice.request_lock("s1", "title").await.granted);
    alice.flush().await.unwrap();
    let bob_shard = bob.load_document_for_slide("s1").await.unwrap();
    eventually("bob to see alice's lock", || bob_shard.is_component_locked("s1", "title")).await;

    assert!(!bob.request_lock("s1", "title").await.granted);
    bob.flush().await.unwrap();
    eventually("alice to see bob's request", || alice.pending_lock_requests().len() == 1).await;

    let requester = alice.pending_lock_requests()[0].requester_actor_id.clone();
    assert!(!bob.deny_lock_request("s1", "title", &requester).await);
    assert!(alice.deny_lock_request("s1", "title", &requester).await);
    assert!(alice.pending_lock_requests().is_empty());

    // The lock itself is untouched
    assert!(alice.is_component_locked("s1", "title").await);

    teardown(&[&alice, &bob], contexts).await;
}

#[tokio::test]
async fn test_locks_on_other_components_are_independent() {
    let (alice, bob, contexts) = two_actors().await;
    bob.set_visible_slides(&["s1".to_string()], LoadMode::Sync).await;

    assert!(alice.request_lock("s1", "title").await.granted);
    assert!(bob.request_lock("s1", "body").await.granted);
    alice.flush().await.unwrap();
    bob.flush().await.unwrap();

    let alice_shard = alice.load_document_for_slide("s1").await.unwrap();
    eventually("both locks on alice's replica", || alice_shard.get_locks_for_slide("s1").len() == 2).await;
    let locks = alice.get_locks_for_slide("s1").await;
    let owners: Vec<&str> = locks.iter().map(|l| l.owner_actor_id.as_str()).collect();
    assert!(owners.contains(&"alice"));
    assert!(owners.contains(&"bob"));

    teardown(&[&alice, &bob], contexts).await;
}

#[tokio::test]
async fn test_closing_a_deck_releases_held_locks() {
    let (alice, bob, contexts) = two_actors().await;

    assert!(alice.request_lock("s1", "body").await.granted);
    alice.flush().await.unwrap();
    let bob_shard = bob.load_document_for_slide("s1").await.unwrap();
    eventually("bob to see alice's lock", || bob_shard.is_component_locked("s1", "body")).await;

    alice.shutdown().await;
    eventually("alice's lock to go away", || !bob_shard.is_component_locked("s1", "body")).await;
    assert!(bob.request_lock("s1", "body").await.granted);

    teardown(&[&bob], contexts).await;
}
