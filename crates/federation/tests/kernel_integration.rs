//! End-to-end tests of the activity kernel over the in-memory domain.

#![allow(clippy::unwrap_used)]

use apkernel_federation::error::FederationError;
use apkernel_federation::processor::{ActivityKernel, Outcome};
use apkernel_federation::store::{Notification, RelationStore, UserStore};
use apkernel_federation::test_utils::{TestFederation, remote_actor_json, remote_note_json};
use serde_json::json;

const ALICE: &str = "https://remote.example/users/alice";

fn create_note_activity() -> serde_json::Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/notes/1/activity",
        "actor": ALICE,
        "to": ["https://www.w3.org/ns/activitystreams#Public"],
        "object": {
            "type": "Note",
            "id": "https://remote.example/notes/1",
            "attributedTo": ALICE,
            "content": "<p>hello fediverse</p>"
        }
    })
}

#[tokio::test]
async fn concurrent_creates_store_one_note() {
    let fed = TestFederation::new().await;
    let alice = fed.remote_user("alice1", "remote.example", "alice").await;
    let kernel = ActivityKernel::new(fed.ctx.clone());

    let (first, second) = tokio::join!(
        kernel.perform_value(&alice, create_note_activity()),
        kernel.perform_value(&alice, create_note_activity()),
    );
    let mut outcomes = vec![first.unwrap().to_string(), second.unwrap().to_string()];
    outcomes.sort();

    assert_eq!(outcomes, vec!["ok".to_string(), "skip: note exists".to_string()]);
    assert_eq!(fed.store.notes().await.len(), 1);
    assert!(fed.leases.holder("ap-object:https://remote.example/notes/1").is_none());
}

#[tokio::test]
async fn reply_cycle_terminates() {
    let fed = TestFederation::new().await;
    let alice = fed.remote_user("alice1", "remote.example", "alice").await;
    let mut b = remote_note_json("remote.example", "alice", "b");
    b["inReplyTo"] = json!("https://remote.example/notes/a");
    fed.transport.activity_json("https://remote.example/notes/b", b);

    let mut a = remote_note_json("remote.example", "alice", "a");
    a["inReplyTo"] = json!("https://remote.example/notes/b");
    let activity = json!({
        "type": "Create",
        "id": "https://remote.example/notes/a/activity",
        "actor": ALICE,
        "object": a
    });

    let outcome = ActivityKernel::new(fed.ctx.clone())
        .perform_value(&alice, activity)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::ok());

    let notes = fed.store.notes().await;
    assert_eq!(notes.len(), 2);
    let note_a = notes
        .iter()
        .find(|n| n.uri.as_ref().is_some_and(|u| u.as_str().ends_with("/a")))
        .unwrap();
    let note_b = notes
        .iter()
        .find(|n| n.uri.as_ref().is_some_and(|u| u.as_str().ends_with("/b")))
        .unwrap();
    assert_eq!(note_a.reply_id.as_deref(), Some(note_b.id.as_str()));
    assert!(note_b.reply_id.is_none());
    assert_eq!(fed.transport.requests_to("https://remote.example/notes/b").len(), 1);
}

#[tokio::test]
async fn follow_then_undo_round_trip() {
    let fed = TestFederation::new().await;
    let alice = fed.remote_user("alice1", "remote.example", "alice").await;
    fed.local_user("bob1", "bob").await;
    let kernel = ActivityKernel::new(fed.ctx.clone());
    let follow = json!({
        "type": "Follow",
        "id": "https://remote.example/follows/9",
        "actor": ALICE,
        "object": "https://local.example/users/bob1"
    });

    let outcome = kernel.perform_value(&alice, follow.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::ok());
    assert!(fed.store.is_following("alice1", "bob1").await.unwrap());

    let accepts = fed.deliveries.jobs();
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0].0.activity_type(), "Accept");
    assert_eq!(accepts[0].0.target_inbox.as_str(), "https://remote.example/users/alice/inbox");
    assert_eq!(
        fed.store.notifications().await,
        vec![(
            "bob1".to_string(),
            Notification::Followed {
                follower_id: "alice1".to_string()
            }
        )]
    );

    let undo = json!({
        "type": "Undo",
        "id": "https://remote.example/follows/9/undo",
        "actor": ALICE,
        "object": follow
    });
    let outcome = kernel.perform_value(&alice, undo.clone()).await.unwrap();
    assert_eq!(outcome.to_string(), "ok: unfollowed");

    let outcome = kernel.perform_value(&alice, undo).await.unwrap();
    assert_eq!(outcome.to_string(), "skip: no such following or follow request");
    assert!(fed.store.followings().await.is_empty());
}

#[tokio::test]
async fn move_to_unrelated_account_is_refused() {
    let fed = TestFederation::new().await;
    let alice = fed.remote_user("alice1", "remote.example", "alice").await;
    fed.local_user("bob1", "bob").await;
    fed.store.insert_following("bob1", "alice1").await;
    // The hijacker's account does not list alice as an alias.
    fed.transport.activity_json(
        "https://evil.example/users/mallory",
        remote_actor_json("evil.example", "mallory"),
    );

    let err = ActivityKernel::new(fed.ctx.clone())
        .perform_value(
            &alice,
            json!({
                "type": "Move",
                "id": "https://remote.example/moves/1",
                "actor": ALICE,
                "object": ALICE,
                "target": "https://evil.example/users/mallory"
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, FederationError::Validation(_)));
    assert!(!err.is_retryable());
    assert!(fed.store.is_following("bob1", "alice1").await.unwrap());
    assert!(fed.store.notifications().await.is_empty());
    let source = UserStore::find_by_id(fed.store.as_ref(), "alice1")
        .await
        .unwrap()
        .unwrap();
    assert!(source.moved_to_uri.is_none());
}

#[tokio::test]
async fn delete_account_then_activities_are_still_authenticated_by_actor() {
    let fed = TestFederation::new().await;
    let alice = fed.remote_user("alice1", "remote.example", "alice").await;
    let kernel = ActivityKernel::new(fed.ctx.clone());

    let outcome = kernel
        .perform_value(
            &alice,
            json!({"type": "Delete", "id": "https://remote.example/d/1", "actor": ALICE, "object": ALICE}),
        )
        .await
        .unwrap();
    assert!(outcome.to_string().starts_with("ok: queued delete account job "));
    assert_eq!(fed.account_jobs.jobs().len(), 1);

    let forged = kernel
        .perform_value(
            &alice,
            json!({"type": "Delete", "actor": "https://remote.example/users/carol", "object": "https://remote.example/users/carol"}),
        )
        .await;
    assert!(matches!(forged, Err(FederationError::Validation(_))));
}
