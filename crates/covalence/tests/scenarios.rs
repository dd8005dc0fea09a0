//! End-to-end scenarios across nodes: concurrent edits, revocation and
//! persistence.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use covalence::store::{SqliteStore, Store};
use covalence::{CoValueId, LocalNode, NodeError, Role};
use covalence_testkit::{connect, eventually, within, TestNet};

const WAIT: Duration = Duration::from_secs(5);

fn title(node: &LocalNode, doc: &CoValueId) -> Option<serde_json::Value> {
    node.content(doc)
        .ok()
        .and_then(|content| content.as_map().and_then(|map| map.get("title").cloned()))
}

/// `node`'s own role in `group`, as `node` currently sees it.
fn role_seen_by(node: &LocalNode, group: &CoValueId) -> Option<Role> {
    node.content(group)
        .ok()
        .and_then(|content| content.as_group().and_then(|g| g.role_of(&node.agent_id().into())))
}

/// A owns a group with B as writer and a doc titled "draft"; B has loaded it.
async fn shared_doc(net: &TestNet) -> (LocalNode, LocalNode, CoValueId, CoValueId) {
    let a = net.node(1);
    let b = net.node(2);
    let group = a.create_group().unwrap();
    a.add_member(&group, b.agent_id(), Role::Writer).unwrap();
    let doc = a.create_map(&group).unwrap();
    a.set(&doc, "title", json!("draft")).unwrap();

    let (b_to_a, _) = connect(&b, &a);
    within(WAIT, b.load(&doc)).await.unwrap();
    assert_eq!(title(&b, &doc), Some(json!("draft")));
    b.remove_peer(b_to_a.id()).await;
    (a, b, group, doc)
}

#[tokio::test]
async fn test_concurrent_title_edits_converge_to_later_write() {
    let net = TestNet::new(1_000);
    let (a, b, _group, doc) = shared_doc(&net).await;

    // Both edit while disconnected; B's edit carries the later madeAt.
    net.at(2_000);
    a.set(&doc, "title", json!("A")).unwrap();
    net.at(2_001);
    b.set(&doc, "title", json!("B")).unwrap();
    assert_eq!(title(&a, &doc), Some(json!("A")));
    assert_eq!(title(&b, &doc), Some(json!("B")));

    connect(&b, &a);
    assert!(eventually(WAIT, || a.known_state(&doc) == b.known_state(&doc)).await);
    assert!(eventually(WAIT, || title(&a, &doc) == Some(json!("B"))).await);
    assert_eq!(title(&b, &doc), Some(json!("B")));

    let snapshot_a = a.content(&doc).unwrap().to_canonical_json().unwrap();
    let snapshot_b = b.content(&doc).unwrap().to_canonical_json().unwrap();
    assert_eq!(snapshot_a, snapshot_b);
}

#[tokio::test]
async fn test_revoked_writer_is_excluded() {
    let net = TestNet::new(1_000);
    let (a, b, group, doc) = shared_doc(&net).await;

    net.at(3_000);
    a.remove_member(&group, &b.agent_id()).unwrap();

    // B has not heard of the revocation and writes offline.
    net.at(3_001);
    b.set(&doc, "title", json!("B after revoke")).unwrap();

    connect(&b, &a);
    assert!(
        eventually(WAIT, || {
            let (Some(ours), Some(theirs)) = (a.known_state(&doc), b.known_state(&doc)) else {
                return false;
            };
            theirs.is_subset_of(&ours)
        })
        .await,
        "A should store B's validly signed transaction"
    );
    assert!(
        eventually(WAIT, || role_seen_by(&b, &group).is_none()).await,
        "B should learn it was revoked"
    );

    // Stored, but not part of anyone's snapshot.
    assert_eq!(title(&a, &doc), Some(json!("draft")));
    assert_eq!(title(&b, &doc), Some(json!("draft")));

    // Knowing the revocation, B can no longer write at all.
    let before = b.known_state(&doc);
    match b.set(&doc, "title", json!("again")) {
        Err(NodeError::Unauthorized(_)) => {}
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(b.known_state(&doc), before);

    // Content written after the rotation is sealed away from B.
    net.at(4_000);
    a.set(&doc, "secret", json!("only for members")).unwrap();
    assert!(eventually(WAIT, || b.known_state(&doc) == a.known_state(&doc)).await);
    let seen_by_b = b.content(&doc).unwrap();
    assert_eq!(seen_by_b.as_map().unwrap().get("secret"), None);
}

#[tokio::test]
async fn test_grant_window_stays_readable_after_revocation() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let c = net.node(3);
    let d = net.node(4);
    let group = a.create_group().unwrap();
    let doc = a.create_map(&group).unwrap();

    // Before the grant C has no access.
    connect(&c, &a);
    within(WAIT, c.load(&doc)).await.unwrap();
    assert!(matches!(
        c.set(&doc, "by-c", json!(0)),
        Err(NodeError::Unauthorized(_))
    ));

    net.at(2_000);
    a.add_member(&group, c.agent_id(), Role::Writer).unwrap();
    assert!(eventually(WAIT, || role_seen_by(&c, &group) == Some(Role::Writer)).await);
    net.at(2_500);
    c.set(&doc, "by-c", json!(1)).unwrap();
    assert!(eventually(WAIT, || {
        a.content(&doc)
            .map(|content| content.as_map().unwrap().get("by-c") == Some(&json!(1)))
            .unwrap_or(false)
    })
    .await);

    net.at(3_000);
    a.remove_member(&group, &c.agent_id()).unwrap();
    assert!(eventually(WAIT, || role_seen_by(&c, &group).is_none()).await);
    assert!(c.set(&doc, "by-c", json!(2)).is_err());

    // A reader added after the rotation still sees what C wrote while
    // allowed, through the old key wrapped under the new one.
    net.at(4_000);
    a.add_member(&group, d.agent_id(), Role::Reader).unwrap();
    connect(&d, &a);
    within(WAIT, d.load(&doc)).await.unwrap();
    let content = d.content(&doc).unwrap();
    assert_eq!(content.as_map().unwrap().get("by-c"), Some(&json!(1)));
    assert!(matches!(
        d.set(&doc, "by-d", json!(1)),
        Err(NodeError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_persisted_history_verifies_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("covalues.db");
    let net = TestNet::new(1_000);

    let a = net.node(1);
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    a.add_storage(store.clone());
    let group = a.create_group().unwrap();
    let doc = a.create_map(&group).unwrap();
    // Large enough values that the session crosses signature checkpoints.
    let big = "x".repeat(60 * 1024);
    for n in 0..4 {
        a.set(&doc, &format!("chunk-{n}"), json!(big)).unwrap();
    }
    a.set(&doc, "title", json!("persisted")).unwrap();

    let expected = a.known_state(&doc).unwrap();
    let mut persisted = false;
    for _ in 0..500 {
        if store.known_state(&doc).await.unwrap() == expected {
            persisted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted, "storage never caught up");
    a.shutdown().await;

    // A fresh node on the same agent reloads and re-verifies every signature.
    let restarted = net.node(1);
    restarted.add_storage(Arc::new(SqliteStore::open(&path).unwrap()));
    within(WAIT, restarted.load(&doc)).await.unwrap();
    assert_eq!(restarted.known_state(&doc), Some(expected));
    assert_eq!(title(&restarted, &doc), Some(json!("persisted")));
    let content = restarted.content(&doc).unwrap();
    assert_eq!(content.as_map().unwrap().get("chunk-3"), Some(&json!(big)));
}
