//! Sync between nodes: relays, failed loads, reconnection, corrections and
//! collection against storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::net::TcpListener;

use async_trait::async_trait;

use covalence::core::{CoValueHeader, KnownState, NewContentPiece, Transaction};
use covalence::store::{SqliteStore, Store, StoreError, StoreOutcome};
use covalence::sync::transport::memory;
use covalence::sync::{
    maintain_connection, ReconnectConfig, StreamTransport, SyncConfig, SyncMessage, Transport,
};
use covalence::{
    CoValueId, CoValueState, CoValueType, LocalNode, NodeError, PeerConfig, PeerId, PeerRole,
    PeerSyncState, Provenance, Role,
};
use covalence_testkit::{connect, eventually, test_config, within, TestNet};

const WAIT: Duration = Duration::from_secs(5);

fn title(node: &LocalNode, doc: &CoValueId) -> Option<serde_json::Value> {
    node.content(doc)
        .ok()
        .and_then(|content| content.as_map().and_then(|map| map.get("title").cloned()))
}

fn pieces(node: &LocalNode, id: &CoValueId) -> Vec<NewContentPiece> {
    let cell = node.covalues().get(id).unwrap();
    let core = cell.lock().unwrap();
    core.new_content_since(&KnownState::empty(*id))
}

/// Wait until `store` holds everything `node` knows about `id`.
async fn persisted(store: &dyn Store, node: &LocalNode, id: &CoValueId) -> bool {
    for _ in 0..500 {
        if let Some(expected) = node.known_state(id) {
            if store.known_state(id).await.unwrap() == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// SQLite underneath, with reads or writes failing on demand.
struct Unreliable {
    inner: SqliteStore,
    fail_reads: bool,
    fail_writes: bool,
}

impl Unreliable {
    fn failing_writes() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open_memory().unwrap(),
            fail_reads: false,
            fail_writes: true,
        })
    }

    fn failing_reads() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open_memory().unwrap(),
            fail_reads: true,
            fail_writes: false,
        })
    }

    fn check(fail: bool) -> covalence::store::Result<()> {
        if fail {
            Err(StoreError::InvalidData("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for Unreliable {
    async fn get_header(&self, id: &CoValueId) -> covalence::store::Result<Option<CoValueHeader>> {
        Self::check(self.fail_reads)?;
        self.inner.get_header(id).await
    }

    async fn known_state(&self, id: &CoValueId) -> covalence::store::Result<KnownState> {
        Self::check(self.fail_reads)?;
        self.inner.known_state(id).await
    }

    async fn load_content(
        &self,
        id: &CoValueId,
        since: &KnownState,
    ) -> covalence::store::Result<Vec<NewContentPiece>> {
        Self::check(self.fail_reads)?;
        self.inner.load_content(id, since).await
    }

    async fn store_content(
        &self,
        piece: &NewContentPiece,
    ) -> covalence::store::Result<StoreOutcome> {
        Self::check(self.fail_writes)?;
        self.inner.store_content(piece).await
    }

    async fn list_covalues(&self) -> covalence::store::Result<Vec<CoValueId>> {
        Self::check(self.fail_reads)?;
        self.inner.list_covalues().await
    }
}

#[tokio::test]
async fn test_relay_forwards_between_clients() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    let relay = net.node(9);
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    relay.add_storage(store.clone());

    let group = a.create_group().unwrap();
    a.add_member(&group, b.agent_id(), Role::Writer).unwrap();
    let doc = a.create_map(&group).unwrap();
    a.set(&doc, "title", json!("from a")).unwrap();

    connect(&a, &relay);
    assert!(eventually(WAIT, || relay.known_state(&doc) == a.known_state(&doc)).await);

    let (b_to_relay, _) = connect(&b, &relay);
    within(WAIT, b.load(&doc)).await.unwrap();
    assert_eq!(title(&b, &doc), Some(json!("from a")));

    net.at(2_000);
    b.set(&doc, "title", json!("from b")).unwrap();
    assert!(eventually(WAIT, || title(&a, &doc) == Some(json!("from b"))).await);

    // The relay stores everything but holds no key to read it.
    assert!(persisted(store.as_ref(), &relay, &doc).await);
    assert!(persisted(store.as_ref(), &relay, &group).await);
    assert!(
        eventually(WAIT, || {
            relay
                .content(&doc)
                .map(|content| content.as_map().unwrap().is_empty())
                .unwrap_or(false)
        })
        .await
    );

    assert!(
        eventually(WAIT, || {
            b.sync_state(&doc, b_to_relay.id()) == PeerSyncState::Synced
        })
        .await
    );
}

#[tokio::test]
async fn test_load_fails_when_no_peer_has_it() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    connect(&a, &b);

    let missing = CoValueId::derive(b"nobody has this");
    let started = Instant::now();
    match within(WAIT, a.load(&missing)).await {
        Err(NodeError::Unavailable(id)) => assert_eq!(id, missing),
        other => panic!("expected Unavailable, got {other:?}"),
    }
    // Answered by the peer, not by the load timeout.
    assert!(started.elapsed() < test_config().load_timeout);
    assert_eq!(a.state(&missing), CoValueState::Unavailable);
}

#[tokio::test]
async fn test_load_without_peers_is_unavailable() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let missing = CoValueId::derive(b"offline");
    assert!(matches!(
        a.load(&missing).await,
        Err(NodeError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_silent_peer_times_out_then_later_peer_serves() {
    let net = TestNet::new(1_000);
    let a = net.node_with_config(1, test_config().with_load_timeout(Duration::from_millis(200)));
    let server = net.node(2);
    let doc = server.create_unsafe(CoValueType::CoMap).unwrap();
    server.set(&doc, "title", json!("served")).unwrap();

    // A peer that never answers.
    let (node_end, _silent) = memory::pair(64);
    a.add_peer(
        PeerConfig::new(PeerId::new("silent"), PeerRole::Server),
        Arc::new(node_end),
    );
    assert!(matches!(
        within(WAIT, a.load(&doc)).await,
        Err(NodeError::Unavailable(_))
    ));
    assert_eq!(a.state(&doc), CoValueState::Unavailable);

    // A new server peer retries loads that failed before.
    connect(&a, &server);
    assert!(eventually(WAIT, || a.state(&doc) == CoValueState::Available).await);
    within(WAIT, a.load(&doc)).await.unwrap();
    assert_eq!(title(&a, &doc), Some(json!("served")));
}

#[tokio::test]
async fn test_tampered_content_gets_correction() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    let doc = a.create_unsafe(CoValueType::CoMap).unwrap();
    a.set(&doc, "title", json!("genuine")).unwrap();

    let genuine = pieces(&a, &doc);
    assert_eq!(genuine.len(), 1);
    let mut tampered = genuine[0].clone();
    let content = tampered.new.values_mut().next().unwrap();
    match &mut content.new_transactions[0] {
        Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
            *made_at += 1
        }
    }

    let (node_end, test_end) = memory::pair(64);
    b.add_peer(
        PeerConfig::new(PeerId::new("raw"), PeerRole::Server),
        Arc::new(node_end),
    );
    test_end.send(SyncMessage::Content(tampered)).await.unwrap();

    match within(WAIT, test_end.recv()).await.unwrap() {
        Some(SyncMessage::Known {
            id,
            header,
            sessions,
            is_correction,
        }) => {
            assert_eq!(id, doc);
            assert!(is_correction);
            assert!(header);
            assert!(sessions.is_empty());
        }
        other => panic!("expected a correction, got {other:?}"),
    }
    // The header was valid; none of the session was taken.
    assert_eq!(b.state(&doc), CoValueState::Available);
    assert_eq!(b.known_state(&doc).unwrap().total(), 0);

    test_end
        .send(SyncMessage::Content(genuine[0].clone()))
        .await
        .unwrap();
    assert!(eventually(WAIT, || b.known_state(&doc) == a.known_state(&doc)).await);
    assert_eq!(title(&b, &doc), Some(json!("genuine")));
}

#[tokio::test]
async fn test_content_without_header_asks_for_header() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    let doc = a.create_unsafe(CoValueType::CoMap).unwrap();
    let big = "y".repeat(60 * 1024);
    for n in 0..4 {
        a.set(&doc, &format!("chunk-{n}"), json!(big)).unwrap();
    }
    let all = pieces(&a, &doc);
    assert!(all.len() > 1, "expected several signed ranges");
    assert!(all[1].header.is_none());

    let (node_end, test_end) = memory::pair(64);
    b.add_peer(
        PeerConfig::new(PeerId::new("raw"), PeerRole::Server),
        Arc::new(node_end),
    );
    test_end
        .send(SyncMessage::Content(all[1].clone()))
        .await
        .unwrap();
    match within(WAIT, test_end.recv()).await.unwrap() {
        Some(SyncMessage::Known {
            header,
            is_correction,
            ..
        }) => {
            assert!(is_correction);
            assert!(!header);
        }
        other => panic!("expected a correction, got {other:?}"),
    }

    for piece in all {
        test_end.send(SyncMessage::Content(piece)).await.unwrap();
    }
    assert!(eventually(WAIT, || b.known_state(&doc) == a.known_state(&doc)).await);
}

#[tokio::test]
async fn test_reconnects_over_tcp_and_resumes() {
    let net = TestNet::new(1_000);
    let server = net.node(1);
    let client = net.node(2);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepting = server.clone();
    tokio::spawn(async move {
        while let Ok((stream, peer_addr)) = listener.accept().await {
            let transport = StreamTransport::spawn(stream, SyncConfig::default());
            accepting.add_peer(
                PeerConfig::new(PeerId::new(peer_addr.to_string()), PeerRole::Client),
                Arc::new(transport),
            );
        }
    });

    let dialing = client.clone();
    tokio::spawn(maintain_connection(
        ReconnectConfig::default().with_initial_delay(Duration::from_millis(20)),
        move || StreamTransport::connect(addr, SyncConfig::default()),
        move |transport| {
            let node = dialing.clone();
            async move {
                let mut handle = node.add_peer(
                    PeerConfig::new(PeerId::new("server"), PeerRole::Server),
                    Arc::new(transport),
                );
                handle.closed().await;
                true
            }
        },
    ));

    let doc = client.create_unsafe(CoValueType::CoMap).unwrap();
    client.set(&doc, "title", json!("first")).unwrap();
    assert!(eventually(WAIT, || title(&server, &doc) == Some(json!("first"))).await);

    // Drop the connection from the server side.
    for peer in server.peers() {
        server.remove_peer(&peer).await;
    }
    net.at(2_000);
    client.set(&doc, "title", json!("while reconnecting")).unwrap();

    assert!(
        eventually(WAIT, || title(&server, &doc) == Some(json!("while reconnecting"))).await,
        "sync should resume after the client redials"
    );
    assert_eq!(server.known_state(&doc), client.known_state(&doc));
}

#[tokio::test]
async fn test_collected_values_reload_from_storage() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    a.add_storage(store.clone());

    let group = a.create_group().unwrap();
    let doc = a.create_map(&group).unwrap();
    a.set(&doc, "title", json!("kept")).unwrap();
    let before = a.content(&doc).unwrap().to_canonical_json().unwrap();
    assert!(persisted(store.as_ref(), &a, &group).await);
    assert!(persisted(store.as_ref(), &a, &doc).await);

    let gc = a.garbage_collector();
    let later = Instant::now() + Duration::from_secs(3600);
    // The group goes only once nothing in memory depends on it.
    assert!(eventually(WAIT, || {
        gc.run_at(later);
        !a.covalues().contains(&doc) && !a.covalues().contains(&group)
    })
    .await);
    assert_eq!(a.state(&doc), CoValueState::Unknown);

    within(WAIT, a.load(&doc)).await.unwrap();
    assert_eq!(a.content(&doc).unwrap().to_canonical_json().unwrap(), before);
}

#[tokio::test]
async fn test_gc_keeps_values_a_client_watches() {
    let net = TestNet::new(1_000);
    let relay = net.node(9);
    let reader = net.node(2);
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    relay.add_storage(store.clone());

    let doc = relay.create_unsafe(CoValueType::CoMap).unwrap();
    relay.set(&doc, "title", json!("watched")).unwrap();
    connect(&reader, &relay);
    within(WAIT, reader.load(&doc)).await.unwrap();
    assert!(persisted(store.as_ref(), &relay, &doc).await);

    let gc = relay.garbage_collector();
    gc.run_at(Instant::now() + Duration::from_secs(3600));
    assert!(relay.covalues().contains(&doc));
}

#[tokio::test]
async fn test_write_only_member_cannot_read_others() {
    let net = TestNet::new(1_000);
    let owner = net.node(1);
    let dropbox = net.node(2);
    let group = owner.create_group().unwrap();
    let doc = owner.create_map(&group).unwrap();
    owner.set(&doc, "private", json!("owner only")).unwrap();
    net.at(2_000);
    owner
        .add_member(&group, dropbox.agent_id(), Role::WriteOnly)
        .unwrap();

    connect(&dropbox, &owner);
    within(WAIT, dropbox.load(&doc)).await.unwrap();
    assert_eq!(
        dropbox.content(&doc).unwrap().as_map().unwrap().get("private"),
        None
    );

    net.at(3_000);
    dropbox.set(&doc, "submission", json!("from dropbox")).unwrap();
    assert!(eventually(WAIT, || {
        owner
            .content(&doc)
            .map(|content| {
                content.as_map().unwrap().get("submission") == Some(&json!("from dropbox"))
            })
            .unwrap_or(false)
    })
    .await);
}

#[tokio::test]
async fn test_everyone_reader_sees_content() {
    let net = TestNet::new(1_000);
    let owner = net.node(1);
    let stranger = net.node(7);
    let group = owner.create_group().unwrap();
    owner
        .add_member(&group, covalence::MemberId::Everyone, Role::Reader)
        .unwrap();
    let doc = owner.create_map(&group).unwrap();
    owner.set(&doc, "title", json!("public")).unwrap();

    assert!(matches!(
        owner.add_member(&group, covalence::MemberId::Everyone, Role::Admin),
        Err(NodeError::InvalidOperation(_))
    ));

    connect(&stranger, &owner);
    within(WAIT, stranger.load(&doc)).await.unwrap();
    assert_eq!(title(&stranger, &doc), Some(json!("public")));
    assert!(matches!(
        stranger.set(&doc, "title", json!("defaced")),
        Err(NodeError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_gc_keeps_values_storage_failed_to_write() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let store = Unreliable::failing_writes();
    a.add_storage(store.clone());

    let doc = a.create_unsafe(CoValueType::CoMap).unwrap();
    a.set(&doc, "title", json!("precious")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!store.inner.known_state(&doc).await.unwrap().header);

    let gc = a.garbage_collector();
    assert_eq!(gc.run_at(Instant::now() + Duration::from_secs(3600)), 0);
    assert_eq!(a.state(&doc), CoValueState::Available);
    assert_eq!(title(&a, &doc), Some(json!("precious")));
}

#[tokio::test]
async fn test_gc_waits_for_storage_to_confirm() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    a.add_storage(store.clone());
    let doc = a.create_unsafe(CoValueType::CoMap).unwrap();
    a.set(&doc, "title", json!("queued")).unwrap();

    // Collected only after the store acknowledged the write.
    let gc = a.garbage_collector();
    let later = Instant::now() + Duration::from_secs(3600);
    assert!(eventually(WAIT, || {
        gc.run_at(later);
        !a.covalues().contains(&doc)
    })
    .await);
    let stored = store.known_state(&doc).await.unwrap();
    assert!(stored.header);
    assert_eq!(stored.total(), 1);
}

#[tokio::test]
async fn test_unreadable_storage_is_not_reported_missing() {
    let net = TestNet::new(1_000);
    let timeout = Duration::from_millis(300);
    let a = net.node_with_config(1, test_config().with_load_timeout(timeout));
    a.add_storage(Unreliable::failing_reads());

    let doc = CoValueId::derive(b"stored but unreadable");
    let started = Instant::now();
    assert!(matches!(
        within(WAIT, a.load(&doc)).await,
        Err(NodeError::Unavailable(_))
    ));
    // Only the load timeout resolves it; storage never claimed it was absent.
    assert!(started.elapsed() >= timeout);
}

#[tokio::test]
async fn test_content_waits_for_its_group() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    let group = a.create_group().unwrap();
    a.add_member(&group, b.agent_id(), Role::Reader).unwrap();
    let doc = a.create_map(&group).unwrap();
    a.set(&doc, "title", json!("behind a group")).unwrap();
    connect(&b, &a);

    // b holds the value but not the group that decides who may read it.
    let cell = b.covalues().get_or_create(&doc);
    for piece in pieces(&a, &doc) {
        cell.lock().unwrap().apply_piece(&piece, Provenance::Local);
    }
    drop(cell);
    assert!(matches!(
        b.content(&doc),
        Err(NodeError::MissingDependency(missing)) if missing == vec![group]
    ));

    let content = within(WAIT, b.content_when_ready(&doc)).await.unwrap();
    assert_eq!(
        content.as_map().unwrap().get("title"),
        Some(&json!("behind a group"))
    );
}

#[tokio::test]
async fn test_group_dependencies_load_ahead_of_other_loads() {
    let net = TestNet::new(1_000);
    let a = net.node(1);
    let b = net.node(2);
    let group = a.create_group().unwrap();
    let doc = a.create_map(&group).unwrap();
    a.set(&doc, "title", json!("owned")).unwrap();

    // A peer that reads nothing yet, so b's outgoing messages back up.
    let (node_end, test_end) = memory::pair(1);
    b.add_peer(
        PeerConfig::new(PeerId::new("slow"), PeerRole::Server),
        Arc::new(node_end),
    );
    let waiting: Vec<CoValueId> = (0u8..4)
        .map(|n| CoValueId::derive(&[b'w', n]))
        .collect();
    for id in &waiting {
        let b = b.clone();
        let id = *id;
        tokio::spawn(async move {
            let _ = b.load(&id).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for piece in pieces(&a, &doc) {
        test_end.send(SyncMessage::Content(piece)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut loads = Vec::new();
    while loads.len() < waiting.len() + 1 {
        match within(WAIT, test_end.recv()).await.unwrap() {
            Some(SyncMessage::Load(known)) => loads.push(known.id),
            Some(_) => {}
            None => panic!("connection closed"),
        }
    }
    // Two loads were already handed to the transport; the group jumps the rest.
    assert_eq!(loads[2], group);
}
