//! Room storage lifecycle: load-on-create, store-on-last-disconnect.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncroom::{
    connection, protocol, ConnectRequest, DocStorage, MemoryStore, Outgoing, Server, ServerConfig,
    Transport,
};
use tokio::time::sleep;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact};

/// MemoryStore wrapper that counts hook invocations.
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
    stores: AtomicUsize,
}

impl CountingStore {
    fn new() -> Arc<CountingStore> {
        Arc::new(CountingStore {
            inner: MemoryStore::new(),
            loads: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
        })
    }
}

impl DocStorage for CountingStore {
    fn load_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load_doc(name, doc).await
        })
    }

    fn store_doc<'a>(&'a self, name: &'a str, doc: &'a Doc) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.inner.store_doc(name, doc).await
        })
    }
}

fn update_frame(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("body");
    {
        let mut txn = doc.transact_mut();
        text.push(&mut txn, content);
    }
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    protocol::sync_update(update)
}

async fn next_frame(transport: &mut Transport) -> Vec<u8> {
    let outgoing = tokio::time::timeout(Duration::from_secs(5), transport.next_outgoing())
        .await
        .expect("timed out waiting for outgoing command");
    match outgoing {
        Some(Outgoing::Frame(frame)) => frame,
        other => panic!("expected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_store_happens_on_last_disconnect_only() {
    let store = CountingStore::new();
    let server = Server::new(ServerConfig {
        storage: Some(store.clone()),
        ..ServerConfig::default()
    });

    let (conn_a, mut ta) = connection::pair();
    let (conn_b, mut tb) = connection::pair();
    ta.mark_open();
    tb.mark_open();
    server.admit(conn_a, ConnectRequest::new("/draft"), None);
    server.admit(conn_b, ConnectRequest::new("/draft"), None);
    next_frame(&mut ta).await; // bootstrap
    next_frame(&mut tb).await;

    ta.recv_frame(update_frame("dirty now"));
    // Both peers hear the update; the room has definitely applied it.
    next_frame(&mut ta).await;
    next_frame(&mut tb).await;

    ta.peer_closed();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(store.stores.load(Ordering::SeqCst), 0);
    assert_eq!(server.room_count().await, 1);

    tb.peer_closed();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(store.stores.load(Ordering::SeqCst), 1);
    assert_eq!(server.room_count().await, 0);

    // The snapshot carries the merged document.
    let snapshot = store.inner.snapshot("draft").expect("snapshot stored");
    let doc = Doc::new();
    let text = doc.get_or_insert_text("body");
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(&snapshot).unwrap())
            .unwrap();
    }
    assert_eq!(text.get_string(&doc.transact()), "dirty now");
}

#[tokio::test]
async fn test_unmutated_room_is_released_without_storing() {
    let store = CountingStore::new();
    let server = Server::new(ServerConfig {
        storage: Some(store.clone()),
        ..ServerConfig::default()
    });

    let (conn, mut transport) = connection::pair();
    transport.mark_open();
    server.admit(conn, ConnectRequest::new("/untouched"), None);
    next_frame(&mut transport).await;

    transport.peer_closed();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    assert_eq!(store.stores.load(Ordering::SeqCst), 0);
    assert_eq!(server.room_count().await, 0);
}

#[tokio::test]
async fn test_loaded_document_reaches_new_connections() {
    let store = Arc::new(MemoryStore::new());
    {
        // Seed the backend with an existing document.
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        {
            let mut txn = doc.transact_mut();
            text.push(&mut txn, "from storage");
        }
        store.store_doc("seeded", &doc).await.unwrap();
    }

    let server = Server::new(ServerConfig {
        storage: Some(store.clone()),
        ..ServerConfig::default()
    });
    let (conn, mut transport) = connection::pair();
    transport.mark_open();
    server.admit(conn, ConnectRequest::new("/seeded"), None);
    next_frame(&mut transport).await; // bootstrap step1

    // Ask for everything we are missing; the reply must contain the
    // loaded state.
    let empty = Doc::new();
    transport.recv_frame(protocol::sync_step1(&empty));
    let reply = next_frame(&mut transport).await;
    let diff = match protocol::decode_frame(&reply) {
        Ok(yrs::sync::Message::Sync(yrs::sync::SyncMessage::SyncStep2(diff))) => diff,
        other => panic!("expected step2, got {other:?}"),
    };

    let local = Doc::new();
    let text = local.get_or_insert_text("body");
    {
        let mut txn = local.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(&diff).unwrap()).unwrap();
    }
    assert_eq!(text.get_string(&local.transact()), "from storage");

    // Loading alone does not mark the room dirty; leaving without edits
    // releases it without another store.
    transport.peer_closed();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(server.room_count().await, 0);
}
