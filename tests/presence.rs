//! Awareness (presence) propagation and retraction.

use std::collections::HashMap;
use std::time::Duration;
use syncroom::{connection, protocol, ConnectRequest, Outgoing, Server, Transport};
use yrs::block::ClientID;
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{AwarenessUpdate, Message};

fn presence_update(client_ids: &[ClientID]) -> AwarenessUpdate {
    let clients: HashMap<ClientID, AwarenessUpdateEntry> = client_ids
        .iter()
        .map(|&id| {
            (
                id,
                AwarenessUpdateEntry {
                    clock: 1,
                    json: format!("{{\"cursor\":{id}}}").into(),
                },
            )
        })
        .collect();
    AwarenessUpdate { clients }
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

async fn next_awareness(transport: &mut Transport) -> AwarenessUpdate {
    let frame = next_frame(transport).await;
    match protocol::decode_frame(&frame) {
        Ok(Message::Awareness(update)) => update,
        other => panic!("expected awareness frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_flows_to_other_connections() {
    let server = Server::with_defaults();
    let (conn_a, mut ta) = connection::pair();
    let (conn_b, mut tb) = connection::pair();
    ta.mark_open();
    tb.mark_open();
    server.admit(conn_a, ConnectRequest::new("/board"), None);
    next_frame(&mut ta).await; // bootstrap
    server.admit(conn_b, ConnectRequest::new("/board"), None);
    next_frame(&mut tb).await;

    ta.recv_frame(protocol::awareness_frame(presence_update(&[7])));

    let seen = next_awareness(&mut tb).await;
    assert!(seen.clients.contains_key(&7));
}

#[tokio::test]
async fn test_late_joiner_receives_presence_snapshot() {
    let server = Server::with_defaults();
    let (conn_a, mut ta) = connection::pair();
    ta.mark_open();
    server.admit(conn_a, ConnectRequest::new("/board"), None);
    next_frame(&mut ta).await; // bootstrap
    ta.recv_frame(protocol::awareness_frame(presence_update(&[42])));
    next_awareness(&mut ta).await; // own echo confirms it applied

    let (conn_b, mut tb) = connection::pair();
    tb.mark_open();
    server.admit(conn_b, ConnectRequest::new("/board"), None);

    // Bootstrap: step1 first, then the presence snapshot.
    let step1 = next_frame(&mut tb).await;
    assert!(matches!(
        protocol::decode_frame(&step1),
        Ok(Message::Sync(_))
    ));
    let snapshot = next_awareness(&mut tb).await;
    assert!(snapshot.clients.contains_key(&42));
}

#[tokio::test]
async fn test_disconnect_retracts_all_controlled_ids() {
    let server = Server::with_defaults();
    let (conn_a, mut ta) = connection::pair();
    let (conn_b, mut tb) = connection::pair();
    ta.mark_open();
    tb.mark_open();
    server.admit(conn_a, ConnectRequest::new("/board"), None);
    next_frame(&mut ta).await;
    server.admit(conn_b, ConnectRequest::new("/board"), None);
    next_frame(&mut tb).await;

    // One connection asserts presence for two client ids.
    ta.recv_frame(protocol::awareness_frame(presence_update(&[7, 8])));
    let seen = next_awareness(&mut tb).await;
    assert!(seen.clients.contains_key(&7) && seen.clients.contains_key(&8));

    // It disconnects; the survivor hears a retraction for both ids.
    ta.peer_closed();
    let retraction = next_awareness(&mut tb).await;
    let mut ids: Vec<ClientID> = retraction.clients.keys().copied().collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![7, 8]);
}
