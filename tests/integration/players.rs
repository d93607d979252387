//! Player creation through a host: id allocation, mirroring, refusal and
//! timeouts.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::net::UdpSocket;

use playnet_core::wire::DiscoveryQuery;
use playnet_core::{Guid, PlayerName, SessionDescriptor};
use playnet_services::{Dpid, EnumEvent, NodeRole, PlayError};

use crate::*;

async fn discover_and_join(peer: &Peer, app: Guid) {
    let mut instance = None;
    peer.node
        .enum_sessions(&DiscoveryQuery::for_application(app), Duration::from_millis(300), |event| {
            if let EnumEvent::Session(entry) = event {
                instance = Some(entry.descriptor.instance_id);
            }
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
    let instance = instance.expect("session not discovered");
    peer.node.join(&instance, None).unwrap();
}

#[tokio::test]
async fn test_two_clients_get_distinct_ids() {
    let app = Guid::random();
    let host = spawn_host(SessionDescriptor::new(app, "deathmatch", 0)).unwrap();
    host.node.create_server_player(PlayerName::short("server"), &[]).unwrap();

    let a = spawn_browser(host.addr).unwrap();
    let b = spawn_browser(host.addr).unwrap();
    discover_and_join(&a, app).await;
    discover_and_join(&b, app).await;

    let (ida, idb) = tokio::join!(
        a.node.create_player(PlayerName::short("alice"), b"red", None),
        b.node.create_player(PlayerName::short("bob"), b"blue", None),
    );
    let (ida, idb) = (ida.unwrap(), idb.unwrap());

    assert_ne!(ida, idb);
    assert!(ida > Dpid::SERVER_PLAYER && idb > Dpid::SERVER_PLAYER);

    let roster = host.node.roster();
    assert_eq!(roster.player_count(), 3);
    assert_eq!(roster.find_player(ida).unwrap().name.short, "alice");
    assert_eq!(&roster.player_data(idb).unwrap()[..], b"blue");
    assert_eq!(host.node.peer_addr(ida), Some(a.addr));
    assert_eq!(host.node.peer_addr(idb), Some(b.addr));

    // Each client only holds its own player locally.
    assert_eq!(a.node.roster().player_ids(), vec![ida]);
    assert_eq!(b.node.roster().player_ids(), vec![idb]);
}

#[tokio::test]
async fn test_full_session_refuses_late_joiner() {
    let app = Guid::random();
    let host = spawn_host(SessionDescriptor::new(app, "duel", 2)).unwrap();
    host.node.create_server_player(PlayerName::short("server"), &[]).unwrap();

    let first = spawn_browser(host.addr).unwrap();
    let late = spawn_browser(host.addr).unwrap();
    discover_and_join(&first, app).await;
    discover_and_join(&late, app).await;

    first.node.create_player(PlayerName::short("one"), &[], None).await.unwrap();
    let err = late
        .node
        .create_player(PlayerName::short("two"), &[], None)
        .await
        .unwrap_err();

    assert!(matches!(err, PlayError::CannotCreatePlayer(reason) if reason.contains("full")));
    assert_eq!(late.node.roster().player_count(), 0);
    assert_eq!(host.node.roster().player_count(), 2);
}

#[tokio::test]
async fn test_silent_host_times_out_without_leaking_waiters() {
    // Answers one discovery request by hand, then goes quiet.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let client = spawn_peer(NodeRole::Client, silent_addr, Duration::from_millis(250)).unwrap();

    let app = Guid::random();
    let responder = tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let (_, from) = silent.recv_from(&mut buf).await.unwrap();
        let reply = SessionDescriptor::new(app, "ghost", 0).encode_reply();
        let datagram = playnet_core::wire::encode(
            playnet_core::CommandId::EnumSessionsReply,
            playnet_core::wire::VERSION,
            &reply,
        );
        silent.send_to(&datagram, from).await.unwrap();
        // Keep the socket open so requests are swallowed, not refused.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    discover_and_join(&client, app).await;
    let err = client
        .node
        .create_player(PlayerName::short("nobody"), &[], None)
        .await
        .unwrap_err();

    assert!(matches!(err, PlayError::Timeout));
    assert_eq!(client.node.correlator().pending_count(), 0);
    assert_eq!(client.node.roster().player_count(), 0);
    responder.abort();
}

#[tokio::test]
async fn test_shutdown_wakes_pending_request() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let client = spawn_peer(NodeRole::Client, silent_addr, Duration::from_secs(30)).unwrap();
    client
        .node
        .directory()
        .insert(SessionDescriptor::new(Guid::random(), "stuck", 0), silent_addr, playnet_services::Tick(0));
    client.node.join_first(None).unwrap();

    let node = client.node.clone();
    let creating = tokio::spawn(async move { node.create_player(PlayerName::short("w"), &[], None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.node.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), creating)
        .await
        .expect("shutdown did not wake the waiter")
        .unwrap();
    assert!(matches!(result, Err(PlayError::Cancelled)));
    drop(silent);
}
