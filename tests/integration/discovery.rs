//! Session discovery between a host and browsers.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use playnet_core::wire::DiscoveryQuery;
use playnet_core::{Guid, SessionDescriptor, SessionFlags};
use playnet_services::EnumEvent;

use crate::*;

const WAIT: Duration = Duration::from_millis(300);

async fn browse(peer: &Peer, query: &DiscoveryQuery) -> Vec<SessionDescriptor> {
    let mut found = Vec::new();
    peer.node
        .enum_sessions(query, WAIT, |event| {
            if let EnumEvent::Session(entry) = event {
                found.push(entry.descriptor.clone());
            }
            ControlFlow::Continue(())
        })
        .await
        .unwrap();
    found
}

#[tokio::test]
async fn test_browsers_see_hosted_session() {
    let app = Guid::random();
    let mut session = SessionDescriptor::new(app, "capture the flag", 8);
    session.password = Some("hunter2".into());
    let host = spawn_host(session).unwrap();

    let a = spawn_browser(host.addr).unwrap();
    let b = spawn_browser(host.addr).unwrap();

    let mut query = DiscoveryQuery::for_application(app);
    query.flags = playnet_core::wire::EnumFlags::PASSWORD_REQUIRED;

    for browser in [&a, &b] {
        let found = browse(browser, &query).await;
        assert_eq!(found.len(), 1, "browser should see exactly one session");
        assert_eq!(found[0].name, "capture the flag");
        assert_eq!(found[0].max_players, 8);
        assert!(found[0].flags.contains(SessionFlags::PASSWORD_REQUIRED));
        // The password never crosses the wire.
        assert_eq!(found[0].password, None);
        assert_eq!(browser.node.directory().first_source_address(), Some(host.addr));
    }

    let listed = serde_json::to_value(&a.node.directory().enumerate()[0].descriptor).unwrap();
    assert_eq!(listed["name"], "capture the flag");
    assert!(listed.get("password").is_none());
}

#[tokio::test]
async fn test_other_applications_are_filtered() {
    let host = spawn_host(SessionDescriptor::new(Guid::random(), "ours", 0)).unwrap();
    let browser = spawn_browser(host.addr).unwrap();

    let found = browse(&browser, &DiscoveryQuery::for_application(Guid::random())).await;
    assert!(found.is_empty());

    // A nil application id is a wildcard.
    let found = browse(&browser, &DiscoveryQuery::for_application(Guid::NIL)).await;
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_full_session_needs_all_flag() {
    let app = Guid::random();
    let host = spawn_host(SessionDescriptor::new(app, "tiny", 1)).unwrap();
    host.node
        .create_server_player(playnet_core::PlayerName::short("host"), &[])
        .unwrap();
    let browser = spawn_browser(host.addr).unwrap();

    assert!(browse(&browser, &DiscoveryQuery::for_application(app)).await.is_empty());

    let mut query = DiscoveryQuery::for_application(app);
    query.flags = playnet_core::wire::EnumFlags::ALL;
    let found = browse(&browser, &query).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].current_players, 1);
}

#[tokio::test]
async fn test_async_enumeration_runs_until_stopped() {
    let app = Guid::random();
    let host = spawn_host(SessionDescriptor::new(app, "background", 0)).unwrap();
    let browser = spawn_browser(host.addr).unwrap();

    let passes = Arc::new(AtomicUsize::new(0));
    let sightings = Arc::new(AtomicUsize::new(0));
    {
        let passes = passes.clone();
        let sightings = sightings.clone();
        browser
            .node
            .broadcaster()
            .start_async(DiscoveryQuery::for_application(app), Duration::from_millis(100), move |event| {
                match event {
                    EnumEvent::Session(_) => sightings.fetch_add(1, Ordering::SeqCst),
                    EnumEvent::TimedOut => passes.fetch_add(1, Ordering::SeqCst),
                };
                ControlFlow::Continue(())
            })
            .unwrap();
    }

    // A second start while the first is live is refused.
    assert!(browser
        .node
        .broadcaster()
        .start_async(DiscoveryQuery::for_application(app), WAIT, |_| ControlFlow::Continue(()))
        .is_err());

    tokio::time::sleep(Duration::from_millis(550)).await;
    browser.node.broadcaster().stop_async().await;
    assert!(!browser.node.broadcaster().is_running());

    let after_stop = passes.load(Ordering::SeqCst);
    assert!(after_stop >= 2, "expected repeated passes, got {after_stop}");
    assert!(sightings.load(Ordering::SeqCst) >= 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(passes.load(Ordering::SeqCst), after_stop, "visitor ran after stop");
}
