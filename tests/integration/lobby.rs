//! The shared lobby table as seen by a launcher and the applications it
//! starts, each with its own mapping of the segment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use playnet_core::config::LobbyConfig;
use playnet_core::{ConnectionSettings, Guid, PlayerName, SessionDescriptor};
use playnet_services::lobby::SharedSegment;
use playnet_services::{PlayError, SharedAppRegistry};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Segment under the temp dir, unlinked when dropped.
struct Segment(LobbyConfig);

impl Segment {
    fn new() -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        Segment(LobbyConfig {
            segment_dir: std::env::temp_dir(),
            segment_name: format!("playnet-it-lobby-{}-{}", std::process::id(), id),
            slots: 8,
            block_size: 256,
            block_count: 64,
        })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = SharedSegment::unlink(&self.0.segment_dir, &self.0.segment_name);
    }
}

fn launch_settings(host: bool) -> ConnectionSettings {
    ConnectionSettings {
        flags: if host { ConnectionSettings::HOST } else { 0 },
        session: SessionDescriptor::new(Guid::random(), "Friday league", 6),
        player_name: Some(PlayerName::new("kit", "Kit Marlowe")),
        service_provider: playnet_services::providers::UDP_PROVIDER,
        address: b"192.168.1.40:47624".to_vec(),
    }
}

#[test]
fn test_launcher_hands_settings_to_waiting_app() {
    let segment = Segment::new();
    let launcher = SharedAppRegistry::open(&segment.0).unwrap();
    let settings = launch_settings(false);

    launcher.register_lobby_app(31337, 7).unwrap();

    let app_config = segment.0.clone();
    let expected = settings.clone();
    let app = std::thread::spawn(move || {
        let registry = SharedAppRegistry::open(&app_config).unwrap();
        registry.set_waiting_for_settings(31337, true).unwrap();
        loop {
            match registry.get_connection_settings(31337, 4096) {
                Ok(bytes) => {
                    registry.set_waiting_for_settings(31337, false).unwrap();
                    return ConnectionSettings::decode(&bytes).unwrap();
                }
                Err(PlayError::NotFound(_)) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    });

    // Wait until the app says it is blocked, then publish.
    while !launcher.any_waiting_for_settings().unwrap() {
        std::thread::sleep(Duration::from_millis(5));
    }
    launcher.set_connection_settings(31337, &settings).unwrap();

    let received = app.join().unwrap();
    assert_eq!(received, expected);

    let entry = launcher.is_lobbied(31337).unwrap();
    assert!(entry.settings_read);
    assert!(!entry.waiting_for_settings);
    assert!(!launcher.any_waiting_for_settings().unwrap());
}

#[test]
fn test_entries_outlive_their_handles() {
    let segment = Segment::new();
    {
        let first = SharedAppRegistry::open(&segment.0).unwrap();
        first.register_lobby_app(100, 0).unwrap();
        first.set_connection_settings(100, &launch_settings(true)).unwrap();
    }

    let later = SharedAppRegistry::open(&segment.0).unwrap();
    let apps = later.lobby_apps().unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].app_id, 100);
    assert!(apps[0].has_settings);

    let bytes = later.get_connection_settings(100, 4096).unwrap();
    assert!(ConnectionSettings::decode(&bytes).unwrap().is_host());

    let blocks = later.used_blocks().unwrap();
    assert!(blocks > 0);
    later.unregister_lobby_app(100).unwrap();
    assert_eq!(later.used_blocks().unwrap(), 0);
}

#[test]
fn test_many_apps_register_concurrently() {
    let segment = Segment::new();
    let handles: Vec<_> = (1..=8u32)
        .map(|app_id| {
            let config = segment.0.clone();
            std::thread::spawn(move || {
                let registry = SharedAppRegistry::open(&config).unwrap();
                registry.register_lobby_app(app_id, 0).unwrap();
                registry.set_connection_settings(app_id, &launch_settings(false)).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let registry = SharedAppRegistry::open(&segment.0).unwrap();
    let mut ids: Vec<u32> = registry.lobby_apps().unwrap().iter().map(|e| e.app_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<_>>());

    // The table holds eight slots; a ninth application is refused.
    assert!(matches!(
        registry.register_lobby_app(9, 0),
        Err(PlayError::NoCapacity(_))
    ));
}
