//! Session directory — the per-connection cache of sessions heard from
//! discovery replies.
//!
//! Entries are kept oldest → newest. A refreshed entry moves to the newest
//! end, so pruning can walk from the front and stop at the first entry that
//! is still fresh.

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;

use playnet_core::{Guid, SessionDescriptor};

/// Entries older than this many ticks are pruned by default.
pub const DEFAULT_MAX_AGE: u32 = 60;

/// Coarse wrapping clock value, one tick per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tick(pub u32);

impl Tick {
    /// Signed distance from `earlier` to `self`. Survives wrap-around; a
    /// negative result means `earlier` is actually in the future.
    pub fn since(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }
}

/// Tick source anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Tick {
        Tick(self.start.elapsed().as_secs() as u32)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// One cached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCacheEntry {
    pub descriptor: SessionDescriptor,
    pub last_seen: Tick,
    /// Address the reply came from; where join traffic goes.
    pub source: SocketAddr,
}

#[derive(Default)]
pub struct SessionDirectory {
    entries: Mutex<VecDeque<SessionCacheEntry>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reply. A newer reply for the same instance replaces the old
    /// entry outright.
    pub fn insert(&self, descriptor: SessionDescriptor, source: SocketAddr, now: Tick) {
        let mut entries = self.entries.lock();
        let instance = descriptor.instance_id;
        let existing = entries
            .iter()
            .position(|e| e.descriptor.instance_id == instance);
        if let Some(i) = existing {
            entries.remove(i);
        }
        let refreshed = existing.is_some();
        entries.push_back(SessionCacheEntry {
            descriptor,
            last_seen: now,
            source,
        });
        drop(entries);

        if refreshed {
            tracing::trace!(%instance, %source, "session refreshed");
        } else {
            tracing::debug!(%instance, %source, "session discovered");
        }
    }

    /// Drop entries older than `max_age` ticks. Returns how many went.
    pub fn prune(&self, now: Tick, max_age: u32) -> usize {
        let max_age = max_age.min(i32::MAX as u32) as i32;
        let mut entries = self.entries.lock();
        let mut removed = 0;
        while let Some(front) = entries.front() {
            if now.since(front.last_seen) <= max_age {
                break;
            }
            entries.pop_front();
            removed += 1;
        }
        drop(entries);

        if removed > 0 {
            tracing::debug!(removed, "expired cached sessions");
        }
        removed
    }

    /// Hold the directory lock for lazy iteration. Do not await or call
    /// back into the directory while the guard is alive.
    pub fn lock(&self) -> DirectoryGuard<'_> {
        DirectoryGuard {
            entries: self.entries.lock(),
        }
    }

    /// Copy of every entry, oldest first.
    pub fn enumerate(&self) -> Vec<SessionCacheEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn find(&self, instance_id: &Guid) -> Option<SessionCacheEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.descriptor.instance_id == *instance_id)
            .cloned()
    }

    pub fn first_source_address(&self) -> Option<SocketAddr> {
        self.entries.lock().front().map(|e| e.source)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Locked view of a [`SessionDirectory`].
pub struct DirectoryGuard<'a> {
    entries: MutexGuard<'a, VecDeque<SessionCacheEntry>>,
}

impl DirectoryGuard<'_> {
    /// Entries oldest first. Restartable: each call begins at the front.
    pub fn enumerate(&self) -> impl Iterator<Item = &SessionCacheEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    fn session(name: &str) -> SessionDescriptor {
        SessionDescriptor::new(Guid::random(), name, 8)
    }

    #[test]
    fn newer_reply_replaces_older() {
        let dir = SessionDirectory::new();
        let mut first = session("alpha");
        dir.insert(first.clone(), addr(1), Tick(0));
        dir.insert(session("beta"), addr(2), Tick(1));

        first.current_players = 5;
        dir.insert(first.clone(), addr(3), Tick(2));

        assert_eq!(dir.len(), 2);
        let names: Vec<_> = dir
            .enumerate()
            .into_iter()
            .map(|e| e.descriptor.name)
            .collect();
        assert_eq!(names, ["beta", "alpha"]);

        let refreshed = dir.find(&first.instance_id).unwrap();
        assert_eq!(refreshed.descriptor.current_players, 5);
        assert_eq!(refreshed.source, addr(3));
        assert_eq!(refreshed.last_seen, Tick(2));
    }

    #[test]
    fn prune_stops_at_first_fresh_entry() {
        let dir = SessionDirectory::new();
        dir.insert(session("old"), addr(1), Tick(0));
        dir.insert(session("stale"), addr(2), Tick(50));
        dir.insert(session("fresh"), addr(3), Tick(100));

        // At tick 111: ages are 111, 61, 11.
        assert_eq!(dir.prune(Tick(111), DEFAULT_MAX_AGE), 2);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.enumerate()[0].descriptor.name, "fresh");
    }

    #[test]
    fn both_sessions_expire_one_tick_past_max_age() {
        let dir = SessionDirectory::new();
        dir.insert(session("first"), addr(1), Tick(0));
        dir.insert(session("second"), addr(2), Tick(0));

        assert_eq!(dir.prune(Tick(61), 60), 2);
        assert!(dir.enumerate().is_empty());
        assert_eq!(dir.first_source_address(), None);
    }

    #[test]
    fn repeated_prune_at_same_tick_is_idempotent() {
        let dir = SessionDirectory::new();
        dir.insert(session("gone"), addr(1), Tick(0));
        dir.insert(session("kept"), addr(2), Tick(40));

        assert_eq!(dir.prune(Tick(80), DEFAULT_MAX_AGE), 1);
        let survivors = dir.enumerate();
        assert_eq!(dir.prune(Tick(80), DEFAULT_MAX_AGE), 0);
        assert_eq!(dir.enumerate(), survivors);
        assert_eq!(survivors[0].descriptor.name, "kept");
    }

    #[test]
    fn prune_keeps_entry_exactly_at_max_age() {
        let dir = SessionDirectory::new();
        dir.insert(session("edge"), addr(1), Tick(10));
        assert_eq!(dir.prune(Tick(70), DEFAULT_MAX_AGE), 0);
        assert_eq!(dir.prune(Tick(71), DEFAULT_MAX_AGE), 1);
    }

    #[test]
    fn age_survives_clock_wrap() {
        let dir = SessionDirectory::new();
        dir.insert(session("wrapped"), addr(1), Tick(u32::MAX - 5));

        // The counter has wrapped past zero; age is 16.
        assert_eq!(Tick(10).since(Tick(u32::MAX - 5)), 16);
        assert_eq!(dir.prune(Tick(10), DEFAULT_MAX_AGE), 0);
        assert_eq!(dir.prune(Tick(60), DEFAULT_MAX_AGE), 1);
    }

    #[test]
    fn entry_from_the_future_is_fresh() {
        let dir = SessionDirectory::new();
        dir.insert(session("ahead"), addr(1), Tick(500));
        assert!(Tick(100).since(Tick(500)) < 0);
        assert_eq!(dir.prune(Tick(100), DEFAULT_MAX_AGE), 0);
    }

    #[test]
    fn locked_enumeration_is_restartable() {
        let dir = SessionDirectory::new();
        dir.insert(session("a"), addr(1), Tick(0));
        dir.insert(session("b"), addr(2), Tick(0));

        let guard = dir.lock();
        assert_eq!(guard.enumerate().count(), 2);
        assert_eq!(guard.enumerate().next().unwrap().descriptor.name, "a");
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn first_source_address_is_oldest_entry() {
        let dir = SessionDirectory::new();
        assert_eq!(dir.first_source_address(), None);
        dir.insert(session("a"), addr(7), Tick(0));
        dir.insert(session("b"), addr(8), Tick(1));
        assert_eq!(dir.first_source_address(), Some(addr(7)));
        dir.clear();
        assert!(dir.is_empty());
    }
}
