//! Player and group roster for one open session.
//!
//! Players and groups share one id space. Membership is stored on the
//! group side only: a group knows its member players and member groups, and
//! optionally the group it was created inside. The group-in-group relation
//! never contains a cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use playnet_core::PlayerName;

use crate::error::{PlayError, PlayResult};

/// Player or group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct Dpid(pub u32);

impl Dpid {
    /// Addresses the session itself; never a player or group.
    pub const SYSTEM: Dpid = Dpid(0);
    /// The host's own player.
    pub const SERVER_PLAYER: Dpid = Dpid(1);

    const FIRST_AUTO: u32 = 2;
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// How the caller wants an id chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedId {
    /// Next free id from this roster's counter.
    Auto,
    /// Use exactly this id, typically one handed out by the host.
    Fixed(Dpid),
}

/// Snapshot of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub id: Dpid,
    pub name: PlayerName,
    pub data: Bytes,
    /// Created by this process rather than mirrored from a peer.
    pub local: bool,
}

/// Snapshot of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: Dpid,
    pub name: PlayerName,
    pub data: Bytes,
    pub parent: Option<Dpid>,
    pub players: Vec<Dpid>,
    pub groups: Vec<Dpid>,
}

struct Player {
    name: PlayerName,
    data: Bytes,
    wait_handle: Option<Arc<Notify>>,
    local: bool,
}

struct Group {
    name: PlayerName,
    data: Bytes,
    players: BTreeSet<Dpid>,
    groups: BTreeSet<Dpid>,
    parent: Option<Dpid>,
}

struct RosterState {
    next_id: u32,
    server_player_created: bool,
    players: BTreeMap<Dpid, Player>,
    groups: BTreeMap<Dpid, Group>,
}

impl RosterState {
    fn in_use(&self, id: Dpid) -> bool {
        self.players.contains_key(&id) || self.groups.contains_key(&id)
    }

    fn allocate(&mut self) -> PlayResult<Dpid> {
        // Bounded so a saturated id space fails instead of spinning.
        for _ in 0..u32::MAX {
            let candidate = Dpid(self.next_id);
            self.next_id = match self.next_id.checked_add(1) {
                Some(n) => n,
                None => Dpid::FIRST_AUTO,
            };
            if !self.in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(PlayError::NoCapacity("player id space"))
    }

    /// Insert a group, optionally as a member of `parent`. A fixed id that
    /// names an existing group replaces it; the old record's edges go with it.
    fn insert_group(
        &mut self,
        requested: RequestedId,
        name: PlayerName,
        data: &[u8],
        parent: Option<Dpid>,
    ) -> PlayResult<Dpid> {
        if let Some(parent) = parent {
            self.group(parent)?;
        }
        let id = match requested {
            RequestedId::Auto => self.allocate()?,
            RequestedId::Fixed(id) if id == Dpid::SYSTEM || id == Dpid::SERVER_PLAYER => {
                return Err(PlayError::InvalidParams(format!("group id {id} is reserved")))
            }
            RequestedId::Fixed(id) => id,
        };
        if parent == Some(id) {
            return Err(PlayError::InvalidParams(format!("group {id} cannot be created inside itself")));
        }

        if self.groups.contains_key(&id) {
            self.detach_group(id);
        }
        self.groups.insert(
            id,
            Group {
                name,
                data: Bytes::copy_from_slice(data),
                players: BTreeSet::new(),
                groups: BTreeSet::new(),
                parent,
            },
        );
        if let Some(parent) = parent {
            self.group_mut(parent)?.groups.insert(id);
        }
        Ok(id)
    }

    /// Remove a group and every edge that points at it. Child groups lose
    /// their parent but survive.
    fn detach_group(&mut self, id: Dpid) -> Option<Group> {
        let removed = self.groups.remove(&id)?;
        for group in self.groups.values_mut() {
            group.groups.remove(&id);
            if group.parent == Some(id) {
                group.parent = None;
            }
        }
        Some(removed)
    }

    fn group(&self, id: Dpid) -> PlayResult<&Group> {
        self.groups
            .get(&id)
            .ok_or_else(|| PlayError::NotFound(format!("group {id}")))
    }

    fn group_mut(&mut self, id: Dpid) -> PlayResult<&mut Group> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| PlayError::NotFound(format!("group {id}")))
    }

    fn player_mut(&mut self, id: Dpid) -> PlayResult<&mut Player> {
        self.players
            .get_mut(&id)
            .ok_or_else(|| PlayError::NotFound(format!("player {id}")))
    }

    /// Whether `target` is reachable from `from` through member groups.
    fn reaches(&self, from: Dpid, target: Dpid) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(g) = self.groups.get(&id) {
                stack.extend(g.groups.iter().copied());
            }
        }
        false
    }

    fn group_info(&self, id: Dpid, g: &Group) -> GroupInfo {
        GroupInfo {
            id,
            name: g.name.clone(),
            data: g.data.clone(),
            parent: g.parent,
            players: g.players.iter().copied().collect(),
            groups: g.groups.iter().copied().collect(),
        }
    }
}

/// Players and groups of one session, as seen by this process.
pub struct Roster {
    state: Mutex<RosterState>,
    is_host: bool,
}

impl Roster {
    pub fn new(is_host: bool) -> Self {
        Self {
            state: Mutex::new(RosterState {
                next_id: Dpid::FIRST_AUTO,
                server_player_created: false,
                players: BTreeMap::new(),
                groups: BTreeMap::new(),
            }),
            is_host,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Hand out a fresh id without creating anything. Used by the host to
    /// answer id requests from joining peers.
    pub fn allocate_id(&self) -> PlayResult<Dpid> {
        self.state.lock().allocate()
    }

    // ── Players ──────────────────────────────────────────────────────────────

    /// Create a player owned by this process.
    pub fn create_player(
        &self,
        requested: RequestedId,
        name: PlayerName,
        data: &[u8],
        wait_handle: Option<Arc<Notify>>,
    ) -> PlayResult<Dpid> {
        self.insert_player(requested, name, data, wait_handle, true)
    }

    /// Mirror a player created by a peer.
    pub fn create_remote_player(&self, id: Dpid, name: PlayerName, data: &[u8]) -> PlayResult<Dpid> {
        self.insert_player(RequestedId::Fixed(id), name, data, None, false)
    }

    fn insert_player(
        &self,
        requested: RequestedId,
        name: PlayerName,
        data: &[u8],
        wait_handle: Option<Arc<Notify>>,
        local: bool,
    ) -> PlayResult<Dpid> {
        let mut state = self.state.lock();
        let id = match requested {
            RequestedId::Auto => state.allocate()?,
            RequestedId::Fixed(Dpid::SYSTEM) => {
                return Err(PlayError::InvalidParams("player id 0 is reserved".into()))
            }
            RequestedId::Fixed(Dpid::SERVER_PLAYER) => {
                if !self.is_host {
                    return Err(PlayError::CannotCreatePlayer("only the host owns the server player"));
                }
                if state.server_player_created {
                    return Err(PlayError::CannotCreatePlayer("server player already created"));
                }
                state.server_player_created = true;
                Dpid::SERVER_PLAYER
            }
            RequestedId::Fixed(id) => id,
        };

        let replaced = state
            .players
            .insert(
                id,
                Player {
                    name,
                    data: Bytes::copy_from_slice(data),
                    wait_handle,
                    local,
                },
            )
            .is_some();
        drop(state);

        tracing::debug!(player = %id, local, replaced, "player created");
        Ok(id)
    }

    pub fn find_player(&self, id: Dpid) -> Option<PlayerInfo> {
        self.state.lock().players.get(&id).map(|p| PlayerInfo {
            id,
            name: p.name.clone(),
            data: p.data.clone(),
            local: p.local,
        })
    }

    pub fn player_data(&self, id: Dpid) -> PlayResult<Bytes> {
        let mut state = self.state.lock();
        Ok(state.player_mut(id)?.data.clone())
    }

    /// Replace the player's data with exactly `data`. Empty clears it.
    pub fn set_player_data(&self, id: Dpid, data: &[u8]) -> PlayResult<()> {
        self.state.lock().player_mut(id)?.data = Bytes::copy_from_slice(data);
        Ok(())
    }

    pub fn set_player_name(&self, id: Dpid, name: PlayerName) -> PlayResult<()> {
        self.state.lock().player_mut(id)?.name = name;
        Ok(())
    }

    /// Remove a player and every group membership it holds.
    pub fn destroy_player(&self, id: Dpid) -> PlayResult<()> {
        let mut state = self.state.lock();
        if state.players.remove(&id).is_none() {
            return Err(PlayError::NotFound(format!("player {id}")));
        }
        for group in state.groups.values_mut() {
            group.players.remove(&id);
        }
        drop(state);

        tracing::debug!(player = %id, "player destroyed");
        Ok(())
    }

    /// All players, ordered by id.
    pub fn players(&self) -> Vec<PlayerInfo> {
        self.state
            .lock()
            .players
            .iter()
            .map(|(id, p)| PlayerInfo {
                id: *id,
                name: p.name.clone(),
                data: p.data.clone(),
                local: p.local,
            })
            .collect()
    }

    pub fn player_ids(&self) -> Vec<Dpid> {
        self.state.lock().players.keys().copied().collect()
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().players.len()
    }

    /// Wake whoever waits on the player's handle. Returns `false` when the
    /// player has none.
    pub fn notify_player(&self, id: Dpid) -> PlayResult<bool> {
        let handle = self.state.lock().player_mut(id)?.wait_handle.clone();
        match handle {
            Some(notify) => {
                notify.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub fn create_group(&self, requested: RequestedId, name: PlayerName, data: &[u8]) -> PlayResult<Dpid> {
        let id = self.state.lock().insert_group(requested, name, data, None)?;
        tracing::debug!(group = %id, "group created");
        Ok(id)
    }

    /// Create a group and make it a member of `parent`.
    pub fn create_group_in_group(
        &self,
        parent: Dpid,
        requested: RequestedId,
        name: PlayerName,
        data: &[u8],
    ) -> PlayResult<Dpid> {
        let id = self.state.lock().insert_group(requested, name, data, Some(parent))?;
        tracing::debug!(group = %id, %parent, "group created");
        Ok(id)
    }

    pub fn find_group(&self, id: Dpid) -> Option<GroupInfo> {
        let state = self.state.lock();
        state.groups.get(&id).map(|g| state.group_info(id, g))
    }

    pub fn group_data(&self, id: Dpid) -> PlayResult<Bytes> {
        Ok(self.state.lock().group(id)?.data.clone())
    }

    /// Replace the group's data with exactly `data`. Empty clears it.
    pub fn set_group_data(&self, id: Dpid, data: &[u8]) -> PlayResult<()> {
        self.state.lock().group_mut(id)?.data = Bytes::copy_from_slice(data);
        Ok(())
    }

    pub fn set_group_name(&self, id: Dpid, name: PlayerName) -> PlayResult<()> {
        self.state.lock().group_mut(id)?.name = name;
        Ok(())
    }

    /// Remove a group, its membership in other groups, and its own member
    /// edges. Child groups lose their parent but survive.
    pub fn destroy_group(&self, id: Dpid) -> PlayResult<()> {
        let removed = self
            .state
            .lock()
            .detach_group(id)
            .ok_or_else(|| PlayError::NotFound(format!("group {id}")))?;

        tracing::debug!(
            group = %id,
            players = removed.players.len(),
            groups = removed.groups.len(),
            "group destroyed"
        );
        Ok(())
    }

    /// Groups not created inside another group, ordered by id.
    pub fn groups(&self) -> Vec<GroupInfo> {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .filter(|(_, g)| g.parent.is_none())
            .map(|(id, g)| state.group_info(*id, g))
            .collect()
    }

    pub fn group_players(&self, id: Dpid) -> PlayResult<Vec<Dpid>> {
        Ok(self.state.lock().group(id)?.players.iter().copied().collect())
    }

    pub fn groups_in_group(&self, id: Dpid) -> PlayResult<Vec<Dpid>> {
        Ok(self.state.lock().group(id)?.groups.iter().copied().collect())
    }

    pub fn group_parent(&self, id: Dpid) -> PlayResult<Option<Dpid>> {
        Ok(self.state.lock().group(id)?.parent)
    }

    // ── Membership ───────────────────────────────────────────────────────────

    pub fn add_player_to_group(&self, group: Dpid, player: Dpid) -> PlayResult<()> {
        let mut state = self.state.lock();
        if !state.players.contains_key(&player) {
            return Err(PlayError::NotFound(format!("player {player}")));
        }
        if !state.group_mut(group)?.players.insert(player) {
            return Err(PlayError::AlreadyExists(format!("player {player} in group {group}")));
        }
        Ok(())
    }

    pub fn remove_player_from_group(&self, group: Dpid, player: Dpid) -> PlayResult<()> {
        let mut state = self.state.lock();
        if !state.group_mut(group)?.players.remove(&player) {
            return Err(PlayError::NotFound(format!("player {player} in group {group}")));
        }
        Ok(())
    }

    /// Make `child` a member of `parent`. Rejects any edge that would close
    /// a cycle, including a group containing itself.
    pub fn add_group_to_group(&self, parent: Dpid, child: Dpid) -> PlayResult<()> {
        let mut state = self.state.lock();
        state.group(child)?;
        state.group(parent)?;
        if state.reaches(child, parent) {
            return Err(PlayError::InvalidParams(format!(
                "adding group {child} to {parent} would create a cycle"
            )));
        }
        if !state.group_mut(parent)?.groups.insert(child) {
            return Err(PlayError::AlreadyExists(format!("group {child} in group {parent}")));
        }
        Ok(())
    }

    pub fn remove_group_from_group(&self, parent: Dpid, child: Dpid) -> PlayResult<()> {
        let mut state = self.state.lock();
        if !state.group_mut(parent)?.groups.remove(&child) {
            return Err(PlayError::NotFound(format!("group {child} in group {parent}")));
        }
        if let Some(g) = state.groups.get_mut(&child) {
            if g.parent == Some(parent) {
                g.parent = None;
            }
        }
        Ok(())
    }
}
