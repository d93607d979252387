//! Machine-wide table of lobbied applications.
//!
//! Each running application that a lobby client launched (or that registered
//! itself) owns one [`LobbySlot`] in the shared segment. Connection settings
//! are stored piecewise: the fixed fields live in the slot, and every
//! variable-length piece (session name, password, player names, address)
//! gets its own arena block referenced by index.
//!
//! Nothing here tears the segment down. Entries left behind by a process
//! that exits without unregistering stay until someone unregisters them.

use std::sync::OnceLock;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use playnet_core::config::LobbyConfig;
use playnet_core::wire::SessionWire;
use playnet_core::{ConnectionSettings, Guid, PlayerName, SessionDescriptor};

use super::arena::{Arena, BlockHandle};
use super::segment::{Geometry, SegmentGuard, SharedSegment};
use crate::error::{PlayError, PlayResult};

type U32le = U32<LittleEndian>;
type U64le = U64<LittleEndian>;

// ── Shared layout ────────────────────────────────────────────────────────────

/// Reference to one arena block holding a variable-length field.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BlobRef {
    /// Block index plus one; 0 = absent.
    pub block: U32le,
    pub len: U32le,
}

assert_eq_size!(BlobRef, [u8; 8]);

impl BlobRef {
    const NONE: BlobRef = BlobRef {
        block: U32::ZERO,
        len: U32::ZERO,
    };

    fn handle(&self) -> Option<BlockHandle> {
        match self.block.get() {
            0 => None,
            n => Some(BlockHandle(n - 1)),
        }
    }

    fn to(handle: BlockHandle, len: usize) -> Self {
        BlobRef {
            block: U32le::new(handle.0 + 1),
            len: U32le::new(len as u32),
        }
    }
}

/// One lobbied application.
///
/// Wire size: 132 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct LobbySlot {
    pub used: U32le,
    pub app_id: U32le,
    pub notify: U32le,
    /// Opaque event handle the lobby client signals.
    pub receive_event: U64le,
    pub state: U32le,
    pub connection_flags: U32le,
    pub session: SessionWire,
    pub service_provider: [u8; 16],
    pub session_name: BlobRef,
    pub password: BlobRef,
    pub short_name: BlobRef,
    pub long_name: BlobRef,
    pub address: BlobRef,
}

assert_eq_size!(LobbySlot, [u8; 132]);

const STATE_HAS_SETTINGS: u32 = 0x1;
const STATE_WAITING: u32 = 0x2;
const STATE_SETTINGS_READ: u32 = 0x4;

impl LobbySlot {
    fn has(&self, bit: u32) -> bool {
        self.state.get() & bit != 0
    }

    fn set(&mut self, bit: u32, on: bool) {
        let state = self.state.get();
        self.state = U32le::new(if on { state | bit } else { state & !bit });
    }

    fn blobs(&self) -> [BlobRef; 5] {
        [
            self.session_name,
            self.password,
            self.short_name,
            self.long_name,
            self.address,
        ]
    }

    fn entry(&self) -> LobbyAppEntry {
        LobbyAppEntry {
            app_id: self.app_id.get(),
            notify: NotifyFlags(self.notify.get()),
            receive_event: self.receive_event.get(),
            has_settings: self.has(STATE_HAS_SETTINGS),
            waiting_for_settings: self.has(STATE_WAITING),
            settings_read: self.has(STATE_SETTINGS_READ),
        }
    }
}

// ── Public types ─────────────────────────────────────────────────────────────

/// Events a lobby client wants to hear about for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct NotifyFlags(pub u32);

impl NotifyFlags {
    pub const ON_CONNECT: NotifyFlags = NotifyFlags(0x1);
    pub const ON_SETTINGS_READ: NotifyFlags = NotifyFlags(0x2);
    pub const ON_DEATH: NotifyFlags = NotifyFlags(0x4);

    pub fn contains(self, other: NotifyFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for NotifyFlags {
    type Output = NotifyFlags;

    fn bitor(self, rhs: NotifyFlags) -> NotifyFlags {
        NotifyFlags(self.0 | rhs.0)
    }
}

/// Copy of one table entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LobbyAppEntry {
    pub app_id: u32,
    pub notify: NotifyFlags,
    pub receive_event: u64,
    pub has_settings: bool,
    pub waiting_for_settings: bool,
    /// The application has fetched its settings since they were last set.
    pub settings_read: bool,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Handle on the shared lobby table. Several handles, in one process or
/// many, may point at the same segment.
pub struct SharedAppRegistry {
    segment: SharedSegment,
}

static GLOBAL: OnceLock<SharedAppRegistry> = OnceLock::new();

/// Locked view of the table.
struct Table<'a> {
    slots: &'a mut [LobbySlot],
    arena: Arena<'a>,
}

impl Table<'_> {
    fn find(&mut self, app_id: u32) -> PlayResult<&mut LobbySlot> {
        self.slots
            .iter_mut()
            .find(|s| s.used.get() != 0 && s.app_id.get() == app_id)
            .ok_or_else(|| PlayError::NotFound(format!("lobby application {app_id}")))
    }

    fn find_index(&self, app_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.used.get() != 0 && s.app_id.get() == app_id)
    }

    fn free_blobs(&mut self, index: usize) -> PlayResult<()> {
        for blob in self.slots[index].blobs() {
            if let Some(handle) = blob.handle() {
                self.arena.free(handle)?;
            }
        }
        let slot = &mut self.slots[index];
        slot.session_name = BlobRef::NONE;
        slot.password = BlobRef::NONE;
        slot.short_name = BlobRef::NONE;
        slot.long_name = BlobRef::NONE;
        slot.address = BlobRef::NONE;
        Ok(())
    }

    fn store(&mut self, data: Option<&[u8]>) -> PlayResult<BlobRef> {
        match data {
            Some(bytes) => Ok(BlobRef::to(self.arena.store(bytes)?, bytes.len())),
            None => Ok(BlobRef::NONE),
        }
    }

    fn load_str(&self, blob: BlobRef) -> PlayResult<Option<String>> {
        match blob.handle() {
            Some(handle) => {
                let bytes = self.arena.read(handle)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| PlayError::InvalidParams("stored string is not UTF-8".into()))?;
                Ok(Some(s.to_string()))
            }
            None => Ok(None),
        }
    }

    fn load_settings(&self, slot: &LobbySlot) -> PlayResult<ConnectionSettings> {
        let session_name = self.load_str(slot.session_name)?.unwrap_or_default();
        let password = self.load_str(slot.password)?;
        let player_name = match self.load_str(slot.short_name)? {
            Some(short) => Some(PlayerName {
                short,
                long: self.load_str(slot.long_name)?,
            }),
            None => None,
        };
        let address = match slot.address.handle() {
            Some(handle) => self.arena.read(handle)?.to_vec(),
            None => Vec::new(),
        };
        Ok(ConnectionSettings {
            flags: slot.connection_flags.get(),
            session: SessionDescriptor::from_wire(&slot.session, session_name, password),
            player_name,
            service_provider: Guid(slot.service_provider),
            address,
        })
    }
}

impl SharedAppRegistry {
    /// Open (or create) the segment described by `config`.
    pub fn open(config: &LobbyConfig) -> PlayResult<Self> {
        let geometry = Geometry {
            slot_count: config.slots,
            slot_size: std::mem::size_of::<LobbySlot>() as u32,
            block_size: config.block_size,
            block_count: config.block_count,
        };
        let segment = SharedSegment::open(&config.segment_dir, &config.segment_name, geometry)?;
        Ok(Self { segment })
    }

    /// Process-wide handle, opened on first use. The first caller's config
    /// decides which segment it maps.
    pub fn global(config: &LobbyConfig) -> PlayResult<&'static SharedAppRegistry> {
        if let Some(registry) = GLOBAL.get() {
            return Ok(registry);
        }
        let registry = Self::open(config)?;
        Ok(GLOBAL.get_or_init(|| registry))
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut Table<'_>) -> PlayResult<T>) -> PlayResult<T> {
        let block_size = self.segment.geometry().block_size as usize;
        let mut guard: SegmentGuard<'_> = self.segment.lock()?;
        let (slot_bytes, arena_bytes) = guard.regions();
        let slots = LobbySlot::mut_slice_from(slot_bytes)
            .ok_or_else(|| PlayError::InvalidParams("slot table is misaligned".into()))?;
        let arena = Arena::new(arena_bytes, block_size)?;
        f(&mut Table { slots, arena })
    }

    /// Add `app_id` to the table. `0` registers the calling process.
    pub fn register_lobby_app(&self, app_id: u32, receive_event: u64) -> PlayResult<()> {
        let app_id = resolve(app_id);
        self.with_table(|table| {
            if table.find_index(app_id).is_some() {
                return Err(PlayError::AlreadyExists(format!("lobby application {app_id}")));
            }
            let slot = table
                .slots
                .iter_mut()
                .find(|s| s.used.get() == 0)
                .ok_or(PlayError::NoCapacity("lobby table"))?;
            *slot = LobbySlot::new_zeroed();
            slot.used = U32le::new(1);
            slot.app_id = U32le::new(app_id);
            slot.receive_event = U64le::new(receive_event);
            Ok(())
        })?;
        tracing::info!(app_id, "lobby application registered");
        Ok(())
    }

    /// Remove `app_id` and release its stored settings.
    pub fn unregister_lobby_app(&self, app_id: u32) -> PlayResult<()> {
        let app_id = resolve(app_id);
        self.with_table(|table| {
            let index = table
                .find_index(app_id)
                .ok_or_else(|| PlayError::NotFound(format!("lobby application {app_id}")))?;
            table.free_blobs(index)?;
            table.slots[index] = LobbySlot::new_zeroed();
            Ok(())
        })?;
        tracing::info!(app_id, "lobby application unregistered");
        Ok(())
    }

    /// Look up `app_id`; `0` means the calling process.
    pub fn is_lobbied(&self, app_id: u32) -> PlayResult<LobbyAppEntry> {
        let app_id = resolve(app_id);
        self.with_table(|table| Ok(table.find(app_id)?.entry()))
    }

    /// Every registered application, in slot order.
    pub fn lobby_apps(&self) -> PlayResult<Vec<LobbyAppEntry>> {
        self.with_table(|table| {
            Ok(table
                .slots
                .iter()
                .filter(|s| s.used.get() != 0)
                .map(LobbySlot::entry)
                .collect())
        })
    }

    /// Flattened settings for `app_id`, no larger than `capacity`.
    ///
    /// A `capacity` of zero asks only for the size, which comes back as
    /// [`PlayError::BufferTooSmall`].
    pub fn get_connection_settings(&self, app_id: u32, capacity: usize) -> PlayResult<Vec<u8>> {
        let app_id = resolve(app_id);
        self.with_table(|table| {
            let index = table
                .find_index(app_id)
                .ok_or_else(|| PlayError::NotFound(format!("lobby application {app_id}")))?;
            if !table.slots[index].has(STATE_HAS_SETTINGS) {
                return Err(PlayError::NotFound(format!(
                    "connection settings for application {app_id}"
                )));
            }

            let settings = table.load_settings(&table.slots[index])?;
            let required = settings.encoded_len();
            if capacity < required {
                return Err(PlayError::BufferTooSmall { required });
            }

            table.slots[index].set(STATE_SETTINGS_READ, true);
            Ok(settings.encode())
        })
    }

    /// Replace `app_id`'s settings. Old blocks are released before the new
    /// ones are claimed.
    pub fn set_connection_settings(&self, app_id: u32, settings: &ConnectionSettings) -> PlayResult<()> {
        let app_id = resolve(app_id);
        settings
            .session
            .validate()
            .map_err(|e| PlayError::InvalidParams(e.to_string()))?;

        let name = settings.player_name.as_ref();
        let pieces: [Option<&[u8]>; 5] = [
            Some(settings.session.name.as_bytes()),
            settings.session.password.as_deref().map(str::as_bytes),
            name.map(|n| n.short.as_bytes()),
            name.and_then(|n| n.long.as_deref()).map(str::as_bytes),
            Some(&settings.address),
        ];

        self.with_table(|table| {
            let index = table
                .find_index(app_id)
                .ok_or_else(|| PlayError::NotFound(format!("lobby application {app_id}")))?;

            let limit = table.arena.capacity();
            if let Some(too_big) = pieces.iter().flatten().find(|p| p.len() > limit) {
                return Err(PlayError::RequestTooLarge {
                    requested: too_big.len(),
                    limit,
                });
            }

            table.free_blobs(index)?;
            table.slots[index].set(STATE_HAS_SETTINGS, false);

            let mut stored = [BlobRef::NONE; 5];
            for (i, piece) in pieces.iter().enumerate() {
                match table.store(*piece) {
                    Ok(blob) => stored[i] = blob,
                    Err(e) => {
                        for blob in &stored[..i] {
                            if let Some(handle) = blob.handle() {
                                table.arena.free(handle)?;
                            }
                        }
                        return Err(e);
                    }
                }
            }

            let mut session = settings.session.to_wire();
            session.flags = U32le::new(settings.session.flags.0);

            let slot = &mut table.slots[index];
            slot.connection_flags = U32le::new(settings.flags);
            slot.session = session;
            slot.service_provider = settings.service_provider.0;
            let [session_name, password, short_name, long_name, address] = stored;
            slot.session_name = session_name;
            slot.password = password;
            slot.short_name = short_name;
            slot.long_name = long_name;
            slot.address = address;
            slot.set(STATE_HAS_SETTINGS, true);
            slot.set(STATE_SETTINGS_READ, false);
            Ok(())
        })?;
        tracing::debug!(app_id, "connection settings stored");
        Ok(())
    }

    pub fn set_notify(&self, app_id: u32, notify: NotifyFlags) -> PlayResult<()> {
        let app_id = resolve(app_id);
        self.with_table(|table| {
            table.find(app_id)?.notify = U32le::new(notify.0);
            Ok(())
        })
    }

    pub fn set_waiting_for_settings(&self, app_id: u32, waiting: bool) -> PlayResult<()> {
        let app_id = resolve(app_id);
        self.with_table(|table| {
            table.find(app_id)?.set(STATE_WAITING, waiting);
            Ok(())
        })
    }

    /// Whether any registered application is blocked waiting for settings.
    pub fn any_waiting_for_settings(&self) -> PlayResult<bool> {
        self.with_table(|table| {
            Ok(table
                .slots
                .iter()
                .any(|s| s.used.get() != 0 && s.has(STATE_WAITING)))
        })
    }

    /// Arena blocks currently allocated.
    pub fn used_blocks(&self) -> PlayResult<usize> {
        self.with_table(|table| Ok(table.arena.used_blocks()))
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}

fn resolve(app_id: u32) -> u32 {
    if app_id == 0 {
        std::process::id()
    } else {
        app_id
    }
}
