//! Playnet wire format — on-wire types for session discovery and
//! player management traffic.
//!
//! Every datagram starts with an [`EnvelopeHeader`]. Fixed-size payload
//! prefixes are `#[repr(C)]` structs of little-endian, byte-aligned fields so
//! that zerocopy can read and write them without padding or unsafe code.
//! Variable-length data (names, passwords, opaque blobs) trails the fixed
//! prefix and is always length-prefixed or addressed by an explicit offset.
//!
//! A receiver that cannot decode a datagram drops it. Nothing in this module
//! ever hands a partially decoded envelope upward.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::guid::Guid;
use crate::settings::PlayerName;

pub type U16le = U16<LittleEndian>;
pub type U32le = U32<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Envelope magic, `"play"` read as a little-endian u32.
pub const MAGIC: u32 = 0x7961_6c70;

/// Current protocol version carried in every envelope.
pub const VERSION: u16 = 0x000B;

/// Default UDP port for discovery and session traffic.
pub const DEFAULT_PORT: u16 = 47624;

/// Largest datagram the codec will build or accept.
pub const MAX_DATAGRAM: usize = 1400;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Prefix of every Playnet datagram.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// Always [`MAGIC`]. Anything else is discarded on receipt.
    pub magic: U32le,
    /// One of the [`CommandId`] values.
    pub command: U16le,
    /// Sender's protocol version. Carried through, not enforced.
    pub version: U16le,
}

assert_eq_size!(EnvelopeHeader, [u8; 8]);

/// Command identifiers used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    EnumSessionsReply = 1,
    EnumSessionsRequest = 2,
    GetNameTableReply = 3,
    GetNameTable = 4,
    RequestNewPlayerId = 5,
    NewPlayerIdReply = 7,
    ForwardAddPlayer = 19,
    ForwardAddPlayerNack = 36,
}

impl CommandId {
    /// Smallest payload (bytes after the envelope) a valid message of this
    /// command can carry.
    pub fn min_payload_len(self) -> usize {
        match self {
            CommandId::EnumSessionsRequest => std::mem::size_of::<DiscoveryRequestWire>(),
            CommandId::EnumSessionsReply => std::mem::size_of::<SessionWire>(),
            CommandId::RequestNewPlayerId => std::mem::size_of::<NewPlayerIdRequestWire>(),
            CommandId::NewPlayerIdReply => std::mem::size_of::<NewPlayerIdReplyWire>(),
            CommandId::ForwardAddPlayer => std::mem::size_of::<ForwardAddPlayerWire>(),
            CommandId::ForwardAddPlayerNack => std::mem::size_of::<ForwardAddPlayerNackWire>(),
            CommandId::GetNameTable => 0,
            CommandId::GetNameTableReply => std::mem::size_of::<NameTableWire>(),
        }
    }
}

impl TryFrom<u16> for CommandId {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandId::EnumSessionsReply),
            2 => Ok(CommandId::EnumSessionsRequest),
            3 => Ok(CommandId::GetNameTableReply),
            4 => Ok(CommandId::GetNameTable),
            5 => Ok(CommandId::RequestNewPlayerId),
            7 => Ok(CommandId::NewPlayerIdReply),
            19 => Ok(CommandId::ForwardAddPlayer),
            36 => Ok(CommandId::ForwardAddPlayerNack),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl From<CommandId> for u16 {
    fn from(c: CommandId) -> u16 {
        c as u16
    }
}

/// A decoded datagram: envelope fields plus a borrowed view of the payload.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub command: CommandId,
    pub version: u16,
    pub payload: &'a [u8],
}

/// Build a datagram from an envelope and a pre-encoded payload.
pub fn encode(command: CommandId, version: u16, payload: &[u8]) -> Vec<u8> {
    let header = EnvelopeHeader {
        magic: U32le::new(MAGIC),
        command: U16le::new(command.into()),
        version: U16le::new(version),
    };
    let mut out = Vec::with_capacity(std::mem::size_of::<EnvelopeHeader>() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse a datagram.
///
/// Fails on a short buffer, a foreign magic, an unknown command, or a
/// payload shorter than the command's fixed prefix.
pub fn decode(buf: &[u8]) -> Result<Message<'_>, WireError> {
    let header = EnvelopeHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
        needed: std::mem::size_of::<EnvelopeHeader>(),
        got: buf.len(),
    })?;

    let magic = header.magic.get();
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let command = CommandId::try_from(header.command.get())?;
    let payload = &buf[std::mem::size_of::<EnvelopeHeader>()..];
    let needed = command.min_payload_len();
    if payload.len() < needed {
        return Err(WireError::PayloadTooShort {
            command,
            needed,
            got: payload.len(),
        });
    }

    Ok(Message {
        command,
        version: header.version.get(),
        payload,
    })
}

// ── Session descriptor ───────────────────────────────────────────────────────

/// Session property bits, as carried in [`SessionWire::flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionFlags(pub u32);

impl SessionFlags {
    pub const NEW_PLAYERS_DISABLED: SessionFlags = SessionFlags(0x0000_0001);
    pub const MIGRATE_HOST: SessionFlags = SessionFlags(0x0000_0004);
    pub const NO_MESSAGE_ID: SessionFlags = SessionFlags(0x0000_0008);
    pub const JOIN_DISABLED: SessionFlags = SessionFlags(0x0000_0020);
    pub const KEEP_ALIVE: SessionFlags = SessionFlags(0x0000_0040);
    pub const PASSWORD_REQUIRED: SessionFlags = SessionFlags(0x0000_0400);

    pub fn contains(self, other: SessionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SessionFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SessionFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SessionFlags {
    type Output = SessionFlags;

    fn bitor(self, rhs: SessionFlags) -> SessionFlags {
        SessionFlags(self.0 | rhs.0)
    }
}

/// Everything a peer knows about one running session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionDescriptor {
    /// Unique per running session.
    pub instance_id: Guid,
    /// Which application the session belongs to.
    pub application_id: Guid,
    pub name: String,
    /// Never leaves the host; replies only carry [`SessionFlags::PASSWORD_REQUIRED`].
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// 0 means unlimited.
    pub max_players: u32,
    /// Peer-reported.
    pub current_players: u32,
    pub flags: SessionFlags,
}

impl SessionDescriptor {
    pub fn new(application_id: Guid, name: impl Into<String>, max_players: u32) -> Self {
        Self {
            instance_id: Guid::random(),
            application_id,
            name: name.into(),
            password: None,
            max_players,
            current_players: 0,
            flags: SessionFlags::default(),
        }
    }

    /// `current_players <= max_players` whenever a maximum is set.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.max_players != 0 && self.current_players > self.max_players {
            return Err(WireError::TooManyPlayers {
                current: self.current_players,
                max: self.max_players,
            });
        }
        Ok(())
    }

    /// Fixed prefix shared by discovery replies and flattened connection
    /// settings.
    pub fn to_wire(&self) -> SessionWire {
        let mut flags = self.flags;
        if self.password.as_deref().is_some_and(|p| !p.is_empty()) {
            flags.insert(SessionFlags::PASSWORD_REQUIRED);
        }
        SessionWire {
            flags: U32le::new(flags.0),
            instance_id: self.instance_id.0,
            application_id: self.application_id.0,
            max_players: U32le::new(self.max_players),
            current_players: U32le::new(self.current_players),
            name_len: U32le::new(self.name.len() as u32),
        }
    }

    /// Payload of an `EnumSessionsReply`: fixed prefix then the name.
    pub fn encode_reply(&self) -> Vec<u8> {
        let wire = self.to_wire();
        let mut out = Vec::with_capacity(std::mem::size_of::<SessionWire>() + self.name.len());
        out.extend_from_slice(wire.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    /// Parse an `EnumSessionsReply` payload. The result never carries a
    /// password.
    pub fn decode_reply(payload: &[u8]) -> Result<Self, WireError> {
        let wire = read_prefix::<SessionWire>(payload)?;
        let rest = &payload[std::mem::size_of::<SessionWire>()..];
        let (name, _) = take_str(rest, wire.name_len.get() as usize)?;
        let desc = Self::from_wire(&wire, name, None);
        desc.validate()?;
        Ok(desc)
    }

    pub fn from_wire(wire: &SessionWire, name: String, password: Option<String>) -> Self {
        Self {
            instance_id: Guid(wire.instance_id),
            application_id: Guid(wire.application_id),
            name,
            password,
            max_players: wire.max_players.get(),
            current_players: wire.current_players.get(),
            flags: SessionFlags(wire.flags.get()),
        }
    }
}

/// Fixed part of a session descriptor.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SessionWire {
    pub flags: U32le,
    pub instance_id: [u8; 16],
    pub application_id: [u8; 16],
    pub max_players: U32le,
    pub current_players: U32le,
    /// Length of the UTF-8 name that follows the fixed part.
    pub name_len: U32le,
}

assert_eq_size!(SessionWire, [u8; 48]);

// ── Discovery request ────────────────────────────────────────────────────────

/// Filter bits a browser sends with a discovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumFlags(pub u32);

impl EnumFlags {
    /// Only sessions accepting new players (the default when no bits are set).
    pub const AVAILABLE: EnumFlags = EnumFlags(0x0000_0001);
    /// Include sessions that have joining disabled.
    pub const ALL: EnumFlags = EnumFlags(0x0000_0002);
    /// Include password-protected sessions.
    pub const PASSWORD_REQUIRED: EnumFlags = EnumFlags(0x0000_0040);

    pub fn contains(self, other: EnumFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Fixed part of an `EnumSessionsRequest`.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DiscoveryRequestWire {
    pub application_id: [u8; 16],
    /// Length of the UTF-8 password that follows. 0 = none.
    pub password_len: U32le,
    pub flags: U32le,
}

assert_eq_size!(DiscoveryRequestWire, [u8; 24]);

/// What a browser is looking for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryQuery {
    /// Nil matches every application.
    pub application_id: Guid,
    pub password: Option<String>,
    pub flags: EnumFlags,
}

impl DiscoveryQuery {
    pub fn for_application(application_id: Guid) -> Self {
        Self {
            application_id,
            password: None,
            flags: EnumFlags::default(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let password = self.password.as_deref().unwrap_or("");
        let wire = DiscoveryRequestWire {
            application_id: self.application_id.0,
            password_len: U32le::new(password.len() as u32),
            flags: U32le::new(self.flags.0),
        };
        let mut out = wire.as_bytes().to_vec();
        out.extend_from_slice(password.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let wire = read_prefix::<DiscoveryRequestWire>(payload)?;
        let rest = &payload[std::mem::size_of::<DiscoveryRequestWire>()..];
        let (password, _) = take_str(rest, wire.password_len.get() as usize)?;
        Ok(Self {
            application_id: Guid(wire.application_id),
            password: (!password.is_empty()).then_some(password),
            flags: EnumFlags(wire.flags.get()),
        })
    }

    /// Whether a host should answer this query for `session`.
    pub fn admits(&self, session: &SessionDescriptor) -> bool {
        if !session.application_id.matches_application(&self.application_id) {
            return false;
        }
        let wants_all = self.flags.contains(EnumFlags::ALL);
        if !wants_all
            && (session.flags.contains(SessionFlags::JOIN_DISABLED)
                || session.flags.contains(SessionFlags::NEW_PLAYERS_DISABLED))
        {
            return false;
        }
        if !wants_all
            && session.max_players != 0
            && session.current_players >= session.max_players
        {
            return false;
        }
        let protected = session.password.as_deref().is_some_and(|p| !p.is_empty());
        if protected && !self.flags.contains(EnumFlags::PASSWORD_REQUIRED) {
            return false;
        }
        true
    }
}

// ── Player id service ────────────────────────────────────────────────────────

/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct NewPlayerIdRequestWire {
    pub flags: U32le,
}

assert_eq_size!(NewPlayerIdRequestWire, [u8; 4]);

/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct NewPlayerIdReplyWire {
    pub player_id: U32le,
}

assert_eq_size!(NewPlayerIdReplyWire, [u8; 4]);

pub fn encode_new_player_id_request(flags: u32) -> Vec<u8> {
    NewPlayerIdRequestWire {
        flags: U32le::new(flags),
    }
    .as_bytes()
    .to_vec()
}

pub fn decode_new_player_id_request(payload: &[u8]) -> Result<u32, WireError> {
    Ok(read_prefix::<NewPlayerIdRequestWire>(payload)?.flags.get())
}

pub fn encode_new_player_id_reply(player_id: u32) -> Vec<u8> {
    NewPlayerIdReplyWire {
        player_id: U32le::new(player_id),
    }
    .as_bytes()
    .to_vec()
}

pub fn decode_new_player_id_reply(payload: &[u8]) -> Result<u32, WireError> {
    Ok(read_prefix::<NewPlayerIdReplyWire>(payload)?.player_id.get())
}

// ── Forwarded player creation ────────────────────────────────────────────────

/// Fixed part of a `ForwardAddPlayer`. Offsets are measured from the start
/// of the payload; 0 means "absent".
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ForwardAddPlayerWire {
    pub to_id: U32le,
    pub player_id: U32le,
    pub group_id: U32le,
    pub create_offset: U32le,
    pub password_offset: U32le,
}

assert_eq_size!(ForwardAddPlayerWire, [u8; 20]);

/// Player creation block referenced by `create_offset`, followed by the
/// short name, long name, and application data bytes.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PlayerCreateBlock {
    pub flags: U32le,
    pub short_name_len: U32le,
    pub long_name_len: U32le,
    pub data_len: U32le,
}

assert_eq_size!(PlayerCreateBlock, [u8; 16]);

/// A client asking the host to add a player it has created locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardAddPlayer {
    pub to_id: u32,
    pub player_id: u32,
    /// 0 = not added to any group.
    pub group_id: u32,
    pub flags: u32,
    pub name: PlayerName,
    pub data: Vec<u8>,
    pub password: Option<String>,
}

impl ForwardAddPlayer {
    pub fn encode(&self) -> Vec<u8> {
        let fixed = std::mem::size_of::<ForwardAddPlayerWire>();
        let long = self.name.long.as_deref().unwrap_or("");

        let mut create = PlayerCreateBlock {
            flags: U32le::new(self.flags),
            short_name_len: U32le::new(self.name.short.len() as u32),
            long_name_len: U32le::new(long.len() as u32),
            data_len: U32le::new(self.data.len() as u32),
        }
        .as_bytes()
        .to_vec();
        create.extend_from_slice(self.name.short.as_bytes());
        create.extend_from_slice(long.as_bytes());
        create.extend_from_slice(&self.data);

        let create_offset = fixed;
        let password_offset = match self.password {
            Some(_) => create_offset + create.len(),
            None => 0,
        };

        let header = ForwardAddPlayerWire {
            to_id: U32le::new(self.to_id),
            player_id: U32le::new(self.player_id),
            group_id: U32le::new(self.group_id),
            create_offset: U32le::new(create_offset as u32),
            password_offset: U32le::new(password_offset as u32),
        };

        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(&create);
        if let Some(password) = &self.password {
            out.extend_from_slice(U32le::new(password.len() as u32).as_bytes());
            out.extend_from_slice(password.as_bytes());
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let header = read_prefix::<ForwardAddPlayerWire>(payload)?;

        let create_offset = header.create_offset.get() as usize;
        let create_bytes = payload.get(create_offset..).ok_or(WireError::BadOffset {
            offset: create_offset,
            len: payload.len(),
        })?;
        let create = read_prefix::<PlayerCreateBlock>(create_bytes)?;
        let rest = &create_bytes[std::mem::size_of::<PlayerCreateBlock>()..];
        let (short, rest) = take_str(rest, create.short_name_len.get() as usize)?;
        let (long, rest) = take_str(rest, create.long_name_len.get() as usize)?;
        let (data, _) = take_bytes(rest, create.data_len.get() as usize)?;

        let password = match header.password_offset.get() as usize {
            0 => None,
            offset => {
                let bytes = payload.get(offset..).ok_or(WireError::BadOffset {
                    offset,
                    len: payload.len(),
                })?;
                let len = read_prefix::<U32le>(bytes)?.get() as usize;
                let (password, _) = take_str(&bytes[4..], len)?;
                Some(password)
            }
        };

        Ok(Self {
            to_id: header.to_id.get(),
            player_id: header.player_id.get(),
            group_id: header.group_id.get(),
            flags: create.flags.get(),
            name: PlayerName {
                short,
                long: (!long.is_empty()).then_some(long),
            },
            data: data.to_vec(),
            password,
        })
    }
}

/// Host refusal of a forwarded player creation.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ForwardAddPlayerNackWire {
    pub error: U32le,
}

assert_eq_size!(ForwardAddPlayerNackWire, [u8; 4]);

pub fn encode_forward_add_player_nack(error: u32) -> Vec<u8> {
    ForwardAddPlayerNackWire {
        error: U32le::new(error),
    }
    .as_bytes()
    .to_vec()
}

pub fn decode_forward_add_player_nack(payload: &[u8]) -> Result<u32, WireError> {
    Ok(read_prefix::<ForwardAddPlayerNackWire>(payload)?.error.get())
}

// ── Name table ───────────────────────────────────────────────────────────────

/// Prefix of a `GetNameTableReply`: a count followed by that many
/// little-endian player ids. Peers that synchronise richer state treat the
/// whole payload as opaque.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct NameTableWire {
    pub count: U32le,
}

pub fn encode_name_table(ids: &[u32]) -> Vec<u8> {
    let mut out = NameTableWire {
        count: U32le::new(ids.len() as u32),
    }
    .as_bytes()
    .to_vec();
    for id in ids {
        out.extend_from_slice(U32le::new(*id).as_bytes());
    }
    out
}

pub fn decode_name_table(payload: &[u8]) -> Result<Vec<u32>, WireError> {
    let count = read_prefix::<NameTableWire>(payload)?.count.get() as usize;
    let (ids, _) = take_bytes(&payload[4..], count.saturating_mul(4))?;
    Ok(ids
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub(crate) fn read_prefix<T: FromBytes>(bytes: &[u8]) -> Result<T, WireError> {
    T::read_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: std::mem::size_of::<T>(),
        got: bytes.len(),
    })
}

pub(crate) fn take_bytes(bytes: &[u8], len: usize) -> Result<(&[u8], &[u8]), WireError> {
    if bytes.len() < len {
        return Err(WireError::Truncated {
            needed: len,
            got: bytes.len(),
        });
    }
    Ok(bytes.split_at(len))
}

pub(crate) fn take_str(bytes: &[u8], len: usize) -> Result<(String, &[u8]), WireError> {
    let (raw, rest) = take_bytes(bytes, len)?;
    let s = std::str::from_utf8(raw).map_err(|_| WireError::BadString)?;
    Ok((s.to_string(), rest))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("bad envelope magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unknown command id: {0}")]
    UnknownCommand(u16),

    #[error("{command:?} payload too short: needed {needed} bytes, got {got}")]
    PayloadTooShort {
        command: CommandId,
        needed: usize,
        got: usize,
    },

    #[error("offset {offset} outside payload of {len} bytes")]
    BadOffset { offset: usize, len: usize },

    #[error("string is not valid UTF-8")]
    BadString,

    #[error("malformed GUID: {0}")]
    BadGuid(String),

    #[error("session reports {current} players with a maximum of {max}")]
    TooManyPlayers { current: u32, max: u32 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
