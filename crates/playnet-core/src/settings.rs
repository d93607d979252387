//! Connection settings handed from a lobby client to a launched application.
//!
//! The flattened form is a fixed [`SettingsHeader`] followed by the
//! variable-length strings and the address blob. Every variable field is
//! addressed by a [`BlobLoc`] measured from the start of the buffer, so the
//! whole thing can be copied as one contiguous byte string.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::guid::Guid;
use crate::wire::{read_prefix, take_bytes, take_str, SessionDescriptor, SessionWire, U32le, WireError};

/// A player's display names.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PlayerName {
    pub short: String,
    pub long: Option<String>,
}

impl PlayerName {
    pub fn short(short: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            long: None,
        }
    }

    pub fn new(short: impl Into<String>, long: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            long: Some(long.into()),
        }
    }
}

/// Everything an application needs to join or host the session it was
/// launched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub flags: u32,
    pub session: SessionDescriptor,
    pub player_name: Option<PlayerName>,
    pub service_provider: Guid,
    /// Opaque provider address.
    pub address: Vec<u8>,
}

impl ConnectionSettings {
    /// Set in [`ConnectionSettings::flags`] when the application should host.
    pub const HOST: u32 = 0x0000_0001;

    pub fn is_host(&self) -> bool {
        self.flags & Self::HOST != 0
    }

    /// Size in bytes of [`encode`](Self::encode)'s output.
    pub fn encoded_len(&self) -> usize {
        let name = self.player_name.as_ref();
        std::mem::size_of::<SettingsHeader>()
            + self.session.name.len()
            + self.session.password.as_deref().map_or(0, str::len)
            + name.map_or(0, |n| n.short.len())
            + name.and_then(|n| n.long.as_deref()).map_or(0, str::len)
            + self.address.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; std::mem::size_of::<SettingsHeader>()];
        let name = self.player_name.as_ref();

        let session_name = push_blob(&mut out, Some(self.session.name.as_bytes()));
        let password = push_blob(&mut out, self.session.password.as_deref().map(str::as_bytes));
        let short_name = push_blob(&mut out, name.map(|n| n.short.as_bytes()));
        let long_name = push_blob(
            &mut out,
            name.and_then(|n| n.long.as_deref()).map(str::as_bytes),
        );
        let address = push_blob(&mut out, Some(&self.address));

        let mut session = self.session.to_wire();
        // Keep the caller's flags verbatim; PASSWORD_REQUIRED is only
        // synthesised for discovery replies.
        session.flags = U32le::new(self.session.flags.0);

        let header = SettingsHeader {
            size: U32le::new(out.len() as u32),
            flags: U32le::new(self.flags),
            session,
            session_name,
            password,
            short_name,
            long_name,
            service_provider: self.service_provider.0,
            address,
        };
        out[..std::mem::size_of::<SettingsHeader>()].copy_from_slice(header.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = read_prefix::<SettingsHeader>(buf)?;
        let declared = header.size.get() as usize;
        if declared > buf.len() {
            return Err(WireError::Truncated {
                needed: declared,
                got: buf.len(),
            });
        }
        let buf = &buf[..declared];

        let session_name = read_str(buf, header.session_name)?.unwrap_or_default();
        let password = read_str(buf, header.password)?;
        let player_name = match read_str(buf, header.short_name)? {
            Some(short) => Some(PlayerName {
                short,
                long: read_str(buf, header.long_name)?,
            }),
            None => None,
        };
        let address = read_blob(buf, header.address)?.unwrap_or_default().to_vec();

        let session = SessionDescriptor::from_wire(&header.session, session_name, password);
        session.validate()?;

        Ok(Self {
            flags: header.flags.get(),
            session,
            player_name,
            service_provider: Guid(header.service_provider),
            address,
        })
    }
}

// ── Flattened layout ─────────────────────────────────────────────────────────

/// Location of one variable-length field. `offset == 0` means absent.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BlobLoc {
    pub offset: U32le,
    pub len: U32le,
}

assert_eq_size!(BlobLoc, [u8; 8]);

/// Wire size: 112 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SettingsHeader {
    /// Total flattened size, header included.
    pub size: U32le,
    pub flags: U32le,
    pub session: SessionWire,
    pub session_name: BlobLoc,
    pub password: BlobLoc,
    pub short_name: BlobLoc,
    pub long_name: BlobLoc,
    pub service_provider: [u8; 16],
    pub address: BlobLoc,
}

assert_eq_size!(SettingsHeader, [u8; 112]);

fn push_blob(out: &mut Vec<u8>, bytes: Option<&[u8]>) -> BlobLoc {
    match bytes {
        Some(bytes) => {
            let loc = BlobLoc {
                offset: U32le::new(out.len() as u32),
                len: U32le::new(bytes.len() as u32),
            };
            out.extend_from_slice(bytes);
            loc
        }
        None => BlobLoc::default(),
    }
}

fn read_blob(buf: &[u8], loc: BlobLoc) -> Result<Option<&[u8]>, WireError> {
    let offset = loc.offset.get() as usize;
    if offset == 0 {
        return Ok(None);
    }
    let tail = buf.get(offset..).ok_or(WireError::BadOffset {
        offset,
        len: buf.len(),
    })?;
    let (bytes, _) = take_bytes(tail, loc.len.get() as usize)?;
    Ok(Some(bytes))
}

fn read_str(buf: &[u8], loc: BlobLoc) -> Result<Option<String>, WireError> {
    match read_blob(buf, loc)? {
        Some(bytes) => Ok(Some(take_str(bytes, bytes.len())?.0)),
        None => Ok(None),
    }
}
