//! Named shared segment guarded by a named POSIX semaphore.
//!
//! The segment is a file (by default under `/dev/shm`) mapped read-write
//! into every process that opens it. Its first bytes are a
//! [`SegmentHeader`] recording the geometry; the first opener initialises
//! it while holding the semaphore, later openers verify it.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::MmapMut;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::arena::BLOCK_HEADER_LEN;
use crate::error::{PlayError, PlayResult};

type U32le = U32<LittleEndian>;

/// `"plby"` read as a little-endian u32.
pub const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"plby");
pub const SEGMENT_VERSION: u32 = 1;

/// How long `open` and `lock` wait for the semaphore. A process that dies
/// while holding it leaves the count at zero; waiters then get
/// [`PlayError::Timeout`] instead of blocking forever.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire size: 28 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SegmentHeader {
    pub magic: U32le,
    pub version: U32le,
    pub slot_count: U32le,
    pub slot_size: U32le,
    pub block_size: U32le,
    pub block_count: U32le,
    /// Non-zero once the header and tables have been laid out.
    pub initialized: U32le,
}

assert_eq_size!(SegmentHeader, [u8; 28]);

pub const SEGMENT_HEADER_LEN: usize = std::mem::size_of::<SegmentHeader>();

/// Shape of a segment: a slot table followed by a block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub slot_count: u32,
    pub slot_size: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl Geometry {
    pub fn slots_len(&self) -> usize {
        self.slot_count as usize * self.slot_size as usize
    }

    pub fn arena_len(&self) -> usize {
        self.block_count as usize * self.block_size as usize
    }

    pub fn total_len(&self) -> usize {
        SEGMENT_HEADER_LEN + self.slots_len() + self.arena_len()
    }

    fn header(&self) -> SegmentHeader {
        SegmentHeader {
            magic: U32le::new(SEGMENT_MAGIC),
            version: U32le::new(SEGMENT_VERSION),
            slot_count: U32le::new(self.slot_count),
            slot_size: U32le::new(self.slot_size),
            block_size: U32le::new(self.block_size),
            block_count: U32le::new(self.block_count),
            initialized: U32le::new(1),
        }
    }

    fn matches(&self, header: &SegmentHeader) -> bool {
        header.magic.get() == SEGMENT_MAGIC
            && header.version.get() == SEGMENT_VERSION
            && header.slot_count.get() == self.slot_count
            && header.slot_size.get() == self.slot_size
            && header.block_size.get() == self.block_size
            && header.block_count.get() == self.block_count
    }
}

// ── Named semaphore ──────────────────────────────────────────────────────────

struct NamedSemaphore {
    sem: *mut libc::sem_t,
}

// sem_t handles from sem_open are process-wide and usable from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open or create the semaphore with an initial count of one.
    fn open(name: &CString) -> io::Result<Self> {
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem })
    }

    /// Returns `false` if the count stayed at zero for all of `timeout`.
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    fn post(&self) {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "sem_post failed");
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// `sem_timedwait` takes an absolute CLOCK_REALTIME deadline.
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

fn semaphore_name(name: &str) -> io::Result<CString> {
    CString::new(format!("/{name}"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

// ── Segment ──────────────────────────────────────────────────────────────────

/// One process's handle on a named segment.
pub struct SharedSegment {
    /// Start of `map`, taken while the map was uniquely owned.
    base: *mut u8,
    map: MmapMut,
    sem: NamedSemaphore,
    geometry: Geometry,
    path: PathBuf,
    lock_timeout: Duration,
}

// All access to `map` goes through `SegmentGuard`, which holds the semaphore.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Open `dir/name`, creating and initialising it if this is the first
    /// user on the machine.
    pub fn open(dir: &Path, name: &str, geometry: Geometry) -> PlayResult<Self> {
        if geometry.slot_count == 0 || geometry.block_count == 0 || geometry.slot_size == 0 {
            return Err(PlayError::InvalidParams(format!("empty segment geometry {geometry:?}")));
        }
        if geometry.block_size as usize <= BLOCK_HEADER_LEN {
            return Err(PlayError::InvalidParams(format!(
                "block size {} leaves no room after the {BLOCK_HEADER_LEN}-byte header",
                geometry.block_size
            )));
        }

        let sem = NamedSemaphore::open(&semaphore_name(name)?)?;
        let path = dir.join(name);

        if !sem.wait(DEFAULT_LOCK_TIMEOUT)? {
            tracing::warn!(path = %path.display(), "lobby semaphore never released; a holder may have died");
            return Err(PlayError::Timeout);
        }
        let opened = Self::map_and_init(&path, geometry);
        sem.post();
        let mut map = opened?;
        let base = map.as_mut_ptr();

        tracing::debug!(path = %path.display(), bytes = geometry.total_len(), "lobby segment mapped");
        Ok(Self {
            base,
            map,
            sem,
            geometry,
            path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Override how long [`lock`](Self::lock) waits for the semaphore.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn map_and_init(path: &Path, geometry: Geometry) -> PlayResult<MmapMut> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let total = geometry.total_len() as u64;
        let len = file.metadata()?.len();
        if len < total {
            // Extends with zeros, so a fresh segment reads as uninitialised.
            file.set_len(total)?;
        }

        // Safety: the file stays mapped for the life of the handle and every
        // mutation happens under the named semaphore.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let header = SegmentHeader::read_from_prefix(&map[..]).unwrap_or_else(SegmentHeader::new_zeroed);
        if header.initialized.get() == 0 {
            map[..geometry.total_len()].fill(0);
            map[..SEGMENT_HEADER_LEN].copy_from_slice(geometry.header().as_bytes());
            tracing::info!(path = %path.display(), "lobby segment initialised");
        } else if !geometry.matches(&header) {
            return Err(PlayError::InvalidParams(format!(
                "segment {} has a different layout (slots {}x{}, blocks {}x{})",
                path.display(),
                header.slot_count.get(),
                header.slot_size.get(),
                header.block_count.get(),
                header.block_size.get(),
            )));
        }
        Ok(map)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }

    /// Wait for the semaphore. Blocks the calling thread for at most the
    /// lock timeout; hold the guard only for short, non-blocking work.
    pub fn lock(&self) -> PlayResult<SegmentGuard<'_>> {
        if !self.sem.wait(self.lock_timeout)? {
            tracing::warn!(
                path = %self.path.display(),
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "lobby semaphore never released; a holder may have died"
            );
            return Err(PlayError::Timeout);
        }
        Ok(SegmentGuard { segment: self })
    }

    /// Remove the backing file and the semaphore name. Handles that are
    /// already open keep working until dropped.
    pub fn unlink(dir: &Path, name: &str) -> io::Result<()> {
        let sem_name = semaphore_name(name)?;
        unsafe {
            libc::sem_unlink(sem_name.as_ptr());
        }
        match std::fs::remove_file(dir.join(name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Exclusive access to the segment's tables. Posts the semaphore on drop.
pub struct SegmentGuard<'a> {
    segment: &'a SharedSegment,
}

impl SegmentGuard<'_> {
    /// Slot table and arena region, split.
    pub fn regions(&mut self) -> (&mut [u8], &mut [u8]) {
        let geometry = self.segment.geometry;
        let len = geometry.total_len();
        // Safety: the semaphore serialises every guard across processes and
        // threads, so this is the only live reference into the map. `&mut
        // self` keeps the returned slices from outliving the guard.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.segment.base, len)
        };
        let (_, rest) = bytes.split_at_mut(SEGMENT_HEADER_LEN);
        rest.split_at_mut(geometry.slots_len())
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.segment.sem.post();
    }
}
