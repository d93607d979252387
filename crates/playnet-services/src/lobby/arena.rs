//! Fixed-block allocator over a byte region.
//!
//! The region is cut into equal blocks. Each block starts with a
//! [`BlockHeader`]; the rest is payload. Blocks are addressed only by index,
//! so the same handle is meaningful in every process that maps the region.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{PlayError, PlayResult};

type U32le = U32<LittleEndian>;

/// Default block size, header included.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BlockHeader {
    /// 1 = allocated.
    pub used: U32le,
    /// Payload bytes in use.
    pub len: U32le,
}

assert_eq_size!(BlockHeader, [u8; 8]);

pub const BLOCK_HEADER_LEN: usize = std::mem::size_of::<BlockHeader>();

/// Index of one arena block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u32);

/// Mutable view of an arena region.
pub struct Arena<'a> {
    bytes: &'a mut [u8],
    block_size: usize,
}

impl<'a> Arena<'a> {
    /// `bytes.len()` must be a multiple of `block_size`, and `block_size`
    /// must leave room for a payload.
    pub fn new(bytes: &'a mut [u8], block_size: usize) -> PlayResult<Self> {
        if block_size <= BLOCK_HEADER_LEN || bytes.len() % block_size != 0 {
            return Err(PlayError::InvalidParams(format!(
                "arena of {} bytes cannot hold {block_size}-byte blocks",
                bytes.len()
            )));
        }
        Ok(Self { bytes, block_size })
    }

    pub fn block_count(&self) -> usize {
        self.bytes.len() / self.block_size
    }

    /// Largest payload one block holds.
    pub fn capacity(&self) -> usize {
        self.block_size - BLOCK_HEADER_LEN
    }

    pub fn used_blocks(&self) -> usize {
        (0..self.block_count())
            .filter(|&i| self.header(i).used.get() != 0)
            .count()
    }

    /// Claim the first free block for `size` payload bytes.
    pub fn alloc(&mut self, size: usize) -> PlayResult<BlockHandle> {
        if size > self.capacity() {
            return Err(PlayError::RequestTooLarge {
                requested: size,
                limit: self.capacity(),
            });
        }
        let index = (0..self.block_count())
            .find(|&i| self.header(i).used.get() == 0)
            .ok_or(PlayError::NoCapacity("lobby arena"))?;

        let header = self.header_mut(index)?;
        header.used = U32le::new(1);
        header.len = U32le::new(size as u32);
        Ok(BlockHandle(index as u32))
    }

    /// Allocate a block and copy `data` into it.
    pub fn store(&mut self, data: &[u8]) -> PlayResult<BlockHandle> {
        let handle = self.alloc(data.len())?;
        let start = self.payload_start(handle.0 as usize);
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(handle)
    }

    /// Release a block. Its payload is zeroed.
    pub fn free(&mut self, handle: BlockHandle) -> PlayResult<()> {
        let index = self.checked_index(handle)?;
        if self.header(index).used.get() == 0 {
            return Err(PlayError::InvalidParams(format!("block {} is not allocated", handle.0)));
        }
        let start = index * self.block_size;
        self.bytes[start..start + self.block_size].fill(0);
        Ok(())
    }

    /// Payload of an allocated block, at its stored length.
    pub fn read(&self, handle: BlockHandle) -> PlayResult<&[u8]> {
        let index = self.checked_index(handle)?;
        let header = self.header(index);
        if header.used.get() == 0 {
            return Err(PlayError::InvalidParams(format!("block {} is not allocated", handle.0)));
        }
        let start = self.payload_start(index);
        let len = (header.len.get() as usize).min(self.capacity());
        Ok(&self.bytes[start..start + len])
    }

    fn checked_index(&self, handle: BlockHandle) -> PlayResult<usize> {
        let index = handle.0 as usize;
        if index >= self.block_count() {
            return Err(PlayError::InvalidParams(format!(
                "block {} out of range ({} blocks)",
                handle.0,
                self.block_count()
            )));
        }
        Ok(index)
    }

    fn payload_start(&self, index: usize) -> usize {
        index * self.block_size + BLOCK_HEADER_LEN
    }

    fn header(&self, index: usize) -> BlockHeader {
        let start = index * self.block_size;
        BlockHeader::read_from_prefix(&self.bytes[start..]).unwrap_or_else(BlockHeader::new_zeroed)
    }

    fn header_mut(&mut self, index: usize) -> PlayResult<&mut BlockHeader> {
        let start = index * self.block_size;
        BlockHeader::mut_from_prefix(&mut self.bytes[start..])
            .ok_or_else(|| PlayError::InvalidParams(format!("block {index} has no header")))
    }
}
