//! EROFS on-disk format definitions for chunk-based inodes.
//!
//! This module defines the binary layout of the chunk index records that follow a chunk-based
//! inode, along with the format flags that select between them.

// As in the rest of the EROFS definitions, structures are defined in terms of pure LE integer
// sizes and the conversion to enum values is handled separately.

use std::fmt;

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const BLOCK_BITS: u8 = 12;
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;

/// Rounds `n` up to the next multiple of `to`, which must be a power of two.
pub fn round_up(n: u64, to: u64) -> u64 {
    (n + to - 1) & !(to - 1)
}

/// Converts a byte offset into a block number.
pub fn blknr(offset: u64) -> u64 {
    offset >> BLOCK_BITS
}

/// Returns the offset of `offset` within its block.
pub fn blkoff(offset: u64) -> u64 {
    offset & (BLOCK_SIZE as u64 - 1)
}

#[derive(Debug)]
pub enum FormatError {
    InvalidDataLayout,
}

const INODE_DATALAYOUT_FLAT_PLAIN: u16 = 0;
const INODE_DATALAYOUT_FLAT_INLINE: u16 = 4;
const INODE_DATALAYOUT_CHUNK_BASED: u16 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DataLayout {
    FlatPlain = INODE_DATALAYOUT_FLAT_PLAIN,
    FlatInline = INODE_DATALAYOUT_FLAT_INLINE,
    ChunkBased = INODE_DATALAYOUT_CHUNK_BASED,
}

impl TryFrom<u16> for DataLayout {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, FormatError> {
        match value {
            INODE_DATALAYOUT_FLAT_PLAIN => Ok(DataLayout::FlatPlain),
            INODE_DATALAYOUT_FLAT_INLINE => Ok(DataLayout::FlatInline),
            INODE_DATALAYOUT_CHUNK_BASED => Ok(DataLayout::ChunkBased),
            _ => Err(FormatError::InvalidDataLayout),
        }
    }
}

/* Chunk format field */

pub const CHUNK_FORMAT_BLKBITS_MASK: u16 = 0x001f;
pub const CHUNK_FORMAT_INDEXES: u16 = 0x0020;

/// The `chunkformat` field stored in the inode's `u` union for chunk-based files.
///
/// The low five bits hold `chunk_bits - BLOCK_BITS`; [`CHUNK_FORMAT_INDEXES`] selects the
/// 8-byte [`ChunkIndex`] encoding instead of bare 4-byte block addresses.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFormat(pub u16);

impl ChunkFormat {
    pub fn new(chunk_bits: u8, indexes: bool) -> Self {
        debug_assert!(chunk_bits >= BLOCK_BITS);
        let mut value = u16::from(chunk_bits - BLOCK_BITS) & CHUNK_FORMAT_BLKBITS_MASK;
        if indexes {
            value |= CHUNK_FORMAT_INDEXES;
        }
        ChunkFormat(value)
    }

    pub fn has_indexes(self) -> bool {
        self.0 & CHUNK_FORMAT_INDEXES != 0
    }

    pub fn chunk_bits(self) -> u8 {
        BLOCK_BITS + (self.0 & CHUNK_FORMAT_BLKBITS_MASK) as u8
    }

    /// The on-disk width of one chunk index entry in this format.
    pub fn entry_size(self) -> usize {
        if self.has_indexes() {
            size_of::<ChunkIndex>()
        } else {
            BLOCK_MAP_ENTRY_SIZE
        }
    }
}

impl fmt::Debug for ChunkFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "0x{:04x} (chunkbits {}, {})",
            self.0,
            self.chunk_bits(),
            if self.has_indexes() {
                "indexes"
            } else {
                "block map"
            }
        )
    }
}

/* Chunk indexes */

pub const BLOCK_MAP_ENTRY_SIZE: usize = size_of::<U32>();

#[derive(
    Clone, Copy, Debug, Default, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq,
)]
#[repr(C)]
pub struct ChunkIndex {
    pub advise: U16,
    pub device_id: U16,
    pub blkaddr: U32,
}
