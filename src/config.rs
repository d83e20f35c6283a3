//! Chunking configuration.
//!
//! The configuration is supplied by the surrounding image builder (or the `mkchunked` command
//! line): the chunk size as a power of two, and the policy choosing between the two chunk index
//! encodings.

use crate::{
    erofs::format::{ChunkFormat, BLOCK_BITS, CHUNK_FORMAT_BLKBITS_MASK},
    error::{ChunkError, Result},
};

/// Which on-disk encoding to use for a file's chunk indexes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexPolicy {
    /// Use bare block addresses when a chunk is exactly one block, full indexes otherwise.
    #[default]
    Auto,
    /// Always use bare 4-byte block addresses.
    BlockMap,
    /// Always use 8-byte chunk index records.
    Indexes,
}

/// Configuration for splitting files into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    chunk_bits: u8,
    pub index_policy: IndexPolicy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_bits: BLOCK_BITS,
            index_policy: IndexPolicy::Auto,
        }
    }
}

impl ChunkConfig {
    /// Creates a configuration with chunks of `1 << chunk_bits` bytes.
    ///
    /// The chunk size must be at least one block, and no larger than the chunk format field can
    /// describe.
    pub fn new(chunk_bits: u8, index_policy: IndexPolicy) -> Result<Self> {
        let max_bits = u16::from(BLOCK_BITS) + CHUNK_FORMAT_BLKBITS_MASK;
        if chunk_bits < BLOCK_BITS || u16::from(chunk_bits) > max_bits {
            return Err(ChunkError::InvalidChunkSize(chunk_bits));
        }
        Ok(Self {
            chunk_bits,
            index_policy,
        })
    }

    pub fn chunk_bits(&self) -> u8 {
        self.chunk_bits
    }

    pub fn chunk_size(&self) -> u64 {
        1 << self.chunk_bits
    }

    /// Resolves the index policy into the per-file chunk format flags.
    pub fn chunk_format(&self) -> ChunkFormat {
        let indexes = match self.index_policy {
            IndexPolicy::Auto => self.chunk_bits != BLOCK_BITS,
            IndexPolicy::BlockMap => false,
            IndexPolicy::Indexes => true,
        };
        ChunkFormat::new(self.chunk_bits, indexes)
    }
}
