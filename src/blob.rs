//! The append-only blob area and the deduplicating chunk store on top of it.
//!
//! New chunk content is appended to a temporary file and padded with zeros up to the next block
//! boundary, so every chunk starts on a block and can be addressed by block number.  Content
//! that was already seen is never written twice: the [`FingerprintIndex`] hands back the
//! existing record instead.

use std::{
    fs::File,
    io::{self, Read},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::fs::FileExt,
    },
    rc::Rc,
};

use log::{debug, trace};

use crate::{
    erofs::format::{blkoff, blknr, round_up, BLOCK_SIZE},
    error::{ChunkError, Result},
    fingerprint::{Fingerprint, FingerprintIndex, StoredChunk},
};

/// A block-aligned, append-only byte area backed by a file.
///
/// The logical length only advances once an append (including its padding) has been written in
/// full, so a failed append leaves the area exactly as it was before.
#[derive(Debug)]
pub struct BlobArea {
    file: File,
    len: u64,
}

impl BlobArea {
    /// Creates a blob area backed by an anonymous temporary file.
    pub fn new() -> io::Result<Self> {
        Ok(Self::from_file(tempfile::tempfile()?))
    }

    /// Creates a blob area writing into `file` from offset zero.
    pub fn from_file(file: File) -> Self {
        Self { file, len: 0 }
    }

    /// The current length in bytes.  This is always a multiple of the block size.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data` followed by zero-padding to the next block boundary.
    ///
    /// Returns the byte offset at which `data` starts.
    pub fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let start = self.len;
        debug_assert_eq!(blkoff(start), 0);

        self.file.write_all_at(data, start)?;
        let end = start + data.len() as u64;
        let padded = round_up(end, BLOCK_SIZE as u64);
        if padded != end {
            let zeroed = [0u8; BLOCK_SIZE];
            self.file
                .write_all_at(&zeroed[..(padded - end) as usize], end)?;
        }

        self.len = padded;
        Ok(start)
    }
}

impl AsFd for BlobArea {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Running totals for deduplication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Chunks written to the blob area.
    pub stored: u64,
    /// Chunks satisfied by content that was already stored.
    pub duplicates: u64,
    /// Bytes of chunk data not written thanks to deduplication.
    pub saved_bytes: u64,
}

/// Deduplicating chunk store: a fingerprint index plus the blob area it describes.
#[derive(Debug)]
pub struct ChunkStore {
    index: FingerprintIndex,
    blob: BlobArea,
    stats: DedupStats,
}

impl ChunkStore {
    /// Creates a chunk store with an empty index over a fresh temporary blob area.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_blob(BlobArea::new()?))
    }

    pub fn with_blob(blob: BlobArea) -> Self {
        Self {
            index: FingerprintIndex::new(),
            blob,
            stats: DedupStats::default(),
        }
    }

    /// Reads exactly `len` bytes from `source` and returns the record holding that content.
    ///
    /// Content seen before is returned from the index without touching the blob area.  New
    /// content is registered and then appended; if the append fails the registration is undone
    /// so a later attempt with the same content writes it again.
    pub fn store_chunk(&mut self, source: &mut impl Read, len: u64) -> Result<Rc<StoredChunk>> {
        let mut data = vec![0u8; len as usize];
        source.read_exact(&mut data).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => ChunkError::ShortRead {
                expected: len,
                source: err,
            },
            _ => ChunkError::ReadFailed(err),
        })?;

        let fingerprint = Fingerprint::of(&data);
        if let Some(chunk) = self.index.lookup(&fingerprint) {
            debug_assert_eq!(chunk.size, len);
            trace!("Reusing chunk {fingerprint:?} ({len} bytes) at {}", chunk.blkaddr);
            self.stats.duplicates += 1;
            self.stats.saved_bytes += len;
            return Ok(chunk);
        }

        let blkpos = self.blob.len();
        let blkaddr = blknr(blkpos);
        let chunk = Rc::new(StoredChunk {
            fingerprint,
            size: len,
            blkaddr: blkaddr
                .try_into()
                .map_err(|_| ChunkError::AddressOverflow(blkaddr))?,
        });
        let inserted = self.index.insert(Rc::clone(&chunk));
        debug_assert!(inserted, "{fingerprint:?} was not found but is already indexed");

        debug!("Writing chunk ({len} bytes) to {}", chunk.blkaddr);
        if let Err(err) = self.blob.append(&data) {
            self.index.remove(&fingerprint);
            return Err(ChunkError::WriteFailed(err));
        }

        self.stats.stored += 1;
        Ok(chunk)
    }

    pub fn index(&self) -> &FingerprintIndex {
        &self.index
    }

    pub fn blob(&self) -> &BlobArea {
        &self.blob
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }
}
