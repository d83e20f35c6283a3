//! Splitting files into chunks and emitting their chunk indexes.
//!
//! A chunk-based file is cut into pieces of `1 << chunk_bits` bytes (the last one possibly
//! shorter), each of which is handed to the [`ChunkStore`].  The resulting [`ChunkedFile`] keeps
//! references to the stored chunks rather than final addresses: those are only known once the
//! blob area has been relocated into the image, so translation happens when the indexes are
//! encoded.

use std::{fs::File, io::Read, path::Path, rc::Rc};

use log::{debug, trace};
use zerocopy::{little_endian::U32, FromBytes, IntoBytes};

use crate::{
    blob::ChunkStore,
    config::ChunkConfig,
    device::ImageDevice,
    erofs::format::{round_up, ChunkFormat, ChunkIndex, DataLayout},
    error::{ChunkError, Result},
    fingerprint::StoredChunk,
};

/// One on-disk chunk index entry, in either of the two encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkIndexEntry {
    /// A bare little-endian block address.
    BlockMap(u32),
    /// A full chunk index record.
    Indexed(ChunkIndex),
}

impl ChunkIndexEntry {
    /// Creates the entry for `blkaddr` in the encoding selected by `format`.
    pub fn new(format: ChunkFormat, blkaddr: u32) -> Self {
        if format.has_indexes() {
            Self::Indexed(ChunkIndex {
                blkaddr: blkaddr.into(),
                ..Default::default()
            })
        } else {
            Self::BlockMap(blkaddr)
        }
    }

    pub fn blkaddr(&self) -> u32 {
        match self {
            Self::BlockMap(blkaddr) => *blkaddr,
            Self::Indexed(index) => index.blkaddr.get(),
        }
    }

    pub fn encode(&self, output: &mut Vec<u8>) {
        match self {
            Self::BlockMap(blkaddr) => output.extend_from_slice(U32::new(*blkaddr).as_bytes()),
            Self::Indexed(index) => output.extend_from_slice(index.as_bytes()),
        }
    }

    /// Decodes one entry from exactly `format.entry_size()` bytes.
    pub fn decode(format: ChunkFormat, data: &[u8]) -> Option<Self> {
        if format.has_indexes() {
            ChunkIndex::read_from_bytes(data).ok().map(Self::Indexed)
        } else {
            U32::read_from_bytes(data)
                .ok()
                .map(|blkaddr| Self::BlockMap(blkaddr.get()))
        }
    }
}

/// Decodes a chunk index buffer written in `format`.
///
/// Returns `None` if the buffer is not a whole number of entries.
pub fn decode_indexes(format: ChunkFormat, data: &[u8]) -> Option<Vec<ChunkIndexEntry>> {
    let unit = format.entry_size();
    if data.len() % unit != 0 {
        return None;
    }
    data.chunks_exact(unit)
        .map(|entry| ChunkIndexEntry::decode(format, entry))
        .collect()
}

/// A file that has been split into stored chunks.
#[derive(Debug)]
pub struct ChunkedFile {
    format: ChunkFormat,
    size: u64,
    chunks: Vec<Rc<StoredChunk>>,
}

impl ChunkedFile {
    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data_layout(&self) -> DataLayout {
        DataLayout::ChunkBased
    }

    /// The stored chunks in file order.
    pub fn chunks(&self) -> &[Rc<StoredChunk>] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Size in bytes of the encoded chunk index.
    pub fn extent_isize(&self) -> u64 {
        (self.chunks.len() * self.format.entry_size()) as u64
    }

    /// Encodes the chunk index with every blob-relative address shifted by `base`.
    pub fn encode_indexes(&self, base: u32) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(self.extent_isize() as usize);
        for chunk in &self.chunks {
            let blkaddr = u64::from(chunk.blkaddr) + u64::from(base);
            let blkaddr = blkaddr
                .try_into()
                .map_err(|_| ChunkError::AddressOverflow(blkaddr))?;
            trace!("  chunk {:?} -> {blkaddr}", chunk.fingerprint);
            ChunkIndexEntry::new(self.format, blkaddr).encode(&mut output);
        }
        Ok(output)
    }

    /// Writes the chunk index to `device` at `offset`, rounded up to the entry size.
    ///
    /// Returns the offset actually written to.
    pub fn write_chunk_indexes(
        &self,
        device: &mut impl ImageDevice,
        offset: u64,
        base: u32,
    ) -> Result<u64> {
        let data = self.encode_indexes(base)?;
        let offset = round_up(offset, self.format.entry_size() as u64);
        trace!("write {} chunk indexes @{offset}", self.chunks.len());
        device
            .write_at(offset, &data)
            .map_err(ChunkError::WriteFailed)?;
        Ok(offset)
    }
}

/// Splits `size` bytes read from `source` into chunks and stores each of them.
///
/// On failure nothing is returned: no partially chunked file ever escapes.
pub fn chunk_reader(
    store: &mut ChunkStore,
    source: &mut impl Read,
    size: u64,
    config: &ChunkConfig,
) -> Result<ChunkedFile> {
    let chunk_size = config.chunk_size();
    let count = size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);

    let mut pos = 0;
    while pos < size {
        let len = (size - pos).min(chunk_size);
        chunks.push(store.store_chunk(source, len)?);
        pos += len;
    }

    Ok(ChunkedFile {
        format: config.chunk_format(),
        size,
        chunks,
    })
}

/// Opens the file at `path` and chunks its first `size` bytes.
pub fn chunk_file(
    store: &mut ChunkStore,
    path: &Path,
    size: u64,
    config: &ChunkConfig,
) -> Result<ChunkedFile> {
    let mut file = File::open(path).map_err(|source| ChunkError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let chunked = chunk_reader(store, &mut file, size, config)?;
    debug!(
        "Chunked {path:?}: {size} bytes in {} chunks, format {:?}",
        chunked.chunk_count(),
        chunked.format
    );
    Ok(chunked)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{config::IndexPolicy, erofs::format::BLOCK_BITS};

    fn pattern(size: usize, seed: u8) -> Vec<u8> {
        (0..size)
            .map(|i| (i / 4096) as u8 ^ seed.wrapping_mul(31) ^ (i as u8))
            .collect()
    }

    #[test]
    fn test_chunk_sizes() {
        let mut store = ChunkStore::new().unwrap();
        let data = pattern(10000, 1);
        let chunked =
            chunk_reader(&mut store, &mut &data[..], 10000, &ChunkConfig::default()).unwrap();

        let sizes: Vec<u64> = chunked.chunks().iter().map(|c| c.size).collect();
        assert_eq!(sizes, [4096, 4096, 1808]);
        assert_eq!(chunked.extent_isize(), 12);
        assert_eq!(chunked.data_layout(), DataLayout::ChunkBased);
        assert!(!chunked.format().has_indexes());
    }

    #[test]
    fn test_empty_file() {
        let mut store = ChunkStore::new().unwrap();
        let chunked = chunk_reader(&mut store, &mut &b""[..], 0, &ChunkConfig::default()).unwrap();
        assert_eq!(chunked.chunk_count(), 0);
        assert_eq!(chunked.encode_indexes(100).unwrap(), b"");
        assert!(store.blob().is_empty());
    }

    #[test]
    fn test_short_source() {
        let mut store = ChunkStore::new().unwrap();
        let data = pattern(5000, 2);
        let err =
            chunk_reader(&mut store, &mut &data[..], 9000, &ChunkConfig::default()).unwrap_err();
        assert!(matches!(err, ChunkError::ShortRead { expected: 4096, .. }));
    }

    #[test]
    fn test_open_failed() {
        let mut store = ChunkStore::new().unwrap();
        let err = chunk_file(
            &mut store,
            Path::new("/nonexistent/chunked/file"),
            1,
            &ChunkConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::OpenFailed { .. }));
    }

    #[test]
    fn test_encode_block_map() {
        let mut store = ChunkStore::new().unwrap();
        let data = pattern(3 * 4096, 3);
        let chunked =
            chunk_reader(&mut store, &mut &data[..], 3 * 4096, &ChunkConfig::default()).unwrap();

        let encoded = chunked.encode_indexes(10).unwrap();
        assert_eq!(encoded, [10, 0, 0, 0, 11, 0, 0, 0, 12, 0, 0, 0]);

        let decoded = decode_indexes(chunked.format(), &encoded).unwrap();
        for (entry, chunk) in decoded.iter().zip(chunked.chunks()) {
            assert_eq!(entry.blkaddr(), chunk.blkaddr + 10);
        }
    }

    #[test]
    fn test_encode_indexes() {
        let config = ChunkConfig::new(BLOCK_BITS + 1, IndexPolicy::Auto).unwrap();
        let mut store = ChunkStore::new().unwrap();
        let data = pattern(3 * 8192, 4);
        let chunked = chunk_reader(&mut store, &mut &data[..], 3 * 8192, &config).unwrap();
        assert!(chunked.format().has_indexes());
        assert_eq!(chunked.extent_isize(), 24);

        let encoded = chunked.encode_indexes(0x100).unwrap();
        assert_eq!(&encoded[..8], [0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(&encoded[8..16], [0, 0, 0, 0, 2, 1, 0, 0]);

        let decoded = decode_indexes(chunked.format(), &encoded).unwrap();
        assert_eq!(
            decoded[2],
            ChunkIndexEntry::Indexed(ChunkIndex {
                blkaddr: 0x104.into(),
                ..Default::default()
            })
        );
        assert_eq!(decode_indexes(chunked.format(), &encoded[..7]), None);
    }

    #[test]
    fn test_address_overflow() {
        let mut store = ChunkStore::new().unwrap();
        let data = pattern(2 * 4096, 5);
        let chunked =
            chunk_reader(&mut store, &mut &data[..], 2 * 4096, &ChunkConfig::default()).unwrap();
        assert!(matches!(
            chunked.encode_indexes(u32::MAX),
            Err(ChunkError::AddressOverflow(..))
        ));
    }
}
