//! The chunk store state for one image build.
//!
//! [`BlobChunkWriter`] owns everything that lives for the duration of a build: the configuration,
//! the fingerprint index, the temporary blob area and the relocation state.  The intended order
//! of operations is:
//!
//! 1. [`BlobChunkWriter::chunk_file`] for every file that should be chunk-based
//! 2. [`BlobChunkWriter::relocate`] once
//! 3. [`BlobChunkWriter::write_chunk_indexes`] for every chunked file
//!
//! Dropping the writer releases the index and closes the temporary blob file.

use std::path::Path;

use log::debug;

use crate::{
    blob::{ChunkStore, DedupStats},
    chunker::{chunk_file, ChunkedFile},
    config::ChunkConfig,
    device::{Allocator, ImageDevice},
    error::{ChunkError, Result},
    relocate::{RelocationState, Relocator},
};

#[derive(Debug)]
pub struct BlobChunkWriter {
    config: ChunkConfig,
    store: ChunkStore,
    relocator: Relocator,
}

impl BlobChunkWriter {
    /// Sets up an empty fingerprint index over a fresh temporary blob file.
    pub fn new(config: ChunkConfig) -> Result<Self> {
        let store = ChunkStore::new().map_err(ChunkError::BlobInit)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ChunkConfig, store: ChunkStore) -> Self {
        Self {
            config,
            store,
            relocator: Relocator::new(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn stats(&self) -> DedupStats {
        self.store.stats()
    }

    /// Chunks the first `size` bytes of the file at `path` using the writer's configuration.
    pub fn chunk_file(&mut self, path: impl AsRef<Path>, size: u64) -> Result<ChunkedFile> {
        let config = self.config;
        self.chunk_file_with(path, size, &config)
    }

    /// Chunks a file with a per-file configuration, e.g. to force an index encoding.
    pub fn chunk_file_with(
        &mut self,
        path: impl AsRef<Path>,
        size: u64,
        config: &ChunkConfig,
    ) -> Result<ChunkedFile> {
        chunk_file(&mut self.store, path.as_ref(), size, config)
    }

    /// Moves the blob area into the image.  May only succeed once.
    pub fn relocate(
        &mut self,
        allocator: &mut impl Allocator,
        device: &mut impl ImageDevice,
    ) -> Result<u32> {
        self.relocator
            .relocate(self.store.blob(), allocator, device)?;
        let base = self.relocator.base().ok_or(ChunkError::NotRelocated)?;

        let stats = self.store.stats();
        debug!(
            "Blob area relocated to block {base}: {} chunks stored, {} duplicates, {} bytes saved",
            stats.stored, stats.duplicates, stats.saved_bytes
        );
        Ok(base)
    }

    pub fn relocation_state(&self) -> RelocationState {
        self.relocator.state()
    }

    /// The final block address of the blob area, once relocated.
    pub fn remapped_base(&self) -> Option<u32> {
        self.relocator.base()
    }

    /// Encodes `file`'s chunk index against the final blob location.
    pub fn encode_indexes(&self, file: &ChunkedFile) -> Result<Vec<u8>> {
        let base = self.remapped_base().ok_or(ChunkError::NotRelocated)?;
        file.encode_indexes(base)
    }

    /// Writes `file`'s chunk index to `device` at `offset`, rounded up to the entry size.
    ///
    /// Fails with [`ChunkError::NotRelocated`] if the blob area has not been relocated yet.
    pub fn write_chunk_indexes(
        &self,
        file: &ChunkedFile,
        device: &mut impl ImageDevice,
        offset: u64,
    ) -> Result<u64> {
        let base = self.remapped_base().ok_or(ChunkError::NotRelocated)?;
        file.write_chunk_indexes(device, offset, base)
    }
}
