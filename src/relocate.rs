//! Moving the blob area into the image.
//!
//! Chunks are addressed relative to the start of the temporary blob area while files are being
//! chunked.  Once every file has been processed the blob area is copied into the image in one
//! piece, and the block at which it lands becomes the base added to every chunk address.

use std::os::fd::AsFd;

use log::debug;

use crate::{
    blob::BlobArea,
    device::{AllocKind, Allocator, ImageDevice},
    erofs::format::BLOCK_SIZE,
    error::{ChunkError, Result},
};

/// Progress of the one-shot blob relocation.
///
/// Transitions are strictly sequential.  Once space has been allocated, a failure leaves the
/// relocator in the state it had reached and no further relocation is possible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RelocationState {
    #[default]
    Unstarted,
    Allocated,
    Copied,
    Done { base: u32 },
}

#[derive(Debug, Default)]
pub struct Relocator {
    state: RelocationState,
}

impl Relocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RelocationState {
        self.state
    }

    /// The block address of the relocated blob area, once relocation has completed.
    pub fn base(&self) -> Option<u32> {
        match self.state {
            RelocationState::Done { base } => Some(base),
            _ => None,
        }
    }

    /// Copies `blob` into space obtained from `allocator` on `device`.
    pub fn relocate(
        &mut self,
        blob: &BlobArea,
        allocator: &mut impl Allocator,
        device: &mut impl ImageDevice,
    ) -> Result<()> {
        if self.state != RelocationState::Unstarted {
            return Err(ChunkError::AlreadyRelocated(self.state));
        }

        let len = blob.len();
        let placement = allocator
            .allocate(AllocKind::Data, len, BLOCK_SIZE as u64)
            .map_err(|source| ChunkError::AllocFailed { len, source })?;
        self.state = RelocationState::Allocated;

        let base = placement.blkaddr();
        let base: u32 = base
            .try_into()
            .map_err(|_| ChunkError::AddressOverflow(base))?;
        debug!("Relocating {len} byte blob area to block {base}");

        if len > 0 {
            let copied = device
                .copy_range(blob.as_fd(), 0, placement.offset(), len)
                .map_err(ChunkError::WriteFailed)?;
            if copied < len {
                return Err(ChunkError::CopyIncomplete {
                    copied,
                    expected: len,
                });
            }
        }
        self.state = RelocationState::Copied;

        allocator.commit(placement);
        self.state = RelocationState::Done { base };
        Ok(())
    }
}
