//! Error types for the chunk store.
//!
//! All fallible operations return a [`Result<T>`], an alias for `Result<T, ChunkError>`.
//! None of these errors are retried internally: storage-layer failures are treated as fatal to
//! the current image build and are propagated to the caller.

use std::{io, path::PathBuf};

use crate::relocate::RelocationState;

/// Result type alias for operations that may return a ChunkError.
pub type Result<T> = std::result::Result<T, ChunkError>;

/// Error types for chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The source ended before the requested chunk length could be read.
    #[error("short read: expected {expected} bytes of chunk data")]
    ShortRead {
        expected: u64,
        #[source]
        source: io::Error,
    },

    /// Reading chunk data from the source failed for a reason other than running out of data.
    #[error("failed to read chunk data")]
    ReadFailed(#[source] io::Error),

    /// The source file could not be opened.
    #[error("failed to open {path:?}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The temporary file backing the blob area could not be created.
    #[error("failed to create the temporary blob area")]
    BlobInit(#[source] io::Error),

    /// A write to the blob area or the image did not complete.
    #[error("write failed")]
    WriteFailed(#[source] io::Error),

    /// No room for the requested allocation in the target image.
    #[error("failed to allocate {len} bytes in the image")]
    AllocFailed {
        len: u64,
        #[source]
        source: io::Error,
    },

    /// Fewer bytes than the blob area length were copied into the image.
    #[error("incomplete blob copy: {copied} of {expected} bytes")]
    CopyIncomplete { copied: u64, expected: u64 },

    /// The configured chunk size cannot be expressed in the chunk format field.
    #[error("invalid chunk size: 2^{0} bytes")]
    InvalidChunkSize(u8),

    /// Chunk indexes were requested before the blob area was relocated.
    #[error("blob area has not been relocated yet")]
    NotRelocated,

    /// Relocation was requested outside of the unstarted state.
    #[error("blob area relocation already attempted (state {0:?})")]
    AlreadyRelocated(RelocationState),

    /// A relocated block address does not fit the 32-bit on-disk field.
    #[error("block address {0} overflows the on-disk field")]
    AddressOverflow(u64),
}
