//! Setting up a writer when no temporary blob file can be created.
//!
//! This lives in its own test binary because it points `TMPDIR` at a missing directory.

use std::env;

use erofs_chunkstore::{config::ChunkConfig, error::ChunkError, store::BlobChunkWriter};

#[test]
fn test_blob_init_failure() {
    let dir = tempfile::tempdir().unwrap();
    env::set_var("TMPDIR", dir.path().join("missing"));

    let err = BlobChunkWriter::new(ChunkConfig::default()).unwrap_err();
    assert!(matches!(err, ChunkError::BlobInit(..)), "{err:?}");
}
