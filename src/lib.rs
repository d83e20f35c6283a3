//! Deduplicating chunk store for chunk-based EROFS files.
//!
//! Large files are split into fixed-size chunks.  Each distinct chunk is written once to a
//! temporary blob area, the blob area is later relocated into the image, and each file gets a
//! chunk index pointing at the final block addresses of its chunks.

pub mod blob;
pub mod chunker;
pub mod config;
pub mod device;
pub mod erofs;
pub mod error;
pub mod fingerprint;
pub mod relocate;
pub mod store;

pub use error::{ChunkError, Result};
