//! EROFS (Enhanced Read-Only File System) format support for chunk-based files.
//!
//! Only the parts of the on-disk format that chunk-based regular files touch are defined here:
//! block geometry, the data layout tag and the two chunk index encodings.

pub mod format;
