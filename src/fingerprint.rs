//! Content fingerprints and the fingerprint index used for chunk deduplication.
//!
//! Every chunk is identified by the SHA-256 digest of its raw content.  The index maps each
//! fingerprint to the single [`StoredChunk`] record describing where that content lives in the
//! blob area.  Buckets are selected by a fast xxh32 hash over the fingerprint bytes; the full
//! fingerprint is the equality key within a bucket.

use std::{collections::HashMap, fmt, rc::Rc};

use hex::FromHexError;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh32::xxh32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// A SHA-256 digest of a chunk's content.
#[derive(
    Clone, Copy, Eq, FromBytes, Hash, Immutable, IntoBytes, KnownLayout, PartialEq, Unaligned,
)]
#[repr(C)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const EMPTY: Self = Self([0; 32]);

    /// Computes the fingerprint of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parse a fingerprint from a hexadecimal string.
    ///
    /// The string must contain exactly 64 characters and consist entirely of [0-9a-f], case
    /// insensitive.
    pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, FromHexError> {
        let mut value = Self::EMPTY;
        hex::decode_to_slice(hex.as_ref(), value.as_mut_bytes())?;
        Ok(value)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The fast hash used to pick the index bucket.
    fn bucket(&self) -> u32 {
        xxh32(&self.0, 0)
    }
}

impl From<[u8; 32]> for Fingerprint {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One distinct piece of content written to the blob area.
///
/// Records are immutable once created.  `blkaddr` is relative to the start of the temporary
/// blob area; the relocation base is only applied when chunk indexes are emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredChunk {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub blkaddr: u32,
}

/// Maps fingerprints to the chunk records holding that content.
///
/// Membership means exactly "this content has been written to the blob area at `blkaddr`".
#[derive(Debug, Default)]
pub struct FingerprintIndex {
    buckets: HashMap<u32, Vec<Rc<StoredChunk>>>,
    len: usize,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Rc<StoredChunk>> {
        self.buckets
            .get(&fingerprint.bucket())?
            .iter()
            .find(|chunk| chunk.fingerprint == *fingerprint)
            .cloned()
    }

    /// Registers a new chunk record.
    ///
    /// Returns `false` and leaves the index unchanged if the fingerprint is already present.
    pub fn insert(&mut self, chunk: Rc<StoredChunk>) -> bool {
        let bucket = self.buckets.entry(chunk.fingerprint.bucket()).or_default();
        if bucket.iter().any(|c| c.fingerprint == chunk.fingerprint) {
            return false;
        }
        bucket.push(chunk);
        self.len += 1;
        true
    }

    /// Removes the record for `fingerprint`, using the same (bucket, fingerprint) key as
    /// [`Self::insert`].
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Rc<StoredChunk>> {
        let hash = fingerprint.bucket();
        let bucket = self.buckets.get_mut(&hash)?;
        let pos = bucket.iter().position(|c| c.fingerprint == *fingerprint)?;
        let chunk = bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.len -= 1;
        Some(chunk)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over all stored chunks in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<StoredChunk>> {
        self.buckets.values().flatten()
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn chunk(data: &[u8], blkaddr: u32) -> Rc<StoredChunk> {
        Rc::new(StoredChunk {
            fingerprint: Fingerprint::of(data),
            size: data.len() as u64,
            blkaddr,
        })
    }

    #[test]
    fn test_fingerprint_hex() {
        // sha256 of the empty string
        let empty = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(Fingerprint::of(b"").to_hex(), empty);
        assert_eq!(Fingerprint::from_hex(empty), Ok(Fingerprint::of(b"")));
        assert_eq!(format!("{:?}", Fingerprint::EMPTY), format!("sha256:{}", "0".repeat(64)));

        assert_eq!(Fingerprint::from_hex("lol"), Err(FromHexError::OddLength));
        assert_eq!(
            Fingerprint::from_hex("lolo"),
            Err(FromHexError::InvalidStringLength)
        );
    }

    #[test]
    fn test_lookup_insert_remove() {
        let mut index = FingerprintIndex::new();
        assert!(index.is_empty());

        let a = chunk(b"alpha", 0);
        let b = chunk(b"beta", 1);
        assert!(index.insert(a.clone()));
        assert!(index.insert(b.clone()));
        assert_eq!(index.len(), 2);

        assert_eq!(index.lookup(&a.fingerprint), Some(a.clone()));
        assert_eq!(index.lookup(&b.fingerprint), Some(b.clone()));
        assert_eq!(index.lookup(&Fingerprint::of(b"gamma")), None);

        assert_eq!(index.remove(&a.fingerprint), Some(a.clone()));
        assert_eq!(index.lookup(&a.fingerprint), None);
        assert_eq!(index.remove(&a.fingerprint), None);
        assert_eq!(index.len(), 1);
        assert_eq!(index.iter().count(), 1);
    }

    #[test]
    fn test_duplicate_insert() {
        let mut index = FingerprintIndex::new();
        let first = chunk(b"same", 0);
        assert!(index.insert(first.clone()));
        assert!(!index.insert(chunk(b"same", 7)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&first.fingerprint), Some(first));
    }
}
