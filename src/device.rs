//! Space allocation and I/O on the target image.
//!
//! The chunk store only needs two things from the image being built: somewhere to put the blob
//! area once its final size is known ([`Allocator`]), and a way to write bytes and copy file
//! ranges into the image ([`ImageDevice`]).  Simple implementations of both are provided for
//! building an image into a plain file.

use std::{
    fs::File,
    io,
    os::{
        fd::{AsFd, BorrowedFd},
        unix::fs::FileExt,
    },
};

use log::{trace, warn};
use rustix::{fs::copy_file_range, io::Errno};

use crate::erofs::format::{blknr, round_up, BLOCK_BITS, BLOCK_SIZE};

/// What an allocation is going to hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    /// File data: always starts on a block boundary.
    Data,
    /// Metadata such as chunk indexes: only aligned as requested.
    Meta,
}

/// A reserved range of the target image.
///
/// Placements are handed back to the allocator with [`Allocator::commit`] once their contents
/// are final.
#[derive(Debug, PartialEq, Eq)]
pub struct Placement {
    kind: AllocKind,
    offset: u64,
    len: u64,
}

impl Placement {
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Byte offset of the placement in the image.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Block address of the first block touched by the placement.
    pub fn blkaddr(&self) -> u64 {
        blknr(self.offset)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub trait Allocator {
    /// Reserves `len` bytes aligned to `alignment` (a power of two).
    fn allocate(&mut self, kind: AllocKind, len: u64, alignment: u64) -> io::Result<Placement>;

    /// Marks a placement as final.  Its space is live image data from now on.
    fn commit(&mut self, placement: Placement);
}

/// A bump allocator handing out image space in increasing order.
#[derive(Debug)]
pub struct BlockAllocator {
    tail: u64,
    limit_blocks: Option<u64>,
    outstanding: usize,
}

impl BlockAllocator {
    /// Creates an allocator whose first allocation starts at block `start_blk`.
    ///
    /// Fails if `start_blk` is not a 32-bit block address.
    pub fn new(start_blk: u64) -> io::Result<Self> {
        if start_blk > u64::from(u32::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("start block {start_blk} exceeds 32-bit block addresses"),
            ));
        }
        Ok(Self {
            tail: start_blk << BLOCK_BITS,
            limit_blocks: None,
            outstanding: 0,
        })
    }

    /// Limits the image to `blocks` blocks in total.
    pub fn with_limit(mut self, blocks: u64) -> Self {
        self.limit_blocks = Some(blocks);
        self
    }

    /// Byte offset just past the last allocation.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Total number of blocks the image spans so far.
    pub fn blocks(&self) -> u64 {
        blknr(round_up(self.tail, BLOCK_SIZE as u64))
    }

    /// Number of placements not yet committed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Allocator for BlockAllocator {
    fn allocate(&mut self, kind: AllocKind, len: u64, alignment: u64) -> io::Result<Placement> {
        if !alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("alignment {alignment} is not a power of two"),
            ));
        }

        let alignment = match kind {
            AllocKind::Data => alignment.max(BLOCK_SIZE as u64),
            AllocKind::Meta => alignment,
        };
        let offset = round_up(self.tail, alignment);
        let end = offset
            .checked_add(len)
            .ok_or_else(|| io::Error::other("allocation overflows the image"))?;

        let end_blocks = blknr(round_up(end, BLOCK_SIZE as u64));
        if end_blocks > u64::from(u32::MAX) {
            return Err(io::Error::other("image exceeds 32-bit block addresses"));
        }
        if let Some(limit) = self.limit_blocks {
            if end_blocks > limit {
                return Err(io::Error::other(format!(
                    "no space left in image: need {end_blocks} blocks, limit {limit}"
                )));
            }
        }

        trace!("allocate {kind:?} {len} bytes @{offset}");
        self.tail = end;
        self.outstanding += 1;
        Ok(Placement { kind, offset, len })
    }

    fn commit(&mut self, placement: Placement) {
        trace!(
            "commit {:?} {} bytes @{}",
            placement.kind,
            placement.len,
            placement.offset
        );
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

/// Byte-level access to the image being written.
pub trait ImageDevice {
    /// Writes all of `data` at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Copies up to `len` bytes from `src` at `src_offset` to the image at `dst_offset`.
    ///
    /// Returns the number of bytes copied, which is short only if `src` ends early.
    fn copy_range(
        &mut self,
        src: BorrowedFd<'_>,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> io::Result<u64>;
}

// Keep individual copy requests well below the kernel's per-call limit.
const COPY_CHUNK_MAX: u64 = 1 << 30;

/// An image written into a regular file.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
}

impl ImageFile {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn into_inner(self) -> File {
        self.file
    }

    fn copy_by_reading(
        &mut self,
        src: BorrowedFd<'_>,
        mut src_offset: u64,
        mut dst_offset: u64,
        len: u64,
    ) -> io::Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0;

        while copied < len {
            let want = (len - copied).min(buf.len() as u64) as usize;
            let n = match rustix::io::pread(src, &mut buf[..want], src_offset) {
                Ok(0) => break,
                Ok(n) => n,
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            };
            self.file.write_all_at(&buf[..n], dst_offset)?;
            src_offset += n as u64;
            dst_offset += n as u64;
            copied += n as u64;
        }

        Ok(copied)
    }
}

impl ImageDevice for ImageFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn copy_range(
        &mut self,
        src: BorrowedFd<'_>,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> io::Result<u64> {
        let mut off_in = src_offset;
        let mut off_out = dst_offset;
        let mut copied = 0;

        while copied < len {
            let want = (len - copied).min(COPY_CHUNK_MAX) as usize;
            match copy_file_range(
                src,
                Some(&mut off_in),
                self.file.as_fd(),
                Some(&mut off_out),
                want,
            ) {
                Ok(0) => break,
                Ok(n) => copied += n as u64,
                Err(Errno::INTR) => continue,
                Err(err)
                    if [Errno::XDEV, Errno::NOSYS, Errno::OPNOTSUPP, Errno::INVAL]
                        .contains(&err) =>
                {
                    warn!("copy_file_range failed ({err}), falling back to read/write");
                    let rest = self.copy_by_reading(src, off_in, off_out, len - copied)?;
                    return Ok(copied + rest);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(copied)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_block_allocator() {
        let mut alloc = BlockAllocator::new(2).unwrap();

        let meta = alloc.allocate(AllocKind::Meta, 10, 4).unwrap();
        assert_eq!(meta.offset(), 8192);

        let data = alloc.allocate(AllocKind::Data, 5000, 1).unwrap();
        assert_eq!(data.offset(), 3 * 4096);
        assert_eq!(data.blkaddr(), 3);
        assert_eq!(alloc.blocks(), 5);

        let meta = alloc.allocate(AllocKind::Meta, 16, 8).unwrap();
        assert_eq!(meta.offset(), 3 * 4096 + 5000);
        assert_eq!(alloc.outstanding(), 3);

        alloc.commit(meta);
        alloc.commit(data);
        assert_eq!(alloc.outstanding(), 1);

        assert!(alloc.allocate(AllocKind::Meta, 1, 3).is_err());
    }

    #[test]
    fn test_block_allocator_start() {
        let last = u64::from(u32::MAX);
        let alloc = BlockAllocator::new(last).unwrap();
        assert_eq!(alloc.tail(), last * 4096);

        let err = BlockAllocator::new(last + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        // large enough to wrap when converted to a byte offset
        assert!(BlockAllocator::new(1 << 52).is_err());
    }

    #[test]
    fn test_block_allocator_limit() {
        let mut alloc = BlockAllocator::new(1).unwrap().with_limit(4);
        assert!(alloc.allocate(AllocKind::Data, 3 * 4096, 1).is_ok());
        assert!(alloc.allocate(AllocKind::Data, 1, 1).is_err());
        assert_eq!(alloc.blocks(), 4);
    }

    #[test]
    fn test_copy_range() {
        let mut src = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        src.write_all(&data).unwrap();

        let mut image = ImageFile::new(tempfile::tempfile().unwrap());
        image.write_at(0, b"header").unwrap();
        assert_eq!(image.copy_range(src.as_fd(), 100, 4096, 5000).unwrap(), 5000);

        let mut out = vec![0u8; 5000];
        image.file().read_exact_at(&mut out, 4096).unwrap();
        assert_eq!(&out[..], &data[100..5100]);

        // a source that ends early gives a short count
        assert_eq!(image.copy_range(src.as_fd(), 9000, 0, 4096).unwrap(), 1000);
    }

    #[test]
    fn test_copy_by_reading() {
        let mut src = tempfile::tempfile().unwrap();
        src.write_all(&[5u8; 3000]).unwrap();

        let mut image = ImageFile::new(tempfile::tempfile().unwrap());
        assert_eq!(image.copy_by_reading(src.as_fd(), 0, 10, 4000).unwrap(), 3000);
        let mut out = vec![0u8; 3000];
        image.file().read_exact_at(&mut out, 10).unwrap();
        assert_eq!(out, vec![5u8; 3000]);
    }
}
