//! mkchunked - Write files into an image as deduplicated, chunk-based data.
//!
//! Every FILE is split into chunks, identical chunks are stored once, the resulting blob area is
//! placed into IMAGE and each file's chunk index is written after it.

use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;

use erofs_chunkstore::{
    config::{ChunkConfig, IndexPolicy},
    device::{AllocKind, Allocator, BlockAllocator, ImageFile},
    erofs::format::{BLOCK_BITS, BLOCK_SIZE},
    store::BlobChunkWriter,
};

/// Write files into an image as deduplicated chunks.
#[derive(Parser, Debug)]
#[command(name = "mkchunked", version, about)]
struct Args {
    /// Chunk size as a power of two (at least the block size).
    #[arg(long, default_value_t = BLOCK_BITS)]
    chunk_bits: u8,

    /// Always use 8-byte chunk index records.
    #[arg(long, group = "policy")]
    indexes: bool,

    /// Always use 4-byte block map entries.
    #[arg(long, group = "policy")]
    block_map: bool,

    /// First block available for data (earlier blocks are left for metadata).
    #[arg(long, default_value_t = 1)]
    start_block: u64,

    /// Maximum size of the image in blocks.
    #[arg(long)]
    max_blocks: Option<u64>,

    /// The output image.
    image: PathBuf,

    /// The files to chunk.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let policy = if args.indexes {
        IndexPolicy::Indexes
    } else if args.block_map {
        IndexPolicy::BlockMap
    } else {
        IndexPolicy::Auto
    };
    let config = ChunkConfig::new(args.chunk_bits, policy)?;
    let mut writer = BlobChunkWriter::new(config)?;

    let mut chunked = vec![];
    for path in &args.files {
        let size = fs::metadata(path)
            .with_context(|| format!("Failed to stat {path:?}"))?
            .len();
        let file = writer
            .chunk_file(path, size)
            .with_context(|| format!("Failed to chunk {path:?}"))?;
        chunked.push((path, file));
    }

    let image_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.image)
        .with_context(|| format!("Failed to create image {:?}", args.image))?;
    let mut image = ImageFile::new(image_file);

    let mut alloc = BlockAllocator::new(args.start_block)
        .with_context(|| format!("Invalid start block {}", args.start_block))?;
    if let Some(limit) = args.max_blocks {
        alloc = alloc.with_limit(limit);
    }

    let base = writer
        .relocate(&mut alloc, &mut image)
        .context("Failed to place blob area")?;

    for (path, file) in &chunked {
        let entry_size = file.format().entry_size() as u64;
        let placement = alloc
            .allocate(AllocKind::Meta, file.extent_isize(), entry_size)
            .with_context(|| format!("Failed to allocate chunk indexes for {path:?}"))?;
        let offset = writer.write_chunk_indexes(file, &mut image, placement.offset())?;
        alloc.commit(placement);

        println!(
            "{}: {} bytes, {} chunks, {:?}, indexes @{offset}",
            path.display(),
            file.size(),
            file.chunk_count(),
            file.format(),
        );
    }

    image
        .file()
        .set_len(alloc.blocks() * BLOCK_SIZE as u64)
        .context("Failed to size image")?;

    let stats = writer.stats();
    println!(
        "blob area at block {base}: {} chunks stored, {} duplicates, {} bytes saved",
        stats.stored, stats.duplicates, stats.saved_bytes
    );

    Ok(())
}
