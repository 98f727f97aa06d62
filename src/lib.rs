mod core;
mod format;
mod read;
mod write;

pub mod error;

pub use crate::core::{
    Bin, BinTable, Chromosome, Count, GenomicRange, MatrixType, Normalization, Pixel, Reference,
    ThinPixel, Unit,
};
pub use error::{Error, Result};
pub use read::{
    BlockCache, CacheStats, ContactFile, PixelIter, PixelMerger, PixelSelector, ThinPixelIter,
};
pub use write::{ContactWriter, ContactWriterBuilder};

pub const FILE_MAGIC: &[u8; 7] = b"HCTFILE";

pub const FILE_VERSION: u8 = 2;
pub const MIN_FILE_VERSION: u8 = 1;

/// Bins along one axis of a block tile.
pub const DEFAULT_BLOCK_BIN_COUNT: u32 = 256;
/// Decoded-byte budget of a freshly opened file's block cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
/// In-memory pixel bytes a writer accumulates before spilling to scratch.
pub const DEFAULT_SPILL_THRESHOLD: usize = 128 * 1024 * 1024;
