use std::error::Error as StdError;

/// Custom Result type for hictile operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the hictile library, encompassing all possible error
/// cases that can occur while reading or writing contact-matrix containers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Errors related to the file header and genome preamble
    #[error("Error processing header: {0}")]
    HeaderError(#[from] HeaderError),

    /// Errors related to the master index and per-pair footers
    #[error("Error processing footer: {0}")]
    FooterError(#[from] FooterError),

    /// Errors related to compressed block frames
    #[error("Error processing block: {0}")]
    BlockError(#[from] BlockError),

    /// Errors related to the block cache
    #[error("Error in block cache: {0}")]
    CacheError(#[from] CacheError),

    /// Errors raised while evaluating a range query
    #[error("Error evaluating query: {0}")]
    QueryError(#[from] QueryError),

    /// Errors that occur during write operations
    #[error("Error writing file: {0}")]
    WriteError(#[from] WriteError),

    /// Standard I/O errors
    #[error("Error with IO: {0}")]
    IoError(#[from] std::io::Error),

    /// UTF-8 conversion errors
    #[error("Error with UTF8: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),

    /// Generic errors for other unexpected situations
    #[error("Generic error: {0}")]
    GenericError(#[from] Box<dyn StdError + Send + Sync>),
}
impl Error {
    /// Checks if the error is the recoverable "requested normalization vector
    /// is absent" condition.
    ///
    /// Callers that can fall back to raw counts use this to distinguish a
    /// missing vector from genuine footer corruption.
    #[must_use]
    pub fn is_missing_normalization(&self) -> bool {
        matches!(
            self,
            Self::FooterError(FooterError::NormVectorNotFound { .. })
        )
    }
}

/// Errors specific to the fixed file header and the genome preamble
#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    /// The magic bytes at the start of the file do not match
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagicBytes([u8; 7]),

    /// The format version is outside the supported range
    #[error("Unsupported format version {found} - supported range is [{min}, {max}]")]
    UnsupportedVersion { found: u8, min: u8, max: u8 },

    /// The file ended before the fixed header or preamble was complete
    #[error("File truncated inside header at byte position {0}")]
    Truncated(u64),

    /// A chromosome entry in the catalogue is malformed
    #[error("Invalid chromosome catalogue entry: {0}")]
    InvalidChromosome(String),

    /// The resolution list is empty or unsorted
    #[error("Invalid resolution list: {0}")]
    InvalidResolutions(String),
}

/// Errors specific to the master index and per-pair footer sections
#[derive(thiserror::Error, Debug)]
pub enum FooterError {
    /// The master index offset points outside the file
    #[error("Master index offset {offset} is beyond file length {file_len}")]
    MasterIndexOutOfBounds { offset: u64, file_len: u64 },

    /// A footer section could not be parsed
    #[error("Malformed footer for pair ({chrom1}, {chrom2}) at offset {offset}")]
    MalformedFooter {
        chrom1: String,
        chrom2: String,
        offset: u64,
    },

    /// The requested resolution does not exist in a pair footer
    #[error("Resolution {bin_size} ({unit}) not present for pair ({chrom1}, {chrom2})")]
    ResolutionNotFound {
        chrom1: String,
        chrom2: String,
        unit: String,
        bin_size: u32,
    },

    /// The specific normalization vector a query asked for is absent.
    ///
    /// This is fatal for the query that requested it, but recoverable for the
    /// caller (see [`Error::is_missing_normalization`]).
    #[error("Normalization vector {method} not found for {chrom} at {bin_size} ({unit})")]
    NormVectorNotFound {
        method: String,
        chrom: String,
        unit: String,
        bin_size: u32,
    },

    /// No expected-value vector exists for the requested resolution
    #[error("Expected-value vector not found for resolution {bin_size} ({unit})")]
    ExpectedValuesNotFound { unit: String, bin_size: u32 },
}

/// Errors that occur while decompressing or decoding a block frame
#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    /// The codec reported corrupt input (not an output-space condition)
    #[error("Failed to decompress block at offset {offset}: {reason}")]
    Decompression { offset: u64, reason: String },

    /// The block type tag is not one of the known encodings
    #[error("Unknown block type tag {tag} at offset {offset}")]
    UnknownBlockType { tag: u8, offset: u64 },

    /// The decoded record count does not match the block header
    #[error("Block record count mismatch: header declares {expected}, decoded {found}")]
    RecordCountMismatch { expected: usize, found: usize },

    /// The decompressed payload ended mid-record
    #[error("Truncated block payload ({len} bytes) at offset {offset}")]
    TruncatedPayload { offset: u64, len: usize },
}

/// Errors related to block-cache configuration
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// A cache cannot be constructed with a zero byte budget
    #[error("Block cache capacity must be non-zero")]
    ZeroCapacity,
}

/// Errors raised while resolving or evaluating a range query
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// The requested chromosome is not in the catalogue
    #[error("Unknown chromosome: {0}")]
    UnknownChromosome(String),

    /// The requested genomic interval is empty or inverted
    #[error("Invalid range [{start}, {end}) on {chrom}")]
    InvalidRange { chrom: String, start: u64, end: u64 },

    /// The requested interval extends past the end of the chromosome
    #[error("Range end {end} exceeds length {length} of {chrom}")]
    RangeOutOfBounds { chrom: String, end: u64, length: u64 },

    /// A bin id past the end of a bin table was requested
    #[error("Requested bin id ({requested_id}) is out of table range ({size})")]
    BinOutOfRange { requested_id: u64, size: u64 },

    /// The file does not carry the requested resolution
    #[error("Resolution {0} is not available in this file")]
    ResolutionNotAvailable(u32),
}

/// Errors that occur while writing a container
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// The writer was configured without chromosomes
    #[error("Cannot build a writer over an empty reference")]
    EmptyReference,

    /// The writer was configured without resolutions
    #[error("Cannot build a writer with no resolutions")]
    NoResolutions,

    /// A pixel carries a bin id outside the resolution's bin table
    #[error("Pixel bin id {bin_id} is out of range for the {bin_size} bp bin table ({size} bins)")]
    PixelOutOfRange {
        bin_id: u64,
        bin_size: u32,
        size: u64,
    },

    /// Pixels were added for a resolution the writer was not configured with
    #[error("Resolution {0} was not declared at writer construction")]
    UndeclaredResolution(u32),

    /// A normalization vector's length does not match the chromosome's bin count
    #[error("Normalization vector length {got} does not match bin count {expected} for {chrom}")]
    NormVectorLength {
        chrom: String,
        expected: u64,
        got: usize,
    },

    /// The writer was used after `serialize` consumed its state
    #[error("Writer has already been finalized")]
    AlreadyFinalized,

    /// A merge-and-compress worker failed; the container was not finalized
    #[error("Worker failed during block compression: {0}")]
    WorkerFailure(String),
}
