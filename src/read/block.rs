use std::collections::BTreeMap;
use std::sync::Arc;

use memmap2::Mmap;
use zstd::zstd_safe;

use crate::error::{BlockError, Result};
use crate::format::{decode_payload, BlockRecord, BlockSpan};

/// Stable accounting cost of one decoded record: two ids plus a count.
///
/// The cache budgets against this rather than the exact heap footprint, so
/// the effective capacity is a pixel-count-proportional bound that compares
/// the same across block shapes.
const RECORD_COST: usize = 20;

/// One decoded tile of the sparse interaction matrix.
///
/// Rows are keyed by chromosome-relative `bin1`; each row's column list is
/// sorted ascending by `bin2`. Blocks are immutable once decoded and shared
/// behind `Arc` between the cache and any in-flight query.
#[derive(Debug)]
pub(crate) struct InteractionBlock {
    rows: BTreeMap<u32, Vec<(u32, f32)>>,
    num_records: usize,
}

impl InteractionBlock {
    pub fn empty() -> Self {
        Self {
            rows: BTreeMap::new(),
            num_records: 0,
        }
    }

    /// Groups wire records into sorted rows
    pub fn from_records(records: Vec<BlockRecord>) -> Self {
        let num_records = records.len();
        let mut rows: BTreeMap<u32, Vec<(u32, f32)>> = BTreeMap::new();
        for record in records {
            rows.entry(record.bin1)
                .or_default()
                .push((record.bin2, record.count));
        }
        for columns in rows.values_mut() {
            columns.sort_unstable_by_key(|(bin2, _)| *bin2);
        }
        Self { rows, num_records }
    }

    #[must_use]
    pub fn num_records(&self) -> usize {
        self.num_records
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.num_records * RECORD_COST
    }

    /// The sorted column list of one row, if the row has any records
    #[must_use]
    pub fn row(&self, bin1: u32) -> Option<&[(u32, f32)]> {
        self.rows.get(&bin1).map(Vec::as_slice)
    }

    /// Iterates `(bin1, columns)` rows in ascending order
    pub fn iter_rows(&self) -> impl Iterator<Item = (u32, &[(u32, f32)])> {
        self.rows.iter().map(|(bin1, cols)| (*bin1, cols.as_slice()))
    }
}

/// Reads raw block frames from the mapped container body, decompresses and
/// decodes them into [`InteractionBlock`]s.
///
/// Holds a reusable decompression context and output buffer; one reader
/// serves one selector, on its calling thread.
pub(crate) struct BlockReader {
    data: Arc<Mmap>,
    version: u8,
    dctx: zstd_safe::DCtx<'static>,
    buf: Vec<u8>,
}

impl BlockReader {
    pub fn new(data: Arc<Mmap>, version: u8) -> Self {
        Self {
            data,
            version,
            dctx: zstd_safe::DCtx::create(),
            buf: Vec::new(),
        }
    }

    /// Reads, decompresses and decodes the block at `span`.
    ///
    /// The frame does not record its decompressed size, so decompression
    /// retries with a doubled output buffer whenever the codec reports
    /// insufficient output space; any other codec error means corrupt data
    /// and is fatal.
    pub fn read(&mut self, span: BlockSpan) -> Result<InteractionBlock> {
        let start = span.offset as usize;
        let end = start + span.length as usize;
        if end > self.data.len() {
            return Err(BlockError::TruncatedPayload {
                offset: span.offset,
                len: self.data.len().saturating_sub(start),
            }
            .into());
        }
        let raw = &self.data[start..end];

        let mut capacity = (span.length as usize).max(1024) * 4;
        let decoded_len = loop {
            self.buf.resize(capacity, 0);
            match self.dctx.decompress(self.buf.as_mut_slice(), raw) {
                Ok(n) => break n,
                Err(code) => {
                    let reason = zstd_safe::get_error_name(code);
                    if reason.contains("too small") {
                        capacity *= 2;
                        continue;
                    }
                    return Err(BlockError::Decompression {
                        offset: span.offset,
                        reason: reason.to_string(),
                    }
                    .into());
                }
            }
        };

        log::trace!(
            "decoded block at offset {} ({} -> {} bytes)",
            span.offset,
            span.length,
            decoded_len
        );
        let records = decode_payload(self.version, &self.buf[..decoded_len], span.offset)?;
        Ok(InteractionBlock::from_records(records))
    }
}
