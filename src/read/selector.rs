use std::sync::{Arc, Mutex};

use memmap2::Mmap;

use crate::core::{BinTable, Chromosome, Count, MatrixType, Normalization, Pixel, ThinPixel};
use crate::error::Result;
use crate::format::{BlockIndex, BlockMapper, ExpectedValues};
use crate::read::block::{BlockReader, InteractionBlock};
use crate::read::cache::{BlockCache, BlockKey};

/// Expected-value lookup for one selector's chromosome pair.
#[derive(Clone, Debug)]
pub(crate) enum ExpectedView {
    /// Per-diagonal curve with the chromosome's scale factor folded in
    Intra { values: Arc<ExpectedValues>, scale: f64 },
    /// Flat matrix-wide average for an inter-chromosomal pair
    Inter { average: f64 },
}
impl ExpectedView {
    fn at(&self, row: u64, col: u64) -> f64 {
        match self {
            Self::Intra { values, scale } => {
                let diagonal = row.abs_diff(col) as usize;
                values.values.get(diagonal).copied().unwrap_or(0.0) / scale
            }
            Self::Inter { average } => *average,
        }
    }
}

/// A materialized 2-D range query against one chromosome pair.
///
/// Construction resolves everything fallible up front (footer, weights,
/// expected values); iteration then walks bin1 rows in order, fetching
/// overlapping blocks cache-first and merging their pre-sorted column lists.
/// All internal state is cheaply cloneable `Arc`s, so iterators own a copy
/// of the selector and several can run against one file handle.
#[derive(Clone, Debug)]
pub struct PixelSelector {
    pub(crate) data: Arc<Mmap>,
    pub(crate) version: u8,
    pub(crate) cache: Arc<Mutex<BlockCache>>,
    /// `None` when the pair was never observed: a valid, empty result
    pub(crate) index: Option<Arc<BlockIndex>>,
    pub(crate) mapper: Option<BlockMapper>,
    pub(crate) bins: Arc<BinTable>,
    pub(crate) chrom1: Chromosome,
    pub(crate) chrom2: Chromosome,
    /// Global bin id of each chromosome's first bin at this resolution
    pub(crate) chrom1_offset: u64,
    pub(crate) chrom2_offset: u64,
    /// Chromosome-relative inclusive bin bounds of the query rectangle
    pub(crate) bin1_lo: u64,
    pub(crate) bin1_hi: u64,
    pub(crate) bin2_lo: u64,
    pub(crate) bin2_hi: u64,
    pub(crate) weights1: Option<Arc<Vec<f64>>>,
    pub(crate) weights2: Option<Arc<Vec<f64>>>,
    pub(crate) expected: Option<ExpectedView>,
    pub(crate) normalization: Normalization,
    pub(crate) matrix_type: MatrixType,
}

impl PixelSelector {
    #[must_use]
    pub fn chromosome1(&self) -> &Chromosome {
        &self.chrom1
    }

    #[must_use]
    pub fn chromosome2(&self) -> &Chromosome {
        &self.chrom2
    }

    #[must_use]
    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    #[must_use]
    pub fn matrix_type(&self) -> MatrixType {
        self.matrix_type
    }

    fn intra(&self) -> bool {
        self.chrom1 == self.chrom2
    }

    /// Row-ordered iteration of global-id pixels
    #[must_use]
    pub fn thin_pixels(&self) -> ThinPixelIter {
        let reader = BlockReader::new(Arc::clone(&self.data), self.version);
        let (row, end_row) = if self.intra() {
            (self.bin1_lo.min(self.bin2_lo), self.bin1_hi.max(self.bin2_hi))
        } else {
            (self.bin1_lo, self.bin1_hi)
        };
        ThinPixelIter {
            sel: self.clone(),
            reader,
            loaded: None,
            row,
            end_row,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Row-ordered iteration with resolved bins and a caller-chosen count type
    #[must_use]
    pub fn pixels<N: Count>(&self) -> PixelIter<N> {
        PixelIter {
            inner: self.thin_pixels(),
            bins: Arc::clone(&self.bins),
            _marker: std::marker::PhantomData,
        }
    }

    /// Applies normalization and the matrix-type transform to one raw count.
    /// `None` drops the pixel (non-finite result).
    fn value_for(&self, row: u64, col: u64, raw: f32) -> Option<f32> {
        let mut value = f64::from(raw);

        if self.matrix_type != MatrixType::Expected && !self.normalization.is_none() {
            let w1 = self
                .weights1
                .as_ref()
                .and_then(|w| w.get(row as usize))
                .copied()
                .unwrap_or(f64::NAN);
            let w2 = self
                .weights2
                .as_ref()
                .and_then(|w| w.get(col as usize))
                .copied()
                .unwrap_or(f64::NAN);
            value /= w1 * w2;
        }

        match (&self.matrix_type, &self.expected) {
            (MatrixType::Observed, _) => {}
            (MatrixType::Expected, Some(expected)) => value = expected.at(row, col),
            (MatrixType::ObservedExpected, Some(expected)) => value /= expected.at(row, col),
            // expected views are resolved at fetch time for these types
            (_, None) => return None,
        }

        if value.is_finite() {
            Some(value as f32)
        } else {
            None
        }
    }
}

/// Merges up to two per-row bin2 windows, collapsing them when they overlap
/// so a pixel inside both is emitted once.
fn merge_windows(mut windows: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    windows.sort_unstable();
    if windows.len() == 2 && windows[1].0 <= windows[0].1 {
        windows[0].1 = windows[0].1.max(windows[1].1);
        windows.truncate(1);
    }
    windows
}

/// Iterator over [`ThinPixel`]s in global row-major order.
///
/// State machine: a current-row cursor plus a materialized row buffer;
/// walking past the buffer fetches the next non-empty row, and passing the
/// last row is terminal. Block I/O errors surface once, then the iterator
/// fuses.
pub struct ThinPixelIter {
    sel: PixelSelector,
    reader: BlockReader,
    loaded: Option<Vec<Arc<InteractionBlock>>>,
    row: u64,
    end_row: u64,
    buf: Vec<ThinPixel>,
    pos: usize,
    done: bool,
}

impl ThinPixelIter {
    /// Enumerates the query's overlapping blocks and fetches each, cache
    /// first. Shared `Arc`s keep evicted blocks alive for this query.
    fn load_blocks(&mut self) -> Result<Vec<Arc<InteractionBlock>>> {
        let sel = &self.sel;
        let (Some(index), Some(mapper)) = (&sel.index, &sel.mapper) else {
            return Ok(Vec::new());
        };
        let ids = mapper.blocks_for_query(
            sel.bin1_lo,
            sel.bin1_hi,
            sel.bin2_lo,
            sel.bin2_hi,
            sel.intra(),
        );

        let mut blocks = Vec::new();
        for id in ids {
            let Some(span) = index.blocks.get(&id) else {
                continue;
            };
            let key = BlockKey {
                chrom1: sel.chrom1.id(),
                chrom2: sel.chrom2.id(),
                block_id: id,
            };
            // a poisoned lock still holds consistent cache state; reclaim it
            let cached = {
                let mut cache = sel.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.get(&key)
            };
            if let Some(block) = cached {
                blocks.push(block);
                continue;
            }
            let decoded = Arc::new(self.reader.read(*span)?);
            {
                let mut cache = sel.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.insert(key, Arc::clone(&decoded));
            }
            blocks.push(decoded);
        }
        Ok(blocks)
    }

    /// Fills the row buffer for `row`; leaves it empty when the row has no
    /// pixels inside the query.
    fn fill_row(&mut self, row: u64) {
        self.buf.clear();
        self.pos = 0;

        let sel = &self.sel;
        let mut windows = Vec::with_capacity(2);
        if row >= sel.bin1_lo && row <= sel.bin1_hi {
            windows.push((sel.bin2_lo, sel.bin2_hi));
        }
        if sel.intra() && row >= sel.bin2_lo && row <= sel.bin2_hi {
            windows.push((sel.bin1_lo, sel.bin1_hi));
        }
        let windows = merge_windows(windows);
        if windows.is_empty() {
            return;
        }

        let blocks = self.loaded.as_ref().expect("blocks loaded before rows");

        // bounded binary search into each block's pre-sorted row, then a
        // k-way merge of the surviving slices; never a full sort
        let mut parts: Vec<&[(u32, f32)]> = Vec::new();
        for block in blocks {
            let Some(columns) = block.row(row as u32) else {
                continue;
            };
            for &(lo, hi) in &windows {
                let start = columns.partition_point(|(col, _)| u64::from(*col) < lo);
                let len = columns[start..].partition_point(|(col, _)| u64::from(*col) <= hi);
                if len > 0 {
                    parts.push(&columns[start..start + len]);
                }
            }
        }

        let mut cursors = vec![0usize; parts.len()];
        loop {
            let mut best: Option<usize> = None;
            for (i, part) in parts.iter().enumerate() {
                if cursors[i] >= part.len() {
                    continue;
                }
                let head = part[cursors[i]].0;
                if best.map_or(true, |b| head < parts[b][cursors[b]].0) {
                    best = Some(i);
                }
            }
            let Some(i) = best else { break };
            let (col, raw) = parts[i][cursors[i]];
            cursors[i] += 1;

            if let Some(value) = sel.value_for(row, u64::from(col), raw) {
                self.buf.push(ThinPixel {
                    bin1_id: sel.chrom1_offset + row,
                    bin2_id: sel.chrom2_offset + u64::from(col),
                    count: value,
                });
            }
        }
    }
}

impl Iterator for ThinPixelIter {
    type Item = Result<ThinPixel>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.loaded.is_none() {
            match self.load_blocks() {
                Ok(blocks) => {
                    if blocks.is_empty() {
                        self.done = true;
                        return None;
                    }
                    self.loaded = Some(blocks);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        while self.pos >= self.buf.len() {
            if self.row > self.end_row {
                self.done = true;
                return None;
            }
            let row = self.row;
            self.row += 1;
            self.fill_row(row);
        }
        let pixel = self.buf[self.pos];
        self.pos += 1;
        Some(Ok(pixel))
    }
}

/// Iterator adapter resolving [`ThinPixel`]s into [`Pixel`]s with the
/// caller's numeric count type.
pub struct PixelIter<N: Count> {
    inner: ThinPixelIter,
    bins: Arc<BinTable>,
    _marker: std::marker::PhantomData<N>,
}

impl<N: Count> Iterator for PixelIter<N> {
    type Item = Result<Pixel<N>>;

    fn next(&mut self) -> Option<Self::Item> {
        let thin = match self.inner.next()? {
            Ok(thin) => thin,
            Err(e) => return Some(Err(e)),
        };
        let resolve = |id: u64| self.bins.at(id);
        let bin1 = match resolve(thin.bin1_id) {
            Ok(bin) => bin,
            Err(e) => return Some(Err(e)),
        };
        let bin2 = match resolve(thin.bin2_id) {
            Ok(bin) => bin,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(Pixel {
            bin1,
            bin2,
            count: N::from_f64(f64::from(thin.count)),
        }))
    }
}
