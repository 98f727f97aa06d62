mod block;
mod cache;
mod merge;
mod selector;

pub use cache::{BlockCache, CacheStats};
pub use merge::PixelMerger;
pub use selector::{PixelIter, PixelSelector, ThinPixelIter};

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;

use crate::core::{BinTable, Chromosome, GenomicRange, MatrixType, Normalization, Unit};
use crate::error::{FooterError, HeaderError, QueryError, Result};
use crate::format::{
    footer_context, read_block_index, read_expected_values, read_master_index, read_norm_vector,
    read_preamble, BlockIndex, BlockMapper, ExpectedValues, FileHeader, MasterIndex,
    NO_FOOTER_OFFSET,
};
use crate::read::selector::ExpectedView;
use crate::Reference;
use crate::DEFAULT_CACHE_CAPACITY;

type FooterKey = (u32, u32, u8, u32);
type NormKey = (String, u32, u8, u32);

/// An open contact-matrix container.
///
/// Opening maps the file, parses the fixed header, genome preamble, and
/// master index; per-pair footers, normalization vectors, expected-value
/// curves, and bin tables are parsed lazily on first use and cached for the
/// handle's lifetime. All cached state is owned by the handle — several
/// containers can be open at once without interference.
#[derive(Debug)]
pub struct ContactFile {
    data: Arc<Mmap>,
    version: u8,
    genome_id: String,
    reference: Reference,
    resolutions: Vec<u32>,
    master: MasterIndex,
    cache: Arc<Mutex<BlockCache>>,
    footers: Mutex<HashMap<FooterKey, Option<Arc<BlockIndex>>>>,
    norms: Mutex<HashMap<NormKey, Arc<Vec<f64>>>>,
    expected: Mutex<HashMap<(u8, u32), Arc<ExpectedValues>>>,
    tables: Mutex<HashMap<u32, Arc<BinTable>>>,
}

impl ContactFile {
    /// Opens a container with the default block-cache budget
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_cache(path, DEFAULT_CACHE_CAPACITY)
    }

    /// Opens a container with an explicit block-cache byte budget
    pub fn open_with_cache<P: AsRef<Path>>(path: P, cache_capacity: usize) -> Result<Self> {
        let file = fs::File::open(path)?;
        let data = unsafe { Mmap::map(&file) }?;

        if data.len() < size_of::<FileHeader>() {
            return Err(HeaderError::Truncated(data.len() as u64).into());
        }
        let header = FileHeader::from_bytes(&data)?;

        let mut cursor = Cursor::new(&data[size_of::<FileHeader>()..]);
        let preamble = read_preamble(&mut cursor)?;

        if header.master_offset == 0 || header.master_offset >= data.len() as u64 {
            return Err(FooterError::MasterIndexOutOfBounds {
                offset: header.master_offset,
                file_len: data.len() as u64,
            }
            .into());
        }
        let mut cursor = Cursor::new(&data[header.master_offset as usize..]);
        let master = read_master_index(&mut cursor)?;

        log::debug!(
            "opened container v{} ({} chromosomes, {} resolutions, {} pairs)",
            header.version,
            preamble.reference.len(),
            preamble.resolutions.len(),
            master.pairs.len()
        );

        Ok(Self {
            data: Arc::new(data),
            version: header.version,
            genome_id: preamble.genome_id,
            reference: preamble.reference,
            resolutions: preamble.resolutions,
            master,
            cache: Arc::new(Mutex::new(BlockCache::new(cache_capacity)?)),
            footers: Mutex::new(HashMap::new()),
            norms: Mutex::new(HashMap::new()),
            expected: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn genome_id(&self) -> &str {
        &self.genome_id
    }

    #[must_use]
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    #[must_use]
    pub fn resolutions(&self) -> &[u32] {
        &self.resolutions
    }

    /// Cumulative block-cache counters for this handle
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    /// Drops every cached block and clears the cache statistics
    pub fn reset_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    fn check_resolution(&self, resolution: u32) -> Result<()> {
        if self.resolutions.contains(&resolution) {
            Ok(())
        } else {
            Err(QueryError::ResolutionNotAvailable(resolution).into())
        }
    }

    /// The genome-wide fixed bin table at `resolution`, built once per handle
    pub fn bins(&self, resolution: u32) -> Result<Arc<BinTable>> {
        self.check_resolution(resolution)?;
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = tables.get(&resolution) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(BinTable::fixed(self.reference.clone(), resolution)?);
        tables.insert(resolution, Arc::clone(&table));
        Ok(table)
    }

    /// Lazily parses the block index of one pair/resolution.
    ///
    /// `Ok(None)` covers both a pair missing from the master index and the
    /// explicit zero-interaction sentinel: a successful, empty matrix.
    fn block_index(
        &self,
        chrom1: &Chromosome,
        chrom2: &Chromosome,
        unit: Unit,
        bin_size: u32,
    ) -> Result<Option<Arc<BlockIndex>>> {
        let key = (chrom1.id(), chrom2.id(), unit.tag(), bin_size);
        let mut footers = self.footers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = footers.get(&key) {
            return Ok(cached.clone());
        }

        let offset = self.master.pairs.get(&(chrom1.id(), chrom2.id())).copied();
        let parsed = match offset {
            None | Some(NO_FOOTER_OFFSET) => None,
            Some(offset) => {
                if offset >= self.data.len() as u64 {
                    return Err(FooterError::MalformedFooter {
                        chrom1: chrom1.name().to_string(),
                        chrom2: chrom2.name().to_string(),
                        offset,
                    }
                    .into());
                }
                let mut cursor = Cursor::new(&self.data[offset as usize..]);
                read_block_index(&mut cursor, unit, bin_size)
                    .map_err(|e| footer_context(e, chrom1.name(), chrom2.name(), offset))?
                    .map(Arc::new)
            }
        };
        footers.insert(key, parsed.clone());
        Ok(parsed)
    }

    /// Loads one normalization vector; absence of an explicitly requested
    /// vector is fatal for the query that asked for it.
    fn norm_vector(
        &self,
        method: &Normalization,
        chrom: &Chromosome,
        unit: Unit,
        bin_size: u32,
    ) -> Result<Arc<Vec<f64>>> {
        let missing = || FooterError::NormVectorNotFound {
            method: method.name().to_string(),
            chrom: chrom.name().to_string(),
            unit: unit.to_string(),
            bin_size,
        };

        let key = (method.name().to_string(), chrom.id(), unit.tag(), bin_size);
        let mut norms = self.norms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(values) = norms.get(&key) {
            return Ok(Arc::clone(values));
        }

        if self.master.norm_offset == 0 {
            return Err(missing().into());
        }
        let mut cursor = Cursor::new(&self.data[self.master.norm_offset as usize..]);
        let values = read_norm_vector(&mut cursor, method, chrom.id(), unit, bin_size)?
            .ok_or_else(missing)?;
        let values = Arc::new(values);
        norms.insert(key, Arc::clone(&values));
        Ok(values)
    }

    /// Loads the expected-value curve for `(unit, bin_size)`
    fn expected_values(&self, unit: Unit, bin_size: u32) -> Result<Arc<ExpectedValues>> {
        let missing = || FooterError::ExpectedValuesNotFound {
            unit: unit.to_string(),
            bin_size,
        };

        let key = (unit.tag(), bin_size);
        let mut expected = self.expected.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(values) = expected.get(&key) {
            return Ok(Arc::clone(values));
        }

        if self.master.expected_offset == 0 {
            return Err(missing().into());
        }
        let mut cursor = Cursor::new(&self.data[self.master.expected_offset as usize..]);
        let values =
            read_expected_values(&mut cursor, unit, bin_size)?.ok_or_else(missing)?;
        let values = Arc::new(values);
        expected.insert(key, Arc::clone(&values));
        Ok(values)
    }

    /// Builds a selector over the query rectangle `range1 x range2`.
    ///
    /// Sides are swapped so `chrom1.id <= chrom2.id`, and for an
    /// intra-chromosomal query so `start1 <= start2`; results are logically
    /// symmetric either way. A never-observed pair yields an empty selector,
    /// not an error.
    pub fn fetch(
        &self,
        resolution: u32,
        range1: GenomicRange,
        range2: GenomicRange,
        normalization: Normalization,
        matrix_type: MatrixType,
    ) -> Result<PixelSelector> {
        self.check_resolution(resolution)?;
        let unit = Unit::Bp;

        let chrom1 = range1.resolve(&self.reference)?.clone();
        let chrom2 = range2.resolve(&self.reference)?.clone();

        let ((chrom1, range1), (chrom2, range2)) = if chrom1.id() > chrom2.id() {
            ((chrom2, range2), (chrom1, range1))
        } else {
            ((chrom1, range1), (chrom2, range2))
        };
        let intra = chrom1 == chrom2;
        let (range1, range2) = if intra && range1.start > range2.start {
            (range2, range1)
        } else {
            (range1, range2)
        };

        let index = self.block_index(&chrom1, &chrom2, unit, resolution)?;
        let bins = self.bins(resolution)?;
        let chrom1_offset = bins.chrom_offset(&chrom1)?;
        let chrom2_offset = bins.chrom_offset(&chrom2)?;

        let bin_size = u64::from(resolution);
        let bin1_lo = range1.start / bin_size;
        let bin1_hi = (range1.end - 1) / bin_size;
        let bin2_lo = range2.start / bin_size;
        let bin2_hi = (range2.end - 1) / bin_size;

        let (weights1, weights2) =
            if normalization.is_none() || matrix_type == MatrixType::Expected {
                (None, None)
            } else {
                let w1 = self.norm_vector(&normalization, &chrom1, unit, resolution)?;
                let w2 = if intra {
                    Arc::clone(&w1)
                } else {
                    self.norm_vector(&normalization, &chrom2, unit, resolution)?
                };
                (Some(w1), Some(w2))
            };

        let expected = if matrix_type == MatrixType::Observed {
            None
        } else if intra {
            let values = self.expected_values(unit, resolution)?;
            let scale = values
                .scale_factors
                .get(&chrom1.id())
                .copied()
                .unwrap_or(1.0);
            Some(ExpectedView::Intra { values, scale })
        } else {
            let average = index.as_ref().map_or(0.0, |index| {
                let bins1 = chrom1.num_bins(resolution);
                let bins2 = chrom2.num_bins(resolution);
                index.sum_counts / (bins1 * bins2) as f64
            });
            Some(ExpectedView::Inter { average })
        };

        let mapper = index.as_ref().map(|index| {
            BlockMapper::from_dimensions(
                self.version,
                intra,
                index.block_bin_count,
                index.block_column_count,
            )
        });

        Ok(PixelSelector {
            data: Arc::clone(&self.data),
            version: self.version,
            cache: Arc::clone(&self.cache),
            index,
            mapper,
            bins,
            chrom1,
            chrom2,
            chrom1_offset,
            chrom2_offset,
            bin1_lo,
            bin1_hi,
            bin2_lo,
            bin2_hi,
            weights1,
            weights2,
            expected,
            normalization,
            matrix_type,
        })
    }

    /// Whole-genome query: every recorded chromosome pair's selector merged
    /// into one globally sorted pixel sequence.
    pub fn fetch_all(
        &self,
        resolution: u32,
        normalization: Normalization,
        matrix_type: MatrixType,
    ) -> Result<PixelMerger<ThinPixelIter>> {
        self.check_resolution(resolution)?;
        let mut sources = Vec::new();
        for chrom1 in self.reference.iter() {
            for chrom2 in self.reference.iter() {
                if chrom2.id() < chrom1.id() {
                    continue;
                }
                if !self
                    .master
                    .pairs
                    .contains_key(&(chrom1.id(), chrom2.id()))
                {
                    continue;
                }
                let selector = self.fetch(
                    resolution,
                    GenomicRange::whole(chrom1),
                    GenomicRange::whole(chrom2),
                    normalization.clone(),
                    matrix_type,
                )?;
                sources.push(selector.thin_pixels());
            }
        }
        Ok(PixelMerger::new(sources))
    }
}
