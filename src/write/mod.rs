mod pool;
mod scratch;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::core::{BinTable, Chromosome, Normalization, ThinPixel, Unit};
use crate::error::{Result, WriteError};
use crate::format::{
    write_expected_section, write_master_index, write_norm_section, write_pair_footer,
    BlockIndex, BlockMapper, BlockRecord, ExpectedValues, FileHeader, MasterIndex,
    NormVectorEntry, Preamble, MASTER_OFFSET_POS, NO_FOOTER_OFFSET,
};
use crate::Reference;
use crate::{DEFAULT_BLOCK_BIN_COUNT, DEFAULT_COMPRESSION_LEVEL, DEFAULT_SPILL_THRESHOLD};

use pool::{compress_blocks, PoolConfig};
use scratch::ScratchFile;

/// `(chrom1_id, chrom2_id, bin_size)` — one stored matrix
type PairKey = (u32, u32, u32);

/// In-memory bytes of one accumulated record
const MEM_RECORD_SIZE: usize = 12;

/// A builder for configured [`ContactWriter`] instances.
#[derive(Default)]
pub struct ContactWriterBuilder {
    genome_id: Option<String>,
    reference: Option<Reference>,
    resolutions: Vec<u32>,
    block_bin_count: Option<u32>,
    compression_level: Option<i32>,
    num_threads: Option<usize>,
    spill_threshold: Option<usize>,
}

impl ContactWriterBuilder {
    /// Sets the genome assembly label stored in the header
    #[must_use]
    pub fn genome_id(mut self, genome_id: impl Into<String>) -> Self {
        self.genome_id = Some(genome_id.into());
        self
    }

    /// Sets the chromosome catalogue (required)
    #[must_use]
    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Declares the bin sizes this container will store (required, non-empty)
    #[must_use]
    pub fn resolutions(mut self, resolutions: impl IntoIterator<Item = u32>) -> Self {
        self.resolutions = resolutions.into_iter().collect();
        self
    }

    /// Bins along one axis of a block tile
    #[must_use]
    pub fn block_bin_count(mut self, block_bin_count: u32) -> Self {
        self.block_bin_count = Some(block_bin_count);
        self
    }

    /// zstd level used for block frames
    #[must_use]
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Worker threads for the merge-and-compress stage; 0 = one per CPU
    #[must_use]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// In-memory pixel bytes accumulated before spilling to scratch files
    #[must_use]
    pub fn spill_threshold(mut self, bytes: usize) -> Self {
        self.spill_threshold = Some(bytes);
        self
    }

    /// Creates the output file and writes the header and genome preamble.
    pub fn build<P: AsRef<Path>>(self, path: P) -> Result<ContactWriter> {
        let reference = self.reference.ok_or(WriteError::EmptyReference)?;
        let mut resolutions = self.resolutions;
        resolutions.sort_unstable();
        resolutions.dedup();
        if resolutions.is_empty() {
            return Err(WriteError::NoResolutions.into());
        }

        let file = File::create(path)?;
        let preamble = Preamble {
            genome_id: self.genome_id.unwrap_or_else(|| "unknown".to_string()),
            reference: reference.clone(),
            resolutions: resolutions.clone(),
        };
        let mut head = Vec::new();
        head.extend_from_slice(FileHeader::new().as_bytes());
        crate::format::write_preamble(&mut head, &preamble)?;
        {
            let mut handle = &file;
            handle.write_all(&head)?;
        }

        Ok(ContactWriter {
            file,
            pos: head.len() as u64,
            reference,
            resolutions,
            block_bin_count: self.block_bin_count.unwrap_or(DEFAULT_BLOCK_BIN_COUNT).max(1),
            compression_level: self.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            num_threads: self.num_threads.unwrap_or(0),
            spill_threshold: self.spill_threshold.unwrap_or(DEFAULT_SPILL_THRESHOLD),
            tables: HashMap::new(),
            mem: HashMap::new(),
            mem_records: 0,
            scratch: HashMap::new(),
            norm_entries: Vec::new(),
            finalized: false,
        })
    }
}

/// Streaming writer for contact-matrix containers.
///
/// Pixels arrive per resolution in any order; a deterministic block mapper
/// assigns each one to a tile, and accumulated tiles spill to per-matrix
/// scratch files once the memory threshold trips. `serialize` merges every
/// tile's fragments, compresses blocks across a worker pool with
/// deterministic output order, then writes footers, expected values,
/// normalization vectors, and the master index; the header's master offset
/// is patched last, so an interrupted write never looks finalized.
pub struct ContactWriter {
    file: File,
    pos: u64,
    reference: Reference,
    resolutions: Vec<u32>,
    block_bin_count: u32,
    compression_level: i32,
    num_threads: usize,
    spill_threshold: usize,
    tables: HashMap<u32, BinTable>,
    mem: HashMap<PairKey, HashMap<u64, Vec<BlockRecord>>>,
    mem_records: usize,
    scratch: HashMap<PairKey, ScratchFile>,
    norm_entries: Vec<NormVectorEntry>,
    finalized: bool,
}

impl ContactWriter {
    #[must_use]
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    #[must_use]
    pub fn resolutions(&self) -> &[u32] {
        &self.resolutions
    }

    fn check_open(&self) -> Result<()> {
        if self.finalized {
            return Err(WriteError::AlreadyFinalized.into());
        }
        Ok(())
    }

    fn table(&mut self, resolution: u32) -> Result<BinTable> {
        if !self.resolutions.contains(&resolution) {
            return Err(WriteError::UndeclaredResolution(resolution).into());
        }
        if let Some(table) = self.tables.get(&resolution) {
            return Ok(table.clone());
        }
        let table = BinTable::fixed(self.reference.clone(), resolution)?;
        self.tables.insert(resolution, table.clone());
        Ok(table)
    }

    fn mapper_for(&self, chrom1: &Chromosome, chrom2: &Chromosome, resolution: u32) -> BlockMapper {
        if chrom1 == chrom2 {
            BlockMapper::diagonal(chrom1.num_bins(resolution), self.block_bin_count)
        } else {
            BlockMapper::grid(chrom2.num_bins(resolution), self.block_bin_count)
        }
    }

    /// Queues pixels for one resolution, in any order.
    ///
    /// Bin ids are global against that resolution's genome-wide bin table.
    /// Endpoints are re-ordered so `chrom1.id <= chrom2.id` (and
    /// `bin1 <= bin2` within a chromosome); duplicate pixels are summed at
    /// finalize.
    pub fn add_pixels(
        &mut self,
        resolution: u32,
        pixels: impl IntoIterator<Item = ThinPixel>,
    ) -> Result<()> {
        self.check_open()?;
        let table = self.table(resolution)?;
        let size = table.size();

        for pixel in pixels {
            if pixel.bin1_id >= size || pixel.bin2_id >= size {
                return Err(WriteError::PixelOutOfRange {
                    bin_id: pixel.bin1_id.max(pixel.bin2_id),
                    bin_size: resolution,
                    size,
                }
                .into());
            }
            let bin1 = table.at(pixel.bin1_id)?;
            let bin2 = table.at(pixel.bin2_id)?;
            let (bin1, bin2) = if bin1.chromosome().id() > bin2.chromosome().id()
                || (bin1.chromosome() == bin2.chromosome() && bin1.rel_id() > bin2.rel_id())
            {
                (bin2, bin1)
            } else {
                (bin1, bin2)
            };
            let chrom1 = bin1.chromosome();
            let chrom2 = bin2.chromosome();

            let mapper = self.mapper_for(chrom1, chrom2, resolution);
            let block_id = mapper.block_id(bin1.rel_id(), bin2.rel_id());

            let key = (chrom1.id(), chrom2.id(), resolution);
            self.mem
                .entry(key)
                .or_default()
                .entry(block_id)
                .or_default()
                .push(BlockRecord {
                    bin1: bin1.rel_id() as u32,
                    bin2: bin2.rel_id() as u32,
                    count: pixel.count,
                });
            self.mem_records += 1;
        }

        if self.mem_records * MEM_RECORD_SIZE >= self.spill_threshold {
            self.spill_all()?;
        }
        Ok(())
    }

    /// Registers an externally computed normalization vector, one value per
    /// bin of `chrom` at `resolution`. Must be called before `serialize`.
    pub fn add_norm_vector(
        &mut self,
        method: Normalization,
        chrom: &str,
        unit: Unit,
        resolution: u32,
        values: Vec<f64>,
    ) -> Result<()> {
        self.check_open()?;
        let chrom = self.reference.require(chrom)?.clone();
        if unit == Unit::Bp {
            if !self.resolutions.contains(&resolution) {
                return Err(WriteError::UndeclaredResolution(resolution).into());
            }
            let expected = chrom.num_bins(resolution);
            if values.len() as u64 != expected {
                return Err(WriteError::NormVectorLength {
                    chrom: chrom.name().to_string(),
                    expected,
                    got: values.len(),
                }
                .into());
            }
        }
        self.norm_entries.push(NormVectorEntry {
            method,
            chrom_id: chrom.id(),
            unit,
            bin_size: resolution,
            values,
        });
        Ok(())
    }

    /// Moves every in-memory block buffer into its matrix's scratch file
    fn spill_all(&mut self) -> Result<()> {
        for (key, blocks) in self.mem.drain() {
            let scratch = match self.scratch.entry(key) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(ScratchFile::new()?)
                }
            };
            for (block_id, records) in blocks {
                scratch.append(block_id, &records)?;
            }
        }
        self.mem_records = 0;
        Ok(())
    }

    fn write_section(&mut self, bytes: &[u8]) -> Result<()> {
        let mut handle = &self.file;
        handle.seek(SeekFrom::Start(self.pos))?;
        handle.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Flushes every pending matrix, writes blocks (parallel merge-and-
    /// compress per matrix), pair footers, the expected-value and
    /// normalization sections, and the master index, then patches the
    /// header. On any failure the master offset stays zero and the file is
    /// not readable as a finalized container.
    pub fn serialize(&mut self) -> Result<()> {
        self.check_open()?;
        self.finalized = true;
        self.spill_all()?;

        let mut pair_keys: Vec<PairKey> = self.scratch.keys().copied().collect();
        pair_keys.sort_unstable();

        let mut master = MasterIndex::default();
        let mut footers: BTreeMap<(u32, u32), Vec<BlockIndex>> = BTreeMap::new();
        let mut expected_accums: BTreeMap<u32, ExpectedAccum> = BTreeMap::new();

        for key in pair_keys {
            let (chrom1_id, chrom2_id, resolution) = key;
            let chrom1 = self
                .reference
                .chromosome(chrom1_id)
                .expect("catalogued id")
                .clone();
            let chrom2 = self
                .reference
                .chromosome(chrom2_id)
                .expect("catalogued id")
                .clone();
            let intra = chrom1 == chrom2;
            let mapper = self.mapper_for(&chrom1, &chrom2, resolution);

            let scratch = self.scratch.remove(&key).expect("key from scratch map");
            let block_ids = scratch.block_ids();
            if block_ids.is_empty() {
                master
                    .pairs
                    .entry((chrom1_id, chrom2_id))
                    .or_insert(NO_FOOTER_OFFSET);
                continue;
            }

            log::debug!(
                "compressing {} blocks ({} records) for {}/{} at {} bp",
                block_ids.len(),
                scratch.num_records(),
                chrom1.name(),
                chrom2.name(),
                resolution
            );

            let scratch = Mutex::new(scratch);
            let config = PoolConfig {
                num_threads: self.num_threads,
                compression_level: self.compression_level,
                intra,
            };
            let read_fragments = |block_id: u64| {
                scratch
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .read_block(block_id)
            };
            let (spans, stats, end_pos) =
                compress_blocks(&block_ids, read_fragments, &self.file, self.pos, &config)?;
            self.pos = end_pos;

            if intra {
                let accum = expected_accums.entry(resolution).or_default();
                accum.fold_diagonals(&stats.diag_sums);
                *accum.obs_per_chrom.entry(chrom1_id).or_insert(0.0) += stats.sum_counts;
            }

            footers.entry((chrom1_id, chrom2_id)).or_default().push(BlockIndex {
                unit: Unit::Bp,
                bin_size: resolution,
                sum_counts: stats.sum_counts,
                block_bin_count: mapper.block_bin_count(),
                block_column_count: mapper.block_column_count(),
                blocks: spans,
            });
        }

        // pair footers, in catalogue order
        for (pair, indexes) in &footers {
            let offset = self.pos;
            let mut buf = Vec::new();
            write_pair_footer(&mut buf, indexes)?;
            self.write_section(&buf)?;
            master.pairs.insert(*pair, offset);
        }

        // expected-value section
        let expected_entries = self.build_expected(&expected_accums);
        if !expected_entries.is_empty() {
            master.expected_offset = self.pos;
            let mut buf = Vec::new();
            write_expected_section(&mut buf, &expected_entries)?;
            self.write_section(&buf)?;
        }

        // normalization section
        if !self.norm_entries.is_empty() {
            master.norm_offset = self.pos;
            let mut buf = Vec::new();
            write_norm_section(&mut buf, &self.norm_entries)?;
            self.write_section(&buf)?;
        }

        // master index, then the header patch that makes the file readable
        let master_offset = self.pos;
        let mut buf = Vec::new();
        write_master_index(&mut buf, &master)?;
        self.write_section(&buf)?;

        let mut handle = &self.file;
        handle.seek(SeekFrom::Start(MASTER_OFFSET_POS))?;
        handle.write_u64::<LittleEndian>(master_offset)?;
        handle.flush()?;
        self.file.sync_all()?;

        log::debug!(
            "finalized container: {} pairs, master index at {}",
            master.pairs.len(),
            master_offset
        );
        Ok(())
    }

    /// Turns accumulated diagonal sums into expected-value curves with
    /// per-chromosome scale factors.
    fn build_expected(&self, accums: &BTreeMap<u32, ExpectedAccum>) -> Vec<ExpectedValues> {
        let mut entries = Vec::new();
        for (&resolution, accum) in accums {
            if accum.diag_sums.is_empty() {
                continue;
            }
            // genome-wide mean per diagonal: the sum over every chromosome
            // long enough to contribute that diagonal
            let values: Vec<f64> = accum
                .diag_sums
                .iter()
                .enumerate()
                .map(|(diagonal, sum)| {
                    let possible: u64 = self
                        .reference
                        .iter()
                        .map(|c| c.num_bins(resolution).saturating_sub(diagonal as u64))
                        .sum();
                    if possible == 0 {
                        0.0
                    } else {
                        sum / possible as f64
                    }
                })
                .collect();

            // scale factor: expected total over the chromosome's triangle
            // relative to its observed total, so per-chromosome O/E means 1
            let mut scale_factors = HashMap::new();
            for chrom in self.reference.iter() {
                let Some(observed) = accum.obs_per_chrom.get(&chrom.id()) else {
                    continue;
                };
                if *observed <= 0.0 {
                    continue;
                }
                let bins = chrom.num_bins(resolution);
                let expected_total: f64 = values
                    .iter()
                    .enumerate()
                    .take(bins as usize)
                    .map(|(diagonal, value)| (bins - diagonal as u64) as f64 * value)
                    .sum();
                if expected_total > 0.0 {
                    scale_factors.insert(chrom.id(), expected_total / observed);
                }
            }

            entries.push(ExpectedValues {
                unit: Unit::Bp,
                bin_size: resolution,
                values,
                scale_factors,
            });
        }
        entries
    }
}

#[derive(Default)]
struct ExpectedAccum {
    diag_sums: Vec<f64>,
    obs_per_chrom: HashMap<u32, f64>,
}
impl ExpectedAccum {
    fn fold_diagonals(&mut self, diag_sums: &[f64]) {
        if diag_sums.len() > self.diag_sums.len() {
            self.diag_sums.resize(diag_sums.len(), 0.0);
        }
        for (acc, value) in self.diag_sums.iter_mut().zip(diag_sums) {
            *acc += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Reference {
        Reference::new([("chr1", 1000u64), ("chr2", 500)]).unwrap()
    }

    // ==================== Builder Tests ====================

    #[test]
    fn test_builder_requires_reference_and_resolutions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.hct");

        let missing_ref = ContactWriterBuilder::default()
            .resolutions([100])
            .build(&path);
        assert!(missing_ref.is_err());

        let missing_res = ContactWriterBuilder::default()
            .reference(reference())
            .build(&path);
        assert!(missing_res.is_err());
    }

    #[test]
    fn test_builder_sorts_and_dedups_resolutions() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([300, 100, 300])
            .build(dir.path().join("x.hct"))
            .unwrap();
        assert_eq!(writer.resolutions(), &[100, 300]);
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_add_pixels_rejects_undeclared_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([100])
            .build(dir.path().join("x.hct"))
            .unwrap();
        let result = writer.add_pixels(250, [ThinPixel::new(0, 0, 1.0)]);
        assert!(matches!(
            result.unwrap_err(),
            crate::Error::WriteError(WriteError::UndeclaredResolution(250))
        ));
    }

    #[test]
    fn test_add_pixels_rejects_out_of_range_bins() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([300])
            .build(dir.path().join("x.hct"))
            .unwrap();
        // the 300 bp table has 6 bins
        let result = writer.add_pixels(300, [ThinPixel::new(0, 6, 1.0)]);
        assert!(matches!(
            result.unwrap_err(),
            crate::Error::WriteError(WriteError::PixelOutOfRange { bin_id: 6, .. })
        ));
    }

    #[test]
    fn test_add_norm_vector_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([300])
            .build(dir.path().join("x.hct"))
            .unwrap();
        // chr2 at 300 bp has 2 bins
        let bad = writer.add_norm_vector(
            Normalization::Kr,
            "chr2",
            Unit::Bp,
            300,
            vec![1.0, 1.0, 1.0],
        );
        assert!(bad.is_err());
        let good =
            writer.add_norm_vector(Normalization::Kr, "chr2", Unit::Bp, 300, vec![1.0, 1.0]);
        assert!(good.is_ok());
    }

    #[test]
    fn test_writer_unusable_after_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([300])
            .build(dir.path().join("x.hct"))
            .unwrap();
        writer.add_pixels(300, [ThinPixel::new(0, 1, 2.0)]).unwrap();
        writer.serialize().unwrap();
        assert!(matches!(
            writer.serialize().unwrap_err(),
            crate::Error::WriteError(WriteError::AlreadyFinalized)
        ));
        assert!(writer.add_pixels(300, [ThinPixel::new(0, 1, 1.0)]).is_err());
    }

    // ==================== Spill Tests ====================

    #[test]
    fn test_spill_threshold_moves_pixels_to_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ContactWriterBuilder::default()
            .reference(reference())
            .resolutions([100])
            .block_bin_count(4)
            .spill_threshold(1) // spill after every add
            .build(dir.path().join("x.hct"))
            .unwrap();

        writer
            .add_pixels(100, [ThinPixel::new(0, 1, 1.0), ThinPixel::new(0, 2, 2.0)])
            .unwrap();
        assert_eq!(writer.mem_records, 0, "buffers spilled");
        assert_eq!(writer.scratch.len(), 1);

        writer.add_pixels(100, [ThinPixel::new(0, 1, 3.0)]).unwrap();
        let scratch = writer.scratch.values().next().unwrap();
        assert_eq!(scratch.num_records(), 3);
    }
}
