use std::fmt;
use std::sync::Arc;

use crate::core::reference::{Chromosome, Reference};
use crate::error::{HeaderError, QueryError, Result};

/// One genomic bin of a [`BinTable`].
///
/// Carries both the table-global id and the chromosome-relative id, plus the
/// resolved half-open coordinate interval.
#[derive(Clone, Debug)]
pub struct Bin {
    chrom: Chromosome,
    id: u64,
    rel_id: u64,
    start: u64,
    end: u64,
}
impl Bin {
    #[must_use]
    pub fn chromosome(&self) -> &Chromosome {
        &self.chrom
    }

    /// Global id, dense and monotonically increasing in catalogue order
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id relative to the first bin of the owning chromosome
    #[must_use]
    pub fn rel_id(&self) -> u64 {
        self.rel_id
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }
}
impl PartialEq for Bin {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.chrom == other.chrom
    }
}
impl Eq for Bin {}
impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom.name(), self.start, self.end)
    }
}

/// A genome-wide bin axis at one resolution.
///
/// Two binning schemes share one contract: `Fixed` tables derive boundaries
/// by division, `Variable` tables carry explicit start/end arrays and search
/// prefix sums. Callers match on nothing; every operation dispatches
/// internally so generic code works over either variant.
#[derive(Clone, Debug)]
pub enum BinTable {
    Fixed(FixedBins),
    Variable(VariableBins),
}

impl BinTable {
    /// Builds a fixed-width table tiling every chromosome with `bin_size` bins
    pub fn fixed(reference: Reference, bin_size: u32) -> Result<Self> {
        Ok(Self::Fixed(FixedBins::new(reference, bin_size)?))
    }

    /// Builds a variable-width table from `(chrom, start, end)` triples.
    ///
    /// Triples must appear in catalogue order and fully tile each chromosome
    /// (first bin starts at 0, bins abut, last bin ends at the chromosome
    /// length).
    pub fn variable<S: AsRef<str>>(
        reference: Reference,
        bins: impl IntoIterator<Item = (S, u64, u64)>,
    ) -> Result<Self> {
        Ok(Self::Variable(VariableBins::new(reference, bins)?))
    }

    #[must_use]
    pub fn reference(&self) -> &Reference {
        match self {
            Self::Fixed(table) => &table.reference,
            Self::Variable(table) => &table.reference,
        }
    }

    /// Constant bin width, if this is a fixed table
    #[must_use]
    pub fn bin_size(&self) -> Option<u32> {
        match self {
            Self::Fixed(table) => Some(table.bin_size),
            Self::Variable(_) => None,
        }
    }

    /// Number of bins addressable through this table
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Fixed(table) => table.size(),
            Self::Variable(table) => table.size(),
        }
    }

    /// Global id of the first bin of this table's address slice
    #[must_use]
    pub fn bin_offset(&self) -> u64 {
        match self {
            Self::Fixed(table) => table.bin_offset(),
            Self::Variable(table) => table.bin_offset(),
        }
    }

    /// Global id of the first bin of `chrom`
    pub fn chrom_offset(&self, chrom: &Chromosome) -> Result<u64> {
        match self {
            Self::Fixed(table) => table.chrom_offset(chrom),
            Self::Variable(table) => table.chrom_offset(chrom),
        }
    }

    /// Resolves the `index`-th bin of this table (0-based, table-local)
    pub fn at(&self, index: u64) -> Result<Bin> {
        match self {
            Self::Fixed(table) => table.at(index),
            Self::Variable(table) => table.at(index),
        }
    }

    /// Resolves the bin containing `pos` on `chrom`
    pub fn at_coord(&self, chrom: &Chromosome, pos: u64) -> Result<Bin> {
        let id = self.map_to_bin_id(chrom, pos)?;
        self.at(id - self.bin_offset())
    }

    /// Maps a genomic coordinate to its global bin id
    pub fn map_to_bin_id(&self, chrom: &Chromosome, pos: u64) -> Result<u64> {
        match self {
            Self::Fixed(table) => table.map_to_bin_id(chrom, pos),
            Self::Variable(table) => table.map_to_bin_id(chrom, pos),
        }
    }

    /// Global-id range `[first, last)` of bins overlapping `[start, end)`
    pub fn find_overlap(&self, chrom: &Chromosome, start: u64, end: u64) -> Result<(u64, u64)> {
        match self {
            Self::Fixed(table) => table.find_overlap(chrom, start, end),
            Self::Variable(table) => table.find_overlap(chrom, start, end),
        }
    }

    /// Restricts the table to a single chromosome, re-basing local indices to
    /// that chromosome's first bin while keeping global ids intact
    pub fn subset(&self, chrom: &Chromosome) -> Result<BinTable> {
        match self {
            Self::Fixed(table) => Ok(Self::Fixed(table.subset(chrom)?)),
            Self::Variable(table) => Ok(Self::Variable(table.subset(chrom)?)),
        }
    }

    /// Random-access iterator over all bins of the table
    pub fn iter(&self) -> BinIter<'_> {
        BinIter {
            table: self,
            index: 0,
            size: self.size(),
        }
    }
}

pub struct BinIter<'a> {
    table: &'a BinTable,
    index: u64,
    size: u64,
}
impl Iterator for BinIter<'_> {
    type Item = Bin;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.size {
            None
        } else {
            // index is in range, at() cannot fail
            let bin = self.table.at(self.index).ok()?;
            self.index += 1;
            Some(bin)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.size - self.index) as usize;
        (remaining, Some(remaining))
    }
}

/// Fixed-width binning: boundaries are pure arithmetic, id lookup is a
/// binary search over per-chromosome cumulative bin counts.
#[derive(Clone, Debug)]
pub struct FixedBins {
    reference: Reference,
    bin_size: u32,
    /// prefix[c] = number of bins before chromosome c; len = n_chroms + 1
    prefix: Arc<Vec<u64>>,
    /// Catalogue slice covered by this table
    chrom_lo: u32,
    chrom_hi: u32,
}
impl FixedBins {
    fn new(reference: Reference, bin_size: u32) -> Result<Self> {
        if bin_size == 0 {
            return Err(HeaderError::InvalidResolutions("zero bin size".to_string()).into());
        }
        let mut prefix = Vec::with_capacity(reference.len() + 1);
        let mut total = 0u64;
        prefix.push(0);
        for chrom in reference.iter() {
            total += chrom.num_bins(bin_size);
            prefix.push(total);
        }
        let chrom_hi = reference.len() as u32;
        Ok(Self {
            reference,
            bin_size,
            prefix: Arc::new(prefix),
            chrom_lo: 0,
            chrom_hi,
        })
    }

    fn size(&self) -> u64 {
        self.prefix[self.chrom_hi as usize] - self.prefix[self.chrom_lo as usize]
    }

    fn bin_offset(&self) -> u64 {
        self.prefix[self.chrom_lo as usize]
    }

    fn check_chrom(&self, chrom: &Chromosome) -> Result<()> {
        if chrom.id() < self.chrom_lo || chrom.id() >= self.chrom_hi {
            return Err(QueryError::UnknownChromosome(chrom.name().to_string()).into());
        }
        Ok(())
    }

    fn chrom_offset(&self, chrom: &Chromosome) -> Result<u64> {
        self.check_chrom(chrom)?;
        Ok(self.prefix[chrom.id() as usize])
    }

    fn at(&self, index: u64) -> Result<Bin> {
        if index >= self.size() {
            return Err(QueryError::BinOutOfRange {
                requested_id: index,
                size: self.size(),
            }
            .into());
        }
        let global = index + self.bin_offset();

        // O(log C): locate the owning chromosome in the prefix array
        let slice = &self.prefix[self.chrom_lo as usize + 1..=self.chrom_hi as usize];
        let chrom_id = self.chrom_lo + slice.partition_point(|p| *p <= global) as u32;
        let chrom = self.reference.chromosome(chrom_id).expect("id in slice");

        let rel = global - self.prefix[chrom_id as usize];
        let start = rel * u64::from(self.bin_size);
        let end = (start + u64::from(self.bin_size)).min(chrom.length());
        Ok(Bin {
            chrom: chrom.clone(),
            id: global,
            rel_id: rel,
            start,
            end,
        })
    }

    fn map_to_bin_id(&self, chrom: &Chromosome, pos: u64) -> Result<u64> {
        self.check_chrom(chrom)?;
        if pos >= chrom.length() {
            return Err(QueryError::RangeOutOfBounds {
                chrom: chrom.name().to_string(),
                end: pos,
                length: chrom.length(),
            }
            .into());
        }
        Ok(self.prefix[chrom.id() as usize] + pos / u64::from(self.bin_size))
    }

    fn find_overlap(&self, chrom: &Chromosome, start: u64, end: u64) -> Result<(u64, u64)> {
        self.check_chrom(chrom)?;
        let base = self.prefix[chrom.id() as usize];
        if start >= end || start >= chrom.length() {
            return Ok((base, base));
        }
        let end = end.min(chrom.length());
        let first = base + start / u64::from(self.bin_size);
        let last = base + end.div_ceil(u64::from(self.bin_size));
        Ok((first, last))
    }

    fn subset(&self, chrom: &Chromosome) -> Result<Self> {
        self.check_chrom(chrom)?;
        Ok(Self {
            reference: self.reference.clone(),
            bin_size: self.bin_size,
            prefix: Arc::clone(&self.prefix),
            chrom_lo: chrom.id(),
            chrom_hi: chrom.id() + 1,
        })
    }
}

/// Variable-width binning: explicit start/end arrays per chromosome,
/// position lookup by prefix-sum binary search over end coordinates.
#[derive(Clone, Debug)]
pub struct VariableBins {
    reference: Reference,
    /// Chromosome-relative bin boundaries, concatenated in catalogue order
    starts: Arc<Vec<u64>>,
    ends: Arc<Vec<u64>>,
    /// prefix[c] = number of bins before chromosome c; len = n_chroms + 1
    prefix: Arc<Vec<u64>>,
    chrom_lo: u32,
    chrom_hi: u32,
}
impl VariableBins {
    fn new<S: AsRef<str>>(
        reference: Reference,
        bins: impl IntoIterator<Item = (S, u64, u64)>,
    ) -> Result<Self> {
        let mut starts = Vec::new();
        let mut ends = Vec::new();
        let mut prefix = vec![0u64];
        let mut current: Option<u32> = None;

        let invalid =
            |msg: String| -> crate::Error { HeaderError::InvalidChromosome(msg).into() };

        for (name, start, end) in bins {
            let chrom = reference.require(name.as_ref())?;
            match current {
                Some(id) if id == chrom.id() => {}
                Some(id) => {
                    // close out the previous chromosome before advancing
                    let prev = close_chromosome(&reference, id, &ends, &prefix)?;
                    if chrom.id() != id + 1 {
                        return Err(invalid(format!(
                            "bins for {} do not follow catalogue order",
                            chrom.name()
                        )));
                    }
                    prefix.push(prev);
                    current = Some(chrom.id());
                }
                None => {
                    if chrom.id() != 0 {
                        return Err(invalid(format!(
                            "bins must start at the first chromosome, got {}",
                            chrom.name()
                        )));
                    }
                    current = Some(0);
                }
            }
            let expected_start = match prefix.last() {
                Some(base) if starts.len() as u64 == *base => 0,
                _ => *ends.last().unwrap_or(&0),
            };
            if start != expected_start || end <= start || end > chrom.length() {
                return Err(invalid(format!(
                    "bin [{start}, {end}) does not tile {}",
                    chrom.name()
                )));
            }
            starts.push(start);
            ends.push(end);
        }

        match current {
            Some(id) if id as usize == reference.len() - 1 => {
                let total = close_chromosome(&reference, id, &ends, &prefix)?;
                prefix.push(total);
            }
            _ => return Err(invalid("bins do not cover every chromosome".to_string())),
        }

        let chrom_hi = reference.len() as u32;
        Ok(Self {
            reference,
            starts: Arc::new(starts),
            ends: Arc::new(ends),
            prefix: Arc::new(prefix),
            chrom_lo: 0,
            chrom_hi,
        })
    }

    fn size(&self) -> u64 {
        self.prefix[self.chrom_hi as usize] - self.prefix[self.chrom_lo as usize]
    }

    fn bin_offset(&self) -> u64 {
        self.prefix[self.chrom_lo as usize]
    }

    fn check_chrom(&self, chrom: &Chromosome) -> Result<()> {
        if chrom.id() < self.chrom_lo || chrom.id() >= self.chrom_hi {
            return Err(QueryError::UnknownChromosome(chrom.name().to_string()).into());
        }
        Ok(())
    }

    fn chrom_offset(&self, chrom: &Chromosome) -> Result<u64> {
        self.check_chrom(chrom)?;
        Ok(self.prefix[chrom.id() as usize])
    }

    fn at(&self, index: u64) -> Result<Bin> {
        if index >= self.size() {
            return Err(QueryError::BinOutOfRange {
                requested_id: index,
                size: self.size(),
            }
            .into());
        }
        let global = index + self.bin_offset();
        let slice = &self.prefix[self.chrom_lo as usize + 1..=self.chrom_hi as usize];
        let chrom_id = self.chrom_lo + slice.partition_point(|p| *p <= global) as u32;
        let chrom = self.reference.chromosome(chrom_id).expect("id in slice");
        let rel = global - self.prefix[chrom_id as usize];
        Ok(Bin {
            chrom: chrom.clone(),
            id: global,
            rel_id: rel,
            start: self.starts[global as usize],
            end: self.ends[global as usize],
        })
    }

    fn map_to_bin_id(&self, chrom: &Chromosome, pos: u64) -> Result<u64> {
        self.check_chrom(chrom)?;
        if pos >= chrom.length() {
            return Err(QueryError::RangeOutOfBounds {
                chrom: chrom.name().to_string(),
                end: pos,
                length: chrom.length(),
            }
            .into());
        }
        let base = self.prefix[chrom.id() as usize] as usize;
        let top = self.prefix[chrom.id() as usize + 1] as usize;
        let idx = self.ends[base..top].partition_point(|e| *e <= pos);
        Ok((base + idx) as u64)
    }

    fn find_overlap(&self, chrom: &Chromosome, start: u64, end: u64) -> Result<(u64, u64)> {
        self.check_chrom(chrom)?;
        let base = self.prefix[chrom.id() as usize] as usize;
        let top = self.prefix[chrom.id() as usize + 1] as usize;
        if start >= end || start >= chrom.length() {
            return Ok((base as u64, base as u64));
        }
        let first = base + self.ends[base..top].partition_point(|e| *e <= start);
        let last = base + self.starts[base..top].partition_point(|s| *s < end);
        Ok((first as u64, last as u64))
    }

    fn subset(&self, chrom: &Chromosome) -> Result<Self> {
        self.check_chrom(chrom)?;
        Ok(Self {
            reference: self.reference.clone(),
            starts: Arc::clone(&self.starts),
            ends: Arc::clone(&self.ends),
            prefix: Arc::clone(&self.prefix),
            chrom_lo: chrom.id(),
            chrom_hi: chrom.id() + 1,
        })
    }
}

/// Verifies the last bin of a chromosome reaches its full length and returns
/// the running bin count.
fn close_chromosome(
    reference: &Reference,
    chrom_id: u32,
    ends: &[u64],
    prefix: &[u64],
) -> Result<u64> {
    let chrom = reference.chromosome(chrom_id).expect("id in catalogue");
    let count = ends.len() as u64;
    if count == *prefix.last().unwrap_or(&0) || *ends.last().unwrap() != chrom.length() {
        return Err(HeaderError::InvalidChromosome(format!(
            "bins do not tile {} to its full length",
            chrom.name()
        ))
        .into());
    }
    Ok(count)
}
