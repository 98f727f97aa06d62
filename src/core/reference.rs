use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{HeaderError, QueryError, Result};

/// A single chromosome in the catalogue.
///
/// The id is the chromosome's position in the catalogue and doubles as its
/// sort key; two chromosomes from the same [`Reference`] compare by id alone.
#[derive(Clone, Debug, Eq)]
pub struct Chromosome {
    id: u32,
    name: Arc<str>,
    length: u64,
}
impl Chromosome {
    pub(crate) fn new(id: u32, name: &str, length: u64) -> Self {
        Self {
            id,
            name: Arc::from(name),
            length,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in base pairs
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Number of fixed-width bins of `bin_size` needed to tile this chromosome
    #[must_use]
    pub fn num_bins(&self, bin_size: u32) -> u64 {
        self.length.div_ceil(u64::from(bin_size))
    }
}
impl PartialEq for Chromosome {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Ord for Chromosome {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}
impl PartialOrd for Chromosome {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An ordered, immutable catalogue of chromosomes.
///
/// Cheap to clone; the catalogue is shared behind an `Arc` so bin tables and
/// open file handles can hold it without copying.
#[derive(Clone, Debug)]
pub struct Reference {
    inner: Arc<ReferenceInner>,
}

#[derive(Debug)]
struct ReferenceInner {
    chromosomes: Vec<Chromosome>,
    by_name: HashMap<String, u32>,
}

impl Reference {
    /// Builds a catalogue from `(name, length)` pairs in order.
    ///
    /// Ids are assigned by position. Fails on empty input, duplicate names,
    /// or zero-length chromosomes.
    pub fn new<S: AsRef<str>>(chromosomes: impl IntoIterator<Item = (S, u64)>) -> Result<Self> {
        let mut catalogue = Vec::new();
        let mut by_name = HashMap::new();
        for (name, length) in chromosomes {
            let name = name.as_ref();
            if length == 0 {
                return Err(
                    HeaderError::InvalidChromosome(format!("{name} has zero length")).into(),
                );
            }
            let id = catalogue.len() as u32;
            if by_name.insert(name.to_string(), id).is_some() {
                return Err(HeaderError::InvalidChromosome(format!("duplicate name {name}")).into());
            }
            catalogue.push(Chromosome::new(id, name, length));
        }
        if catalogue.is_empty() {
            return Err(HeaderError::InvalidChromosome("empty catalogue".to_string()).into());
        }
        Ok(Self {
            inner: Arc::new(ReferenceInner {
                chromosomes: catalogue,
                by_name,
            }),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.chromosomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.chromosomes.is_empty()
    }

    #[must_use]
    pub fn chromosome(&self, id: u32) -> Option<&Chromosome> {
        self.inner.chromosomes.get(id as usize)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Chromosome> {
        self.inner
            .by_name
            .get(name)
            .map(|id| &self.inner.chromosomes[*id as usize])
    }

    /// Resolves a name, failing with `UnknownChromosome` when absent
    pub fn require(&self, name: &str) -> Result<&Chromosome> {
        self.by_name(name)
            .ok_or_else(|| QueryError::UnknownChromosome(name.to_string()).into())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chromosome> {
        self.inner.chromosomes.iter()
    }
}

/// A half-open genomic interval `[start, end)` on a named chromosome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenomicRange {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}
impl GenomicRange {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            end,
        }
    }

    /// The full extent of a chromosome
    pub fn whole(chrom: &Chromosome) -> Self {
        Self {
            chrom: chrom.name().to_string(),
            start: 0,
            end: chrom.length(),
        }
    }

    /// Validates the interval against the catalogue and resolves the chromosome
    pub(crate) fn resolve<'r>(&self, reference: &'r Reference) -> Result<&'r Chromosome> {
        let chrom = reference.require(&self.chrom)?;
        if self.start >= self.end {
            return Err(QueryError::InvalidRange {
                chrom: self.chrom.clone(),
                start: self.start,
                end: self.end,
            }
            .into());
        }
        if self.end > chrom.length() {
            return Err(QueryError::RangeOutOfBounds {
                chrom: self.chrom.clone(),
                end: self.end,
                length: chrom.length(),
            }
            .into());
        }
        Ok(chrom)
    }
}
impl fmt::Display for GenomicRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_chroms() -> Reference {
        Reference::new([("chr1", 1000), ("chr2", 500)]).unwrap()
    }

    // ==================== Catalogue Tests ====================

    #[test]
    fn test_ids_follow_catalogue_order() {
        let reference = two_chroms();
        assert_eq!(reference.len(), 2);
        assert_eq!(reference.chromosome(0).unwrap().name(), "chr1");
        assert_eq!(reference.chromosome(1).unwrap().name(), "chr2");
        assert!(reference.chromosome(0).unwrap() < reference.chromosome(1).unwrap());
    }

    #[test]
    fn test_lookup_by_name() {
        let reference = two_chroms();
        assert_eq!(reference.by_name("chr2").unwrap().length(), 500);
        assert!(reference.by_name("chrX").is_none());
        assert!(reference.require("chrX").is_err());
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        assert!(Reference::new([("chr1", 100), ("chr1", 200)]).is_err());
        assert!(Reference::new(Vec::<(&str, u64)>::new()).is_err());
        assert!(Reference::new([("chr1", 0)]).is_err());
    }

    #[test]
    fn test_num_bins_rounds_up() {
        let reference = two_chroms();
        assert_eq!(reference.chromosome(0).unwrap().num_bins(300), 4);
        assert_eq!(reference.chromosome(1).unwrap().num_bins(300), 2);
        assert_eq!(reference.chromosome(1).unwrap().num_bins(500), 1);
    }

    // ==================== Range Tests ====================

    #[test]
    fn test_range_resolution() {
        let reference = two_chroms();
        let range = GenomicRange::new("chr1", 0, 100);
        assert_eq!(range.resolve(&reference).unwrap().id(), 0);

        let inverted = GenomicRange::new("chr1", 100, 100);
        assert!(inverted.resolve(&reference).is_err());

        let oob = GenomicRange::new("chr2", 0, 501);
        assert!(oob.resolve(&reference).is_err());
    }

    #[test]
    fn test_range_display() {
        let range = GenomicRange::new("chr1", 50, 150);
        assert_eq!(format!("{}", range), "chr1:50-150");
    }
}
