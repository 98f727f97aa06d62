use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::{Normalization, Unit};
use crate::error::{FooterError, Result};
use crate::format::header::{read_string, write_string};

/// Sentinel footer offset for a chromosome pair that is present in the master
/// index but recorded zero interactions. Queries against it succeed with an
/// empty result.
pub(crate) const NO_FOOTER_OFFSET: u64 = u64::MAX;

/// Location of one compressed block inside the container body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockSpan {
    pub offset: u64,
    pub length: u32,
}

/// Per-resolution block index of one chromosome pair: the block grid
/// dimensions plus the location of every stored tile.
#[derive(Clone, Debug)]
pub(crate) struct BlockIndex {
    pub unit: Unit,
    pub bin_size: u32,
    /// Total raw counts of this matrix; feeds inter-chromosomal expected values
    pub sum_counts: f64,
    pub block_bin_count: u32,
    pub block_column_count: u32,
    pub blocks: BTreeMap<u64, BlockSpan>,
}

/// Fixed on-disk size of one block index record
const BLOCK_RECORD_SIZE: u64 = 8 + 8 + 4;

/// Serializes every resolution's block index of one chromosome pair.
pub(crate) fn write_pair_footer<W: Write>(writer: &mut W, indexes: &[BlockIndex]) -> Result<()> {
    writer.write_u32::<LittleEndian>(indexes.len() as u32)?;
    for index in indexes {
        writer.write_u8(index.unit.tag())?;
        writer.write_u32::<LittleEndian>(index.bin_size)?;
        writer.write_f64::<LittleEndian>(index.sum_counts)?;
        writer.write_u32::<LittleEndian>(index.block_bin_count)?;
        writer.write_u32::<LittleEndian>(index.block_column_count)?;
        writer.write_u32::<LittleEndian>(index.blocks.len() as u32)?;
        for (block_id, span) in &index.blocks {
            writer.write_u64::<LittleEndian>(*block_id)?;
            writer.write_u64::<LittleEndian>(span.offset)?;
            writer.write_u32::<LittleEndian>(span.length)?;
        }
    }
    Ok(())
}

/// Reads the block index matching `(unit, bin_size)` from a pair footer,
/// seeking past every non-matching resolution's records.
///
/// `Ok(None)` means the pair exists but was not written at this resolution —
/// a valid empty result, not an error.
pub(crate) fn read_block_index<R: Read + Seek>(
    reader: &mut R,
    unit: Unit,
    bin_size: u32,
) -> Result<Option<BlockIndex>> {
    let num_resolutions = reader.read_u32::<LittleEndian>()?;
    for _ in 0..num_resolutions {
        let unit_tag = reader.read_u8()?;
        let entry_bin_size = reader.read_u32::<LittleEndian>()?;
        let sum_counts = reader.read_f64::<LittleEndian>()?;
        let block_bin_count = reader.read_u32::<LittleEndian>()?;
        let block_column_count = reader.read_u32::<LittleEndian>()?;
        let num_blocks = reader.read_u32::<LittleEndian>()?;

        let is_match = Unit::from_tag(unit_tag) == Some(unit) && entry_bin_size == bin_size;
        if !is_match {
            reader.seek(SeekFrom::Current(
                (u64::from(num_blocks) * BLOCK_RECORD_SIZE) as i64,
            ))?;
            continue;
        }

        let mut blocks = BTreeMap::new();
        for _ in 0..num_blocks {
            let block_id = reader.read_u64::<LittleEndian>()?;
            let offset = reader.read_u64::<LittleEndian>()?;
            let length = reader.read_u32::<LittleEndian>()?;
            blocks.insert(block_id, BlockSpan { offset, length });
        }
        return Ok(Some(BlockIndex {
            unit,
            bin_size,
            sum_counts,
            block_bin_count,
            block_column_count,
            blocks,
        }));
    }
    Ok(None)
}

/// The master index: per-pair footer offsets plus the offsets of the
/// expected-value and normalization sections.
#[derive(Clone, Debug, Default)]
pub(crate) struct MasterIndex {
    pub pairs: HashMap<(u32, u32), u64>,
    pub expected_offset: u64,
    pub norm_offset: u64,
}

pub(crate) fn write_master_index<W: Write>(writer: &mut W, master: &MasterIndex) -> Result<()> {
    let mut pairs: Vec<_> = master.pairs.iter().collect();
    pairs.sort_by_key(|(key, _)| **key);

    writer.write_u32::<LittleEndian>(pairs.len() as u32)?;
    for ((chrom1, chrom2), offset) in pairs {
        writer.write_u32::<LittleEndian>(*chrom1)?;
        writer.write_u32::<LittleEndian>(*chrom2)?;
        writer.write_u64::<LittleEndian>(*offset)?;
    }
    writer.write_u64::<LittleEndian>(master.expected_offset)?;
    writer.write_u64::<LittleEndian>(master.norm_offset)?;
    Ok(())
}

pub(crate) fn read_master_index<R: Read>(reader: &mut R) -> Result<MasterIndex> {
    let num_pairs = reader.read_u32::<LittleEndian>()?;
    let mut pairs = HashMap::with_capacity(num_pairs as usize);
    for _ in 0..num_pairs {
        let chrom1 = reader.read_u32::<LittleEndian>()?;
        let chrom2 = reader.read_u32::<LittleEndian>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        pairs.insert((chrom1, chrom2), offset);
    }
    let expected_offset = reader.read_u64::<LittleEndian>()?;
    let norm_offset = reader.read_u64::<LittleEndian>()?;
    Ok(MasterIndex {
        pairs,
        expected_offset,
        norm_offset,
    })
}

/// One user-supplied normalization vector queued for the normalization section.
#[derive(Clone, Debug)]
pub(crate) struct NormVectorEntry {
    pub method: Normalization,
    pub chrom_id: u32,
    pub unit: Unit,
    pub bin_size: u32,
    pub values: Vec<f64>,
}

pub(crate) fn write_norm_section<W: Write>(
    writer: &mut W,
    entries: &[NormVectorEntry],
) -> Result<()> {
    writer.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        write_string(writer, entry.method.name())?;
        writer.write_u32::<LittleEndian>(entry.chrom_id)?;
        writer.write_u8(entry.unit.tag())?;
        writer.write_u32::<LittleEndian>(entry.bin_size)?;
        writer.write_u64::<LittleEndian>(entry.values.len() as u64)?;
        for value in &entry.values {
            writer.write_f64::<LittleEndian>(*value)?;
        }
    }
    Ok(())
}

/// Scans the normalization section for one vector, seeking past the value
/// arrays of every non-matching entry.
///
/// `Ok(None)` is returned when no entry matches; the caller decides whether
/// that is fatal (it is, when the vector was explicitly requested).
pub(crate) fn read_norm_vector<R: Read + Seek>(
    reader: &mut R,
    method: &Normalization,
    chrom_id: u32,
    unit: Unit,
    bin_size: u32,
) -> Result<Option<Vec<f64>>> {
    let num_entries = reader.read_u32::<LittleEndian>()?;
    for _ in 0..num_entries {
        let entry_method = read_string(reader)?;
        let entry_chrom = reader.read_u32::<LittleEndian>()?;
        let entry_unit = reader.read_u8()?;
        let entry_bin_size = reader.read_u32::<LittleEndian>()?;
        let num_values = reader.read_u64::<LittleEndian>()?;

        let is_match = entry_method == method.name()
            && entry_chrom == chrom_id
            && Unit::from_tag(entry_unit) == Some(unit)
            && entry_bin_size == bin_size;
        if !is_match {
            reader.seek(SeekFrom::Current((num_values * 8) as i64))?;
            continue;
        }

        let mut values = Vec::with_capacity(num_values as usize);
        for _ in 0..num_values {
            values.push(reader.read_f64::<LittleEndian>()?);
        }
        return Ok(Some(values));
    }
    Ok(None)
}

/// A per-resolution expected-value curve: one mean count per diagonal offset,
/// with per-chromosome scale factors.
#[derive(Clone, Debug)]
pub(crate) struct ExpectedValues {
    pub unit: Unit,
    pub bin_size: u32,
    pub values: Vec<f64>,
    pub scale_factors: HashMap<u32, f64>,
}

pub(crate) fn write_expected_section<W: Write>(
    writer: &mut W,
    entries: &[ExpectedValues],
) -> Result<()> {
    writer.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        writer.write_u8(entry.unit.tag())?;
        writer.write_u32::<LittleEndian>(entry.bin_size)?;
        writer.write_u64::<LittleEndian>(entry.values.len() as u64)?;
        for value in &entry.values {
            writer.write_f64::<LittleEndian>(*value)?;
        }
        let mut scales: Vec<_> = entry.scale_factors.iter().collect();
        scales.sort_by_key(|(chrom, _)| **chrom);
        writer.write_u32::<LittleEndian>(scales.len() as u32)?;
        for (chrom_id, factor) in scales {
            writer.write_u32::<LittleEndian>(*chrom_id)?;
            writer.write_f64::<LittleEndian>(*factor)?;
        }
    }
    Ok(())
}

/// Scans the expected-value section for `(unit, bin_size)`, seeking past
/// non-matching entries.
pub(crate) fn read_expected_values<R: Read + Seek>(
    reader: &mut R,
    unit: Unit,
    bin_size: u32,
) -> Result<Option<ExpectedValues>> {
    let num_entries = reader.read_u32::<LittleEndian>()?;
    for _ in 0..num_entries {
        let entry_unit = reader.read_u8()?;
        let entry_bin_size = reader.read_u32::<LittleEndian>()?;
        let num_values = reader.read_u64::<LittleEndian>()?;

        let is_match = Unit::from_tag(entry_unit) == Some(unit) && entry_bin_size == bin_size;
        if !is_match {
            reader.seek(SeekFrom::Current((num_values * 8) as i64))?;
            let num_scales = reader.read_u32::<LittleEndian>()?;
            reader.seek(SeekFrom::Current((u64::from(num_scales) * 12) as i64))?;
            continue;
        }

        let mut values = Vec::with_capacity(num_values as usize);
        for _ in 0..num_values {
            values.push(reader.read_f64::<LittleEndian>()?);
        }
        let num_scales = reader.read_u32::<LittleEndian>()?;
        let mut scale_factors = HashMap::with_capacity(num_scales as usize);
        for _ in 0..num_scales {
            let chrom_id = reader.read_u32::<LittleEndian>()?;
            let factor = reader.read_f64::<LittleEndian>()?;
            scale_factors.insert(chrom_id, factor);
        }
        return Ok(Some(ExpectedValues {
            unit,
            bin_size,
            values,
            scale_factors,
        }));
    }
    Ok(None)
}

/// Wraps a low-level parse failure with the pair/offset context required to
/// diagnose a footer problem without re-reading the file.
pub(crate) fn footer_context(
    result: crate::error::Error,
    chrom1: &str,
    chrom2: &str,
    offset: u64,
) -> crate::error::Error {
    match result {
        crate::error::Error::IoError(_) | crate::error::Error::Utf8Error(_) => {
            FooterError::MalformedFooter {
                chrom1: chrom1.to_string(),
                chrom2: chrom2.to_string(),
                offset,
            }
            .into()
        }
        other => other,
    }
}
