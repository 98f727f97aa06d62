use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::format::BlockRecord;

/// One spilled run of records for a block
#[derive(Clone, Copy, Debug)]
struct Fragment {
    offset: u64,
    count: u32,
}

/// Bytes of one serialized scratch record
const SCRATCH_RECORD_SIZE: u64 = 4 + 4 + 4;

/// Append-only spill file holding one `(chromosome pair, resolution)`
/// matrix's pixels until finalize.
///
/// Records arrive in arbitrary order and arbitrary batches; each append
/// becomes a fragment, and a block's fragments are stitched back together at
/// merge time. The backing file is an anonymous tempfile reclaimed on drop.
pub(crate) struct ScratchFile {
    file: File,
    len: u64,
    fragments: HashMap<u64, Vec<Fragment>>,
    num_records: u64,
}

impl ScratchFile {
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            len: 0,
            fragments: HashMap::new(),
            num_records: 0,
        })
    }

    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// Sorted ids of every block with at least one fragment
    #[must_use]
    pub fn block_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.fragments.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Spills one batch of records for `block_id`
    pub fn append(&mut self, block_id: u64, records: &[BlockRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let offset = self.len;
        let mut writer = BufWriter::new(&self.file);
        writer.seek(SeekFrom::Start(offset))?;
        for record in records {
            writer.write_u32::<LittleEndian>(record.bin1)?;
            writer.write_u32::<LittleEndian>(record.bin2)?;
            writer.write_f32::<LittleEndian>(record.count)?;
        }
        writer.flush()?;

        self.fragments.entry(block_id).or_default().push(Fragment {
            offset,
            count: records.len() as u32,
        });
        self.len += records.len() as u64 * SCRATCH_RECORD_SIZE;
        self.num_records += records.len() as u64;
        Ok(())
    }

    /// Reads every fragment of `block_id` back, in spill order.
    ///
    /// Merge workers call this under the shared scratch mutex; sorting and
    /// duplicate-summing happen outside the lock.
    pub fn read_block(&self, block_id: u64) -> Result<Vec<BlockRecord>> {
        let Some(fragments) = self.fragments.get(&block_id) else {
            return Ok(Vec::new());
        };
        let total: usize = fragments.iter().map(|f| f.count as usize).sum();
        let mut records = Vec::with_capacity(total);

        let mut reader = BufReader::new(&self.file);
        for fragment in fragments {
            reader.seek(SeekFrom::Start(fragment.offset))?;
            for _ in 0..fragment.count {
                let bin1 = reader.read_u32::<LittleEndian>()?;
                let bin2 = reader.read_u32::<LittleEndian>()?;
                let count = reader.read_f32::<LittleEndian>()?;
                records.push(BlockRecord { bin1, bin2, count });
            }
        }
        Ok(records)
    }
}
