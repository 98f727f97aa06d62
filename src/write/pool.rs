use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, BTreeMap};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};
use std::thread;

use zstd::zstd_safe;

use crate::error::{Result, WriteError};
use crate::format::{encode_payload, BlockRecord, BlockSpan};

/// Per-matrix statistics accumulated while merging blocks: total raw counts,
/// and for intra-chromosomal matrices the per-diagonal count sums feeding
/// the expected-value curves.
#[derive(Debug, Default)]
pub(crate) struct MergeStats {
    pub sum_counts: f64,
    pub diag_sums: Vec<f64>,
}
impl MergeStats {
    fn fold(&mut self, other: &MergeStats) {
        self.sum_counts += other.sum_counts;
        if other.diag_sums.len() > self.diag_sums.len() {
            self.diag_sums.resize(other.diag_sums.len(), 0.0);
        }
        for (acc, value) in self.diag_sums.iter_mut().zip(&other.diag_sums) {
            *acc += value;
        }
    }
}

/// A compressed block waiting in the reorder queue. Ordered by claim
/// sequence so the drain writes ascending block ids.
struct ReadyBlock {
    seq: usize,
    block_id: u64,
    bytes: Vec<u8>,
}
impl PartialEq for ReadyBlock {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for ReadyBlock {}
impl Ord for ReadyBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}
impl PartialOrd for ReadyBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Output-side state, guarded by one mutex: the bounded reorder heap plus
/// the file cursor. Whichever worker holds the lock drains ready blocks.
struct OutputState {
    heap: BinaryHeap<Reverse<ReadyBlock>>,
    next_seq: usize,
    pos: u64,
    spans: BTreeMap<u64, BlockSpan>,
}

pub(crate) struct PoolConfig {
    pub num_threads: usize,
    pub compression_level: i32,
    pub intra: bool,
}

/// Merges, compresses, and writes one matrix's blocks in parallel.
///
/// Workers claim block ids off a shared counter, read that block's scratch
/// fragments under `read_fragments`'s lock, merge and compress with private
/// contexts, then feed a bounded reorder heap. Blocks land in the file in
/// strictly ascending claim order no matter which worker finishes first; a
/// worker facing a full heap drains ready blocks instead of blocking, so the
/// pipeline cannot deadlock. The first worker error flips a shared flag,
/// everyone unwinds, and the error surfaces to the caller.
pub(crate) fn compress_blocks<F>(
    block_ids: &[u64],
    read_fragments: F,
    file: &File,
    start_pos: u64,
    config: &PoolConfig,
) -> Result<(BTreeMap<u64, BlockSpan>, MergeStats, u64)>
where
    F: Fn(u64) -> Result<Vec<BlockRecord>> + Sync,
{
    let num_threads = if config.num_threads == 0 {
        num_cpus::get()
    } else {
        config.num_threads.min(num_cpus::get())
    }
    .max(1);
    let queue_capacity = 2 * num_threads;

    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<crate::Error>> = Mutex::new(None);
    let stats = Mutex::new(MergeStats::default());
    let output = Mutex::new(OutputState {
        heap: BinaryHeap::new(),
        next_seq: 0,
        pos: start_pos,
        spans: BTreeMap::new(),
    });
    let ready = Condvar::new();

    thread::scope(|scope| {
        for _ in 0..num_threads {
            scope.spawn(|| {
                let outcome = worker(
                    block_ids,
                    &read_fragments,
                    file,
                    config,
                    queue_capacity,
                    &next,
                    &failed,
                    &stats,
                    &output,
                    &ready,
                );
                if let Err(e) = outcome {
                    failed.store(true, AtomicOrdering::SeqCst);
                    let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    ready.notify_all();
                }
            });
        }
    });

    if failed.load(AtomicOrdering::SeqCst) {
        let error = first_error
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(|| WriteError::WorkerFailure("unknown worker error".into()).into());
        return Err(error);
    }

    let output = output.into_inner().unwrap_or_else(|e| e.into_inner());
    debug_assert_eq!(output.next_seq, block_ids.len());
    let stats = stats.into_inner().unwrap_or_else(|e| e.into_inner());
    Ok((output.spans, stats, output.pos))
}

#[allow(clippy::too_many_arguments)]
fn worker<F>(
    block_ids: &[u64],
    read_fragments: &F,
    file: &File,
    config: &PoolConfig,
    queue_capacity: usize,
    next: &AtomicUsize,
    failed: &AtomicBool,
    stats: &Mutex<MergeStats>,
    output: &Mutex<OutputState>,
    ready: &Condvar,
) -> Result<()>
where
    F: Fn(u64) -> Result<Vec<BlockRecord>> + Sync,
{
    let mut cctx = zstd_safe::CCtx::create();
    cctx.set_parameter(zstd_safe::CParameter::CompressionLevel(
        config.compression_level,
    ))
    .map_err(|e| std::io::Error::other(zstd_safe::get_error_name(e)))?;

    loop {
        if failed.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }
        let seq = next.fetch_add(1, AtomicOrdering::SeqCst);
        if seq >= block_ids.len() {
            break;
        }
        let block_id = block_ids[seq];

        // the shared lock covers only the fragment read, never compression
        let mut records = read_fragments(block_id)?;

        records.sort_unstable_by_key(|r| (r.bin1, r.bin2));
        merge_duplicates(&mut records);

        let mut local = MergeStats::default();
        for record in &records {
            let count = f64::from(record.count);
            local.sum_counts += count;
            if config.intra {
                let diagonal = u64::from(record.bin1.abs_diff(record.bin2)) as usize;
                if diagonal >= local.diag_sums.len() {
                    local.diag_sums.resize(diagonal + 1, 0.0);
                }
                local.diag_sums[diagonal] += count;
            }
        }
        stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fold(&local);

        let payload = encode_payload(&records)?;
        let bound = zstd_safe::compress_bound(payload.len());
        let mut bytes = vec![0u8; bound];
        let compressed_len = cctx
            .compress2(bytes.as_mut_slice(), &payload)
            .map_err(|e| std::io::Error::other(zstd_safe::get_error_name(e)))?;
        bytes.truncate(compressed_len);

        enqueue(
            ReadyBlock {
                seq,
                block_id,
                bytes,
            },
            queue_capacity,
            file,
            failed,
            output,
            ready,
        )?;
    }

    // whoever finishes last flushes the stragglers
    let mut state = output.lock().unwrap_or_else(|e| e.into_inner());
    drain_ready(&mut state, file)?;
    ready.notify_all();
    Ok(())
}

/// Admits a block into the bounded reorder heap. The block the drain is
/// waiting on is always admitted regardless of occupancy; otherwise a full
/// heap makes this worker drain ready blocks (it holds the lock anyway)
/// or wait for room.
fn enqueue(
    block: ReadyBlock,
    queue_capacity: usize,
    file: &File,
    failed: &AtomicBool,
    output: &Mutex<OutputState>,
    ready: &Condvar,
) -> Result<()> {
    let mut state = output.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if failed.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }
        if state.heap.len() < queue_capacity || block.seq == state.next_seq {
            state.heap.push(Reverse(block));
            drain_ready(&mut state, file)?;
            ready.notify_all();
            return Ok(());
        }
        // full, and this block is out of order: drain what is ready, then
        // wait for the heap to move
        if drain_ready(&mut state, file)? == 0 {
            state = ready
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Writes every contiguously ready block, in ascending sequence order,
/// recording each one's span. Returns how many blocks were written.
fn drain_ready(state: &mut OutputState, file: &File) -> Result<usize> {
    let mut written = 0;
    while state
        .heap
        .peek()
        .is_some_and(|Reverse(b)| b.seq == state.next_seq)
    {
        let Reverse(block) = state.heap.pop().expect("peeked");
        let mut handle = file;
        handle.seek(SeekFrom::Start(state.pos))?;
        handle.write_all(&block.bytes)?;
        state.spans.insert(
            block.block_id,
            BlockSpan {
                offset: state.pos,
                length: block.bytes.len() as u32,
            },
        );
        state.pos += block.bytes.len() as u64;
        state.next_seq += 1;
        written += 1;
    }
    Ok(written)
}

/// Sums adjacent records with equal `(bin1, bin2)` in place; input sorted.
fn merge_duplicates(records: &mut Vec<BlockRecord>) {
    let mut write = 0;
    for read in 0..records.len() {
        if write > 0
            && records[write - 1].bin1 == records[read].bin1
            && records[write - 1].bin2 == records[read].bin2
        {
            records[write - 1].count += records[read].count;
        } else {
            records[write] = records[read];
            write += 1;
        }
    }
    records.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::decode_payload;
    use std::io::Read;

    fn fragment_source(blocks: Vec<(u64, Vec<BlockRecord>)>) -> impl Fn(u64) -> Result<Vec<BlockRecord>> + Sync {
        move |id| {
            Ok(blocks
                .iter()
                .filter(|(block_id, _)| *block_id == id)
                .flat_map(|(_, records)| records.clone())
                .collect())
        }
    }

    fn read_span(file: &mut File, span: BlockSpan) -> Vec<BlockRecord> {
        use std::io::Seek;
        file.seek(SeekFrom::Start(span.offset)).unwrap();
        let mut raw = vec![0u8; span.length as usize];
        file.read_exact(&mut raw).unwrap();
        let payload = zstd::stream::decode_all(raw.as_slice()).unwrap();
        decode_payload(2, &payload, span.offset).unwrap()
    }

    // ==================== Duplicate Merge Tests ====================

    #[test]
    fn test_merge_duplicates_sums_counts() {
        let mut records = vec![
            BlockRecord { bin1: 0, bin2: 1, count: 1.0 },
            BlockRecord { bin1: 0, bin2: 1, count: 2.5 },
            BlockRecord { bin1: 0, bin2: 2, count: 1.0 },
            BlockRecord { bin1: 0, bin2: 2, count: 1.0 },
            BlockRecord { bin1: 1, bin2: 2, count: 4.0 },
        ];
        merge_duplicates(&mut records);
        assert_eq!(
            records,
            vec![
                BlockRecord { bin1: 0, bin2: 1, count: 3.5 },
                BlockRecord { bin1: 0, bin2: 2, count: 2.0 },
                BlockRecord { bin1: 1, bin2: 2, count: 4.0 },
            ]
        );
    }

    // ==================== Pool Tests ====================

    #[test]
    fn test_blocks_land_in_ascending_id_order() {
        let blocks: Vec<(u64, Vec<BlockRecord>)> = (0..24u64)
            .map(|id| {
                let records = (0..40u32)
                    .map(|i| BlockRecord {
                        bin1: id as u32,
                        bin2: i,
                        count: (i + 1) as f32,
                    })
                    .collect();
                (id, records)
            })
            .collect();
        let ids: Vec<u64> = blocks.iter().map(|(id, _)| *id).collect();

        let file = tempfile::tempfile().unwrap();
        let config = PoolConfig {
            num_threads: 4,
            compression_level: 3,
            intra: false,
        };
        let (spans, stats, end_pos) =
            compress_blocks(&ids, fragment_source(blocks), &file, 0, &config).unwrap();

        assert_eq!(spans.len(), 24);
        // ascending block id implies ascending offset
        let mut last_end = 0;
        for id in &ids {
            let span = spans[id];
            assert_eq!(span.offset, last_end, "block {id} out of order");
            last_end = span.offset + u64::from(span.length);
        }
        assert_eq!(end_pos, last_end);

        let expected_sum: f64 = (1..=40).map(f64::from).sum::<f64>() * 24.0;
        assert!((stats.sum_counts - expected_sum).abs() < 1e-6);
    }

    #[test]
    fn test_blocks_round_trip_through_file() {
        let records = vec![
            BlockRecord { bin1: 3, bin2: 4, count: 2.0 },
            BlockRecord { bin1: 3, bin2: 9, count: 1.0 },
        ];
        let blocks = vec![(5u64, records.clone()), (5u64, records.clone())];

        let mut file = tempfile::tempfile().unwrap();
        let config = PoolConfig {
            num_threads: 2,
            compression_level: 3,
            intra: true,
        };
        let (spans, stats, _) =
            compress_blocks(&[5], fragment_source(blocks), &file, 0, &config).unwrap();

        // duplicate fragments merge into summed records
        let decoded = read_span(&mut file, spans[&5]);
        assert_eq!(
            decoded,
            vec![
                BlockRecord { bin1: 3, bin2: 4, count: 4.0 },
                BlockRecord { bin1: 3, bin2: 9, count: 2.0 },
            ]
        );
        // diagonal sums: distance 1 gets 4.0, distance 6 gets 2.0
        assert!((stats.diag_sums[1] - 4.0).abs() < 1e-9);
        assert!((stats.diag_sums[6] - 2.0).abs() < 1e-9);
        assert!((stats.sum_counts - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_worker_error_aborts_cleanly() {
        let source = |id: u64| -> Result<Vec<BlockRecord>> {
            if id == 3 {
                Err(WriteError::WorkerFailure("scratch read failed".into()).into())
            } else {
                Ok(vec![BlockRecord { bin1: 0, bin2: id as u32, count: 1.0 }])
            }
        };
        let ids: Vec<u64> = (0..8).collect();
        let file = tempfile::tempfile().unwrap();
        let config = PoolConfig {
            num_threads: 3,
            compression_level: 1,
            intra: false,
        };
        let err = compress_blocks(&ids, source, &file, 0, &config).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::WriteError(WriteError::WorkerFailure(_))
        ));
    }

    #[test]
    fn test_single_thread_matches_parallel_layout() {
        let make_blocks = || -> Vec<(u64, Vec<BlockRecord>)> {
            (0..12u64)
                .map(|id| {
                    (
                        id * 3,
                        vec![BlockRecord {
                            bin1: id as u32,
                            bin2: id as u32 + 1,
                            count: 2.0,
                        }],
                    )
                })
                .collect()
        };
        let ids: Vec<u64> = make_blocks().iter().map(|(id, _)| *id).collect();

        let run = |threads: usize| {
            let file = tempfile::tempfile().unwrap();
            let config = PoolConfig {
                num_threads: threads,
                compression_level: 3,
                intra: false,
            };
            compress_blocks(&ids, fragment_source(make_blocks()), &file, 0, &config)
                .unwrap()
                .0
        };
        assert_eq!(run(1), run(4), "layout must not depend on thread count");
    }
}
