use std::io::{self, Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BlockError, Result};

/// Sparse list-of-rows encoding
const BLOCK_TYPE_SPARSE: u8 = 1;
/// Dense rectangular tile with sentinel-marked absent cells
const BLOCK_TYPE_DENSE: u8 = 2;

/// Dense-tile sentinel for an absent cell when counts are 16-bit
const DENSE_ABSENT_I16: i16 = i16::MIN;

/// One decoded wire record. Bin ids are chromosome-relative.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BlockRecord {
    pub bin1: u32,
    pub bin2: u32,
    pub count: f32,
}

/// Index fields are written 16- or 32-bit depending on a per-block flag; the
/// two widths are monomorphized through this trait so each decode loop stays
/// branch-free.
trait WireIndex {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<u32>;
    fn write<W: Write>(writer: &mut W, value: u32) -> io::Result<()>;
}

struct ShortIndex;
impl WireIndex for ShortIndex {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
        cursor.read_u16::<LittleEndian>().map(u32::from)
    }
    fn write<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(value as u16)
    }
}

struct WideIndex;
impl WireIndex for WideIndex {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
        cursor.read_u32::<LittleEndian>()
    }
    fn write<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(value)
    }
}

/// Counts are 16-bit integers or 32-bit floats depending on a per-block flag.
trait WireCount {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<f32>;
    /// Dense-tile cell read; `None` marks an absent cell
    fn read_cell(cursor: &mut Cursor<&[u8]>) -> io::Result<Option<f32>>;
    fn write<W: Write>(writer: &mut W, value: f32) -> io::Result<()>;
    fn write_absent<W: Write>(writer: &mut W) -> io::Result<()>;
}

struct ShortCount;
impl WireCount for ShortCount {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<f32> {
        cursor.read_i16::<LittleEndian>().map(f32::from)
    }
    fn read_cell(cursor: &mut Cursor<&[u8]>) -> io::Result<Option<f32>> {
        let raw = cursor.read_i16::<LittleEndian>()?;
        if raw == DENSE_ABSENT_I16 {
            Ok(None)
        } else {
            Ok(Some(f32::from(raw)))
        }
    }
    fn write<W: Write>(writer: &mut W, value: f32) -> io::Result<()> {
        writer.write_i16::<LittleEndian>(value as i16)
    }
    fn write_absent<W: Write>(writer: &mut W) -> io::Result<()> {
        writer.write_i16::<LittleEndian>(DENSE_ABSENT_I16)
    }
}

struct FloatCount;
impl WireCount for FloatCount {
    fn read(cursor: &mut Cursor<&[u8]>) -> io::Result<f32> {
        cursor.read_f32::<LittleEndian>()
    }
    fn read_cell(cursor: &mut Cursor<&[u8]>) -> io::Result<Option<f32>> {
        let raw = cursor.read_f32::<LittleEndian>()?;
        if raw.is_nan() {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }
    fn write<W: Write>(writer: &mut W, value: f32) -> io::Result<()> {
        writer.write_f32::<LittleEndian>(value)
    }
    fn write_absent<W: Write>(writer: &mut W) -> io::Result<()> {
        writer.write_f32::<LittleEndian>(f32::NAN)
    }
}

fn decode_sparse<I1: WireIndex, I2: WireIndex, C: WireCount>(
    cursor: &mut Cursor<&[u8]>,
    bin1_offset: u32,
    bin2_offset: u32,
    out: &mut Vec<BlockRecord>,
) -> io::Result<()> {
    let row_count = I1::read(cursor)?;
    for _ in 0..row_count {
        let bin1 = bin1_offset + I1::read(cursor)?;
        let col_count = I2::read(cursor)?;
        for _ in 0..col_count {
            let bin2 = bin2_offset + I2::read(cursor)?;
            let count = C::read(cursor)?;
            out.push(BlockRecord { bin1, bin2, count });
        }
    }
    Ok(())
}

fn decode_dense<C: WireCount>(
    cursor: &mut Cursor<&[u8]>,
    bin1_offset: u32,
    bin2_offset: u32,
    out: &mut Vec<BlockRecord>,
) -> io::Result<()> {
    let num_cells = cursor.read_u32::<LittleEndian>()?;
    let width = u32::from(cursor.read_u16::<LittleEndian>()?);
    if width == 0 && num_cells > 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "dense tile with zero width",
        ));
    }
    for i in 0..num_cells {
        let row = i / width;
        let col = i - row * width;
        if let Some(count) = C::read_cell(cursor)? {
            out.push(BlockRecord {
                bin1: bin1_offset + row,
                bin2: bin2_offset + col,
                count,
            });
        }
    }
    Ok(())
}

/// Decodes a decompressed block payload into wire records.
///
/// `offset` is the block's file offset, carried along for error context only.
/// Version-1 payloads are plain `(u32, u32, f32)` triples; version-2 payloads
/// dispatch over the width flags and block type described in the header.
pub(crate) fn decode_payload(version: u8, data: &[u8], offset: u64) -> Result<Vec<BlockRecord>> {
    let truncated = |_: io::Error| BlockError::TruncatedPayload {
        offset,
        len: data.len(),
    };

    let mut cursor = Cursor::new(data);
    let num_records = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let mut records = Vec::with_capacity(num_records);

    if version < 2 {
        for _ in 0..num_records {
            let bin1 = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let bin2 = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let count = cursor.read_f32::<LittleEndian>().map_err(truncated)?;
            records.push(BlockRecord { bin1, bin2, count });
        }
        return Ok(records);
    }

    let bin1_offset = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let bin2_offset = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let float_count = cursor.read_u8().map_err(truncated)? != 0;
    let wide_bin1 = cursor.read_u8().map_err(truncated)? != 0;
    let wide_bin2 = cursor.read_u8().map_err(truncated)? != 0;
    let block_type = cursor.read_u8().map_err(truncated)?;

    match block_type {
        BLOCK_TYPE_SPARSE => match (wide_bin1, wide_bin2, float_count) {
            (false, false, false) => {
                decode_sparse::<ShortIndex, ShortIndex, ShortCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (false, false, true) => {
                decode_sparse::<ShortIndex, ShortIndex, FloatCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (false, true, false) => {
                decode_sparse::<ShortIndex, WideIndex, ShortCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (false, true, true) => {
                decode_sparse::<ShortIndex, WideIndex, FloatCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (true, false, false) => {
                decode_sparse::<WideIndex, ShortIndex, ShortCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (true, false, true) => {
                decode_sparse::<WideIndex, ShortIndex, FloatCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (true, true, false) => {
                decode_sparse::<WideIndex, WideIndex, ShortCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
            (true, true, true) => {
                decode_sparse::<WideIndex, WideIndex, FloatCount>(
                    &mut cursor,
                    bin1_offset,
                    bin2_offset,
                    &mut records,
                )
            }
        }
        .map_err(truncated)?,
        BLOCK_TYPE_DENSE => if float_count {
            decode_dense::<FloatCount>(&mut cursor, bin1_offset, bin2_offset, &mut records)
        } else {
            decode_dense::<ShortCount>(&mut cursor, bin1_offset, bin2_offset, &mut records)
        }
        .map_err(truncated)?,
        tag => return Err(BlockError::UnknownBlockType { tag, offset }.into()),
    }

    if records.len() != num_records {
        return Err(BlockError::RecordCountMismatch {
            expected: num_records,
            found: records.len(),
        }
        .into());
    }
    Ok(records)
}

fn encode_sparse<I1: WireIndex, I2: WireIndex, C: WireCount>(
    writer: &mut Vec<u8>,
    records: &[BlockRecord],
    bin1_offset: u32,
    bin2_offset: u32,
) -> io::Result<()> {
    // count distinct rows first; the input is sorted by (bin1, bin2)
    let row_count = records
        .iter()
        .fold((0u32, None), |(n, prev), r| {
            if prev == Some(r.bin1) {
                (n, prev)
            } else {
                (n + 1, Some(r.bin1))
            }
        })
        .0;
    I1::write(writer, row_count)?;

    let mut i = 0;
    while i < records.len() {
        let bin1 = records[i].bin1;
        let row_end = i + records[i..].partition_point(|r| r.bin1 == bin1);
        I1::write(writer, bin1 - bin1_offset)?;
        I2::write(writer, (row_end - i) as u32)?;
        for record in &records[i..row_end] {
            I2::write(writer, record.bin2 - bin2_offset)?;
            C::write(writer, record.count)?;
        }
        i = row_end;
    }
    Ok(())
}

fn encode_dense<C: WireCount>(
    writer: &mut Vec<u8>,
    records: &[BlockRecord],
    bin1_offset: u32,
    bin2_offset: u32,
    width: u32,
    num_cells: u32,
) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(num_cells)?;
    writer.write_u16::<LittleEndian>(width as u16)?;
    let mut next = 0u32;
    for record in records {
        let cell = (record.bin1 - bin1_offset) * width + (record.bin2 - bin2_offset);
        for _ in next..cell {
            C::write_absent(writer)?;
        }
        C::write(writer, record.count)?;
        next = cell + 1;
    }
    for _ in next..num_cells {
        C::write_absent(writer)?;
    }
    Ok(())
}

/// Encodes records (sorted by `(bin1, bin2)`, non-empty) into a version-2
/// payload, choosing index widths, count kind, and sparse-vs-dense layout
/// from the data itself.
pub(crate) fn encode_payload(records: &[BlockRecord]) -> Result<Vec<u8>> {
    debug_assert!(!records.is_empty());
    debug_assert!(records.windows(2).all(|w| (w[0].bin1, w[0].bin2) <= (w[1].bin1, w[1].bin2)));

    let bin1_offset = records.iter().map(|r| r.bin1).min().unwrap_or(0);
    let bin2_offset = records.iter().map(|r| r.bin2).min().unwrap_or(0);
    let bin1_max = records.iter().map(|r| r.bin1).max().unwrap_or(0);
    let bin2_max = records.iter().map(|r| r.bin2).max().unwrap_or(0);

    let rows_span = u64::from(bin1_max - bin1_offset) + 1;
    let cols_span = u64::from(bin2_max - bin2_offset) + 1;

    // a row's column count shares bin2's width, so it constrains the flag too
    let max_row_len = {
        let mut max = 0usize;
        let mut i = 0;
        while i < records.len() {
            let bin1 = records[i].bin1;
            let row_end = i + records[i..].partition_point(|r| r.bin1 == bin1);
            max = max.max(row_end - i);
            i = row_end;
        }
        max
    };

    let wide_bin1 = rows_span > u64::from(u16::MAX);
    let wide_bin2 = cols_span > u64::from(u16::MAX) || max_row_len > usize::from(u16::MAX);
    // the dense sentinel claims i16::MIN, so the usable short range stops one above it
    let float_count = records.iter().any(|r| {
        r.count.fract() != 0.0
            || r.count > f32::from(i16::MAX)
            || r.count <= f32::from(i16::MIN)
    });

    // dense tiles win once at least half the rectangle is occupied
    let area = rows_span * cols_span;
    let dense = area <= 2 * records.len() as u64
        && cols_span <= u64::from(u16::MAX)
        && area <= u64::from(u32::MAX);

    let mut payload = Vec::with_capacity(16 + records.len() * 12);
    payload.write_u32::<LittleEndian>(records.len() as u32)?;
    payload.write_u32::<LittleEndian>(bin1_offset)?;
    payload.write_u32::<LittleEndian>(bin2_offset)?;
    payload.write_u8(u8::from(float_count))?;
    payload.write_u8(u8::from(wide_bin1))?;
    payload.write_u8(u8::from(wide_bin2))?;
    payload.write_u8(if dense { BLOCK_TYPE_DENSE } else { BLOCK_TYPE_SPARSE })?;

    if dense {
        let width = cols_span as u32;
        let num_cells = area as u32;
        if float_count {
            encode_dense::<FloatCount>(&mut payload, records, bin1_offset, bin2_offset, width, num_cells)?;
        } else {
            encode_dense::<ShortCount>(&mut payload, records, bin1_offset, bin2_offset, width, num_cells)?;
        }
        return Ok(payload);
    }

    match (wide_bin1, wide_bin2, float_count) {
        (false, false, false) => {
            encode_sparse::<ShortIndex, ShortIndex, ShortCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (false, false, true) => {
            encode_sparse::<ShortIndex, ShortIndex, FloatCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (false, true, false) => {
            encode_sparse::<ShortIndex, WideIndex, ShortCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (false, true, true) => {
            encode_sparse::<ShortIndex, WideIndex, FloatCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (true, false, false) => {
            encode_sparse::<WideIndex, ShortIndex, ShortCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (true, false, true) => {
            encode_sparse::<WideIndex, ShortIndex, FloatCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (true, true, false) => {
            encode_sparse::<WideIndex, WideIndex, ShortCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
        (true, true, true) => {
            encode_sparse::<WideIndex, WideIndex, FloatCount>(&mut payload, records, bin1_offset, bin2_offset)?;
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort(mut records: Vec<BlockRecord>) -> Vec<BlockRecord> {
        records.sort_by_key(|r| (r.bin1, r.bin2));
        records
    }

    fn round_trip(records: Vec<BlockRecord>) -> Vec<BlockRecord> {
        let sorted = sort(records);
        let payload = encode_payload(&sorted).unwrap();
        let mut decoded = decode_payload(2, &payload, 0).unwrap();
        decoded.sort_by_key(|r| (r.bin1, r.bin2));
        assert_eq!(decoded, sorted);
        decoded
    }

    // ==================== Sparse Encoding Tests ====================

    #[test]
    fn test_sparse_short_everything() {
        let records = vec![
            BlockRecord { bin1: 10, bin2: 10, count: 3.0 },
            BlockRecord { bin1: 10, bin2: 12, count: 1.0 },
            BlockRecord { bin1: 1000, bin2: 11, count: 7.0 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        // flags: integer counts, short ids, sparse type
        assert_eq!(&payload[12..16], &[0, 0, 0, BLOCK_TYPE_SPARSE]);
        round_trip(records);
    }

    #[test]
    fn test_sparse_wide_bin1() {
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 2.0 },
            BlockRecord { bin1: 100_000, bin2: 1, count: 4.0 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(&payload[12..16], &[0, 1, 0, BLOCK_TYPE_SPARSE]);
        round_trip(records);
    }

    #[test]
    fn test_sparse_wide_bin2() {
        let records = vec![
            BlockRecord { bin1: 5, bin2: 0, count: 2.0 },
            BlockRecord { bin1: 5, bin2: 90_000, count: 4.0 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(&payload[12..16], &[0, 0, 1, BLOCK_TYPE_SPARSE]);
        round_trip(records);
    }

    #[test]
    fn test_sparse_float_counts() {
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 0.5 },
            BlockRecord { bin1: 3, bin2: 900, count: 123.25 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(payload[12], 1, "float flag set");
        round_trip(records);
    }

    #[test]
    fn test_sparse_large_counts_promote_to_float() {
        let records = vec![BlockRecord { bin1: 0, bin2: 1, count: 40_000.0 }];
        let payload = encode_payload(&records).unwrap();
        assert_eq!(payload[12], 1);
        round_trip(records);
    }

    #[test]
    fn test_sparse_all_eight_width_combinations_round_trip() {
        for wide1 in [false, true] {
            for wide2 in [false, true] {
                for float in [false, true] {
                    let b1 = if wide1 { 70_000 } else { 7 };
                    let b2 = if wide2 { 80_000 } else { 8 };
                    let count = if float { 2.5 } else { 2.0 };
                    let records = vec![
                        BlockRecord { bin1: 0, bin2: 0, count: 1.0 },
                        BlockRecord { bin1: b1, bin2: b2, count },
                        BlockRecord { bin1: b1, bin2: b2 + 1, count: 3.0 },
                    ];
                    round_trip(records);
                }
            }
        }
    }

    // ==================== Dense Encoding Tests ====================

    #[test]
    fn test_dense_selected_for_full_tile() {
        // a fully occupied 2x3 rectangle compresses as a dense tile
        let mut records = Vec::new();
        for bin1 in 4..6 {
            for bin2 in 9..12 {
                records.push(BlockRecord { bin1, bin2, count: f32::from((bin1 + bin2) as u8) });
            }
        }
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(payload[15], BLOCK_TYPE_DENSE);
        round_trip(records);
    }

    #[test]
    fn test_dense_with_absent_cells_short_counts() {
        // 3x2 rectangle with holes; still over half occupancy
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 1.0 },
            BlockRecord { bin1: 0, bin2: 1, count: 2.0 },
            BlockRecord { bin1: 1, bin2: 1, count: 3.0 },
            BlockRecord { bin1: 2, bin2: 0, count: 4.0 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(payload[15], BLOCK_TYPE_DENSE);
        assert_eq!(payload[12], 0, "short counts");
        round_trip(records);
    }

    #[test]
    fn test_dense_with_absent_cells_float_counts() {
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 1.5 },
            BlockRecord { bin1: 0, bin2: 1, count: 2.5 },
            BlockRecord { bin1: 1, bin2: 0, count: 3.5 },
        ];
        let payload = encode_payload(&sort(records.clone())).unwrap();
        assert_eq!(payload[15], BLOCK_TYPE_DENSE);
        assert_eq!(payload[12], 1);
        round_trip(records);
    }

    // ==================== Legacy Payload Tests ====================

    #[test]
    fn test_legacy_v1_payload_decodes() {
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(2).unwrap();
        for (bin1, bin2, count) in [(3u32, 5u32, 2.0f32), (4, 9, 1.5)] {
            payload.write_u32::<LittleEndian>(bin1).unwrap();
            payload.write_u32::<LittleEndian>(bin2).unwrap();
            payload.write_f32::<LittleEndian>(count).unwrap();
        }
        let records = decode_payload(1, &payload, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], BlockRecord { bin1: 3, bin2: 5, count: 2.0 });
        assert_eq!(records[1], BlockRecord { bin1: 4, bin2: 9, count: 1.5 });
    }

    // ==================== Corruption Tests ====================

    #[test]
    fn test_unknown_block_type_is_fatal() {
        let records = vec![BlockRecord { bin1: 0, bin2: 0, count: 1.0 }];
        let mut payload = encode_payload(&records).unwrap();
        payload[15] = 9;
        let err = decode_payload(2, &payload, 64).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::BlockError(BlockError::UnknownBlockType { tag: 9, offset: 64 })
        ));
    }

    #[test]
    fn test_truncated_payload_is_fatal() {
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 1.0 },
            BlockRecord { bin1: 9, bin2: 700, count: 2.0 },
        ];
        let payload = encode_payload(&records).unwrap();
        let err = decode_payload(2, &payload[..payload.len() - 2], 0).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::BlockError(BlockError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_record_count_mismatch_is_fatal() {
        let records = vec![
            BlockRecord { bin1: 0, bin2: 0, count: 1.0 },
            BlockRecord { bin1: 0, bin2: 900, count: 2.0 },
        ];
        let mut payload = encode_payload(&records).unwrap();
        // inflate the declared record count
        payload[0] = 3;
        let err = decode_payload(2, &payload, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::BlockError(BlockError::RecordCountMismatch { expected: 3, found: 2 })
        ));
    }
}
