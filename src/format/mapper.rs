use std::f64::consts::SQRT_2;

/// Deterministic assignment of a `(bin1, bin2)` pair to a block id, and the
/// inverse enumeration of block ids overlapping a query rectangle.
///
/// `Grid` tiles the matrix on a plain row/column lattice and serves
/// inter-chromosomal matrices plus version-1 intra matrices. `Diagonal`
/// arranges intra-chromosomal tiles in anti-diagonal depth bands with a
/// perpendicular pad offset, so long-range diagonal queries touch a number of
/// blocks proportional to the band count instead of the rectangle area. The
/// depth transform is a log2 of the Euclidean-scaled bin distance; the
/// constants are tuned empirically and are kept exactly as-is — the writer's
/// `block_id` and the reader's `blocks_for_query` must stay inverses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockMapper {
    Grid {
        block_bin_count: u32,
        block_column_count: u32,
    },
    Diagonal {
        block_bin_count: u32,
        block_column_count: u32,
    },
}

impl BlockMapper {
    /// Grid layout over `num_bins2` columns
    pub fn grid(num_bins2: u64, block_bin_count: u32) -> Self {
        Self::Grid {
            block_bin_count,
            block_column_count: num_bins2.div_ceil(u64::from(block_bin_count)).max(1) as u32,
        }
    }

    /// Diagonal-band layout over an intra-chromosomal axis of `num_bins` bins
    pub fn diagonal(num_bins: u64, block_bin_count: u32) -> Self {
        Self::Diagonal {
            block_bin_count,
            block_column_count: (num_bins / u64::from(block_bin_count) + 1) as u32,
        }
    }

    /// Rebuilds the mapper a matrix was written with from its stored grid
    /// dimensions.
    pub fn from_dimensions(
        version: u8,
        intra: bool,
        block_bin_count: u32,
        block_column_count: u32,
    ) -> Self {
        if intra && version >= 2 {
            Self::Diagonal {
                block_bin_count,
                block_column_count,
            }
        } else {
            Self::Grid {
                block_bin_count,
                block_column_count,
            }
        }
    }

    pub fn block_bin_count(&self) -> u32 {
        match self {
            Self::Grid { block_bin_count, .. } | Self::Diagonal { block_bin_count, .. } => {
                *block_bin_count
            }
        }
    }

    pub fn block_column_count(&self) -> u32 {
        match self {
            Self::Grid {
                block_column_count, ..
            }
            | Self::Diagonal {
                block_column_count, ..
            } => *block_column_count,
        }
    }

    /// Block id owning `(bin1, bin2)` (chromosome-relative ids)
    pub fn block_id(&self, bin1: u64, bin2: u64) -> u64 {
        match *self {
            Self::Grid {
                block_bin_count,
                block_column_count,
            } => {
                let bbc = u64::from(block_bin_count);
                (bin1 / bbc) * u64::from(block_column_count) + bin2 / bbc
            }
            Self::Diagonal {
                block_bin_count,
                block_column_count,
            } => {
                let bbc = u64::from(block_bin_count);
                let depth = depth_band(bin1.abs_diff(bin2), block_bin_count);
                let pad = ((bin1 + bin2) / 2) / bbc;
                depth * u64::from(block_column_count) + pad
            }
        }
    }

    /// Sorted, deduplicated block ids overlapping the query rectangle
    /// `[bin1_lo, bin1_hi] x [bin2_lo, bin2_hi]` (inclusive bounds,
    /// chromosome-relative). For intra-chromosomal grid layouts the mirrored
    /// blocks are included so upper-triangle storage answers both
    /// orientations of the rectangle.
    pub fn blocks_for_query(
        &self,
        bin1_lo: u64,
        bin1_hi: u64,
        bin2_lo: u64,
        bin2_hi: u64,
        intra: bool,
    ) -> Vec<u64> {
        let mut ids = match *self {
            Self::Grid {
                block_bin_count,
                block_column_count,
            } => {
                let bbc = u64::from(block_bin_count);
                let bcc = u64::from(block_column_count);
                let row_lo = bin1_lo / bbc;
                let row_hi = bin1_hi / bbc;
                let col_lo = bin2_lo / bbc;
                let col_hi = bin2_hi / bbc;

                let mut ids = Vec::new();
                for row in row_lo..=row_hi {
                    for col in col_lo..=col_hi {
                        ids.push(row * bcc + col);
                    }
                }
                if intra {
                    for row in col_lo..=col_hi {
                        for col in row_lo..=row_hi {
                            ids.push(row * bcc + col);
                        }
                    }
                }
                ids
            }
            Self::Diagonal {
                block_bin_count,
                block_column_count,
            } => {
                let bbc = u64::from(block_bin_count);
                let bcc = u64::from(block_column_count);

                let pad_lo = ((bin1_lo + bin2_lo) / 2) / bbc;
                let pad_hi = ((bin1_hi + bin2_hi) / 2) / bbc + 1;

                let near = depth_band(bin1_lo.abs_diff(bin2_hi), block_bin_count);
                let far = depth_band(bin1_hi.abs_diff(bin2_lo), block_bin_count);
                // a rectangle straddling the diagonal reaches depth zero
                let crosses = bin1_lo <= bin2_hi && bin2_lo <= bin1_hi;
                let depth_lo = if crosses { 0 } else { near.min(far) };
                let depth_hi = near.max(far) + 1;

                let mut ids = Vec::new();
                for depth in depth_lo..=depth_hi {
                    for pad in pad_lo..=pad_hi {
                        ids.push(depth * bcc + pad);
                    }
                }
                ids
            }
        };
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Anti-diagonal band index: log2 of the diagonal distance scaled into block
/// units. Distance zero (the main diagonal) is band zero.
fn depth_band(distance: u64, block_bin_count: u32) -> u64 {
    let scaled = 1.0 + distance as f64 / SQRT_2 / f64::from(block_bin_count);
    scaled.log2().floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Grid Mapper Tests ====================

    #[test]
    fn test_grid_block_id() {
        let mapper = BlockMapper::grid(10, 4); // 3 columns
        assert_eq!(mapper.block_column_count(), 3);
        assert_eq!(mapper.block_id(0, 0), 0);
        assert_eq!(mapper.block_id(0, 9), 2);
        assert_eq!(mapper.block_id(4, 0), 3);
        assert_eq!(mapper.block_id(7, 5), 4);
    }

    #[test]
    fn test_grid_query_enumeration_covers_rectangle() {
        let mapper = BlockMapper::grid(20, 4);
        let ids = mapper.blocks_for_query(2, 9, 5, 13, false);
        for bin1 in 2..=9u64 {
            for bin2 in 5..=13u64 {
                assert!(
                    ids.contains(&mapper.block_id(bin1, bin2)),
                    "({bin1}, {bin2}) not covered"
                );
            }
        }
    }

    #[test]
    fn test_grid_intra_includes_mirror() {
        let mapper = BlockMapper::grid(20, 4);
        // asymmetric rectangle: pixels stored upper-triangular at (b1, b2)
        // with b1 from the *second* range must still be reachable
        let ids = mapper.blocks_for_query(0, 3, 12, 19, true);
        assert!(ids.contains(&mapper.block_id(0, 12)));
        assert!(ids.contains(&mapper.block_id(12, 0)));
    }

    // ==================== Diagonal Mapper Tests ====================

    #[test]
    fn test_depth_band_monotone() {
        let mut last = 0;
        for distance in 0..10_000u64 {
            let band = depth_band(distance, 16);
            assert!(band >= last);
            last = band;
        }
        assert_eq!(depth_band(0, 16), 0);
        assert!(depth_band(10_000, 16) > 5);
    }

    #[test]
    fn test_diagonal_mapper_is_inverse_of_enumeration() {
        let mapper = BlockMapper::diagonal(500, 8);
        // every pixel of a query rectangle must land in an enumerated block
        let queries = [(0u64, 40u64, 0u64, 40u64), (10, 90, 120, 400), (0, 499, 0, 499)];
        for (b1_lo, b1_hi, b2_lo, b2_hi) in queries {
            let ids = mapper.blocks_for_query(b1_lo, b1_hi, b2_lo, b2_hi, true);
            for bin1 in (b1_lo..=b1_hi).step_by(7) {
                for bin2 in (b2_lo..=b2_hi).step_by(11) {
                    let (lo, hi) = (bin1.min(bin2), bin1.max(bin2));
                    assert!(
                        ids.contains(&mapper.block_id(lo, hi)),
                        "pixel ({lo}, {hi}) missing from query {:?}",
                        (b1_lo, b1_hi, b2_lo, b2_hi)
                    );
                }
            }
        }
    }

    #[test]
    fn test_diagonal_long_range_query_is_not_quadratic() {
        let mapper = BlockMapper::diagonal(1_000_000, 256);
        // a whole-chromosome query at 1M bins enumerates bands, not the
        // full ~15M-block triangle
        let ids = mapper.blocks_for_query(0, 999_999, 0, 999_999, true);
        let grid_blocks = (1_000_000u64 / 256 + 1).pow(2);
        assert!(ids.len() as u64 * 100 < grid_blocks, "{} blocks", ids.len());
    }

    #[test]
    fn test_recorded_diagonal_ids() {
        // pinned reference output: formula changes must show up here
        let mapper = BlockMapper::diagonal(100, 8);
        assert_eq!(mapper.block_column_count(), 13);
        assert_eq!(mapper.block_id(0, 0), 0);
        // distance 10 scales below one band, pad (0+10)/2/8 = 0
        assert_eq!(mapper.block_id(0, 10), 0);
        assert_eq!(mapper.block_id(40, 44), 5);
        // distance 80 reaches band 3, pad (10+90)/2/8 = 6
        assert_eq!(mapper.block_id(10, 90), 3 * 13 + 6);
        let ids = mapper.blocks_for_query(0, 15, 0, 15, true);
        assert_eq!(ids, vec![0, 1, 2, 13, 14, 15, 26, 27, 28]);
    }

    // ==================== Reconstruction Tests ====================

    #[test]
    fn test_from_dimensions_version_dispatch() {
        let diag = BlockMapper::from_dimensions(2, true, 8, 13);
        assert!(matches!(diag, BlockMapper::Diagonal { .. }));
        let legacy = BlockMapper::from_dimensions(1, true, 8, 13);
        assert!(matches!(legacy, BlockMapper::Grid { .. }));
        let inter = BlockMapper::from_dimensions(2, false, 8, 13);
        assert!(matches!(inter, BlockMapper::Grid { .. }));
    }
}
