//! Tiling planner: given fitted extents and per-axis constraints, decides
//! how many tiles to cut along each physical dimension, how large each
//! tile's core is, and how much halo context it carries.

use tracing::debug;

use crate::axis::{AxisConstraint, TilingMode};

/// Per-dimension outcome of planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisPlan {
    /// Number of grid cells along this dimension.
    pub tile_count: usize,
    /// Core extent of one tile, halo excluded. For batch dimensions this is
    /// the re-derived batch size; for untiled dimensions the full extent.
    pub tile_size: usize,
    /// Context padding on each side of a tile. Zero for batch and untiled
    /// dimensions.
    pub halo: usize,
}

/// A complete plan over all physical dimensions, in dimension order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingPlan {
    pub axes: Vec<AxisPlan>,
    /// Smallest batch extent across batch dimensions after re-derivation;
    /// equals the requested batch size when nothing was tightened, and 1
    /// when the plan has no batch dimension.
    pub batch_size: usize,
}

impl TilingPlan {
    pub fn total_tiles(&self) -> usize {
        self.axes.iter().map(|axis| axis.tile_count).product()
    }

    /// Extents the input must be grown to so the grid covers it exactly.
    pub fn padded_extents(&self) -> Vec<usize> {
        self.axes
            .iter()
            .map(|axis| axis.tile_count * axis.tile_size)
            .collect()
    }

    pub fn tile_counts(&self) -> Vec<usize> {
        self.axes.iter().map(|axis| axis.tile_count).collect()
    }
}

/// Computes a tiling plan for the given fitted extents.
///
/// `constraints` are in physical dimension order. Batch dimensions are cut
/// by `batch_size` first (and the batch re-derived downwards so the last
/// slot is not mostly waste); halo'd dimensions are then grown greedily,
/// always splitting the dimension with the largest remaining tile, until
/// the grid holds at least `min_tiles` tiles or every halo'd dimension has
/// reached its minimum size. Under-filling `min_tiles` is acceptable;
/// under-sizing below `min_size` is not.
pub fn plan_tiling(
    extents: &[usize],
    constraints: &[&AxisConstraint],
    min_tiles: usize,
    default_halo: usize,
    batch_size: usize,
) -> TilingPlan {
    debug_assert_eq!(extents.len(), constraints.len());
    let rank = extents.len();
    let min_tiles = min_tiles.max(1);
    let batch_size = batch_size.max(1);

    let mut counts = vec![1usize; rank];

    for dim in 0..rank {
        if constraints[dim].mode == TilingMode::Batch {
            counts[dim] = extents[dim].div_ceil(batch_size);
        }
    }

    loop {
        let total: usize = counts.iter().product();
        if total >= min_tiles {
            break;
        }

        // Split the halo'd dimension whose tiles are currently largest and
        // still above the minimum size.
        let mut candidate: Option<(usize, usize)> = None;
        for dim in 0..rank {
            let constraint = constraints[dim];
            if constraint.mode != TilingMode::WithHalo {
                continue;
            }
            let size = tile_size_for(extents[dim], counts[dim], constraint);
            if size > constraint.min_size
                && candidate.map_or(true, |(_, best)| size > best)
            {
                candidate = Some((dim, size));
            }
        }

        match candidate {
            Some((dim, _)) => counts[dim] += 1,
            // Every dimension is at its minimum: stop early rather than
            // produce tiles the model cannot accept.
            None => break,
        }
    }

    let mut axes = Vec::with_capacity(rank);
    let mut derived_batch: Option<usize> = None;
    for dim in 0..rank {
        let constraint = constraints[dim];
        let plan = match constraint.mode {
            TilingMode::None => AxisPlan {
                tile_count: 1,
                tile_size: extents[dim],
                halo: 0,
            },
            TilingMode::Batch => {
                let size = extents[dim].div_ceil(counts[dim]);
                derived_batch = Some(derived_batch.map_or(size, |b| b.min(size)));
                AxisPlan {
                    tile_count: counts[dim],
                    tile_size: size,
                    halo: 0,
                }
            }
            TilingMode::WithHalo => AxisPlan {
                tile_count: counts[dim],
                tile_size: tile_size_for(extents[dim], counts[dim], constraint),
                halo: halo_for(constraint, default_halo),
            },
        };
        axes.push(plan);
    }

    let plan = TilingPlan {
        axes,
        batch_size: derived_batch.unwrap_or(1),
    };
    debug!(
        tiles = plan.total_tiles(),
        counts = ?plan.tile_counts(),
        batch = plan.batch_size,
        "Computed tiling plan"
    );
    plan
}

/// Core tile extent for one dimension: `ceil(extent / count / step) * step`,
/// floored at the minimum size.
fn tile_size_for(extent: usize, count: usize, constraint: &AxisConstraint) -> usize {
    if constraint.is_fixed() {
        return constraint.min_size;
    }
    let step = match constraint.step {
        Some(step) if step > 0 => step,
        _ => 1,
    };
    let size = extent.div_ceil(count * step) * step;
    size.max(constraint.min_size)
}

/// Halo rounded up onto the step grid: padding must satisfy the same
/// granularity as tiles or the padded tile extent drifts off the model's
/// legal sizes.
fn halo_for(constraint: &AxisConstraint, default_halo: usize) -> usize {
    let halo = constraint.halo.unwrap_or(default_halo);
    match constraint.step {
        Some(step) if step > 0 => halo.div_ceil(step) * step,
        _ => halo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{AxisConstraint, AxisKind, TilingMode};

    fn spatial(min: usize, step: usize) -> AxisConstraint {
        AxisConstraint::new(AxisKind::X, TilingMode::WithHalo, min).with_step(step)
    }

    #[test]
    fn single_tile_plan_covers_the_whole_extent() {
        let x = spatial(32, 16);
        let y = spatial(32, 16);
        let plan = plan_tiling(&[112, 112], &[&y, &x], 1, 32, 1);
        assert_eq!(plan.tile_counts(), vec![1, 1]);
        assert_eq!(plan.axes[0].tile_size, 112);
        assert_eq!(plan.axes[1].tile_size, 112);
        assert_eq!(plan.padded_extents(), vec![112, 112]);
    }

    #[test]
    fn min_tiles_four_splits_both_dimensions_of_a_square() {
        let x = spatial(32, 16);
        let y = spatial(32, 16);
        let plan = plan_tiling(&[208, 208], &[&y, &x], 4, 32, 1);
        assert_eq!(plan.tile_counts(), vec![2, 2]);
        assert_eq!(plan.axes[0].tile_size, 112);
        assert_eq!(plan.total_tiles(), 4);
    }

    #[test]
    fn growth_prefers_the_dimension_with_larger_tiles() {
        let x = spatial(16, 16);
        let y = spatial(16, 16);
        // 64 x 256: the second dimension should absorb the first splits.
        let plan = plan_tiling(&[64, 256], &[&y, &x], 3, 0, 1);
        assert!(plan.axes[1].tile_count > plan.axes[0].tile_count);
        assert!(plan.total_tiles() >= 3);
    }

    #[test]
    fn coverage_and_floor_hold_across_a_parameter_sweep() {
        for extent in [33usize, 64, 100, 177, 512] {
            for min_tiles in [1usize, 2, 5, 9] {
                let c = spatial(32, 16);
                let plan = plan_tiling(&[extent], &[&c], min_tiles, 32, 1);
                let axis = &plan.axes[0];
                assert!(axis.tile_count * axis.tile_size >= extent);
                assert!(axis.tile_size >= 32);
                assert_eq!((axis.tile_size - 32) % 16, 0);
            }
        }
    }

    #[test]
    fn growth_stops_early_when_every_tile_is_at_minimum() {
        let c = spatial(32, 16);
        // Extent 64 can hold at most two minimum-size tiles; asking for 100
        // tiles must not under-size below the minimum.
        let plan = plan_tiling(&[64], &[&c], 100, 0, 1);
        assert_eq!(plan.axes[0].tile_size, 32);
        assert_eq!(plan.axes[0].tile_count, 2);
        assert!(plan.total_tiles() < 100);
    }

    #[test]
    fn batch_dimension_is_cut_by_batch_size_and_rederived() {
        let batch = AxisConstraint::new(AxisKind::Batch, TilingMode::Batch, 1);
        // 10 samples at batch 4 -> 3 slots; the smallest batch still giving
        // 3 slots is 4 -> ceil(10/3) = 4. With 9 samples the batch tightens.
        let plan = plan_tiling(&[10], &[&batch], 1, 0, 4);
        assert_eq!(plan.axes[0].tile_count, 3);
        assert_eq!(plan.axes[0].tile_size, 4);

        let plan = plan_tiling(&[9], &[&batch], 1, 0, 4);
        assert_eq!(plan.axes[0].tile_count, 3);
        assert_eq!(plan.axes[0].tile_size, 3);
        assert_eq!(plan.batch_size, 3);
    }

    #[test]
    fn untiled_dimensions_stay_whole() {
        let channel = AxisConstraint::new(AxisKind::Channel, TilingMode::None, 3).with_step(0);
        let x = spatial(16, 16);
        let plan = plan_tiling(&[3, 320], &[&channel, &x], 4, 16, 1);
        assert_eq!(plan.axes[0].tile_count, 1);
        assert_eq!(plan.axes[0].tile_size, 3);
        assert_eq!(plan.axes[0].halo, 0);
        assert_eq!(plan.axes[1].tile_count, 4);
    }

    #[test]
    fn halo_defaults_and_rounds_up_to_the_step_grid() {
        let with_default = spatial(32, 16);
        let plan = plan_tiling(&[128], &[&with_default], 1, 35, 1);
        assert_eq!(plan.axes[0].halo, 48);

        let explicit = spatial(32, 16).with_halo(10);
        let plan = plan_tiling(&[128], &[&explicit], 1, 35, 1);
        assert_eq!(plan.axes[0].halo, 16);

        let no_step = AxisConstraint::new(AxisKind::X, TilingMode::WithHalo, 8).with_halo(10);
        let plan = plan_tiling(&[128], &[&no_step], 1, 35, 1);
        assert_eq!(plan.axes[0].halo, 10);
    }

    #[test]
    fn requested_tile_counts_above_one_expand_the_input_coverage() {
        let c = spatial(32, 16);
        let plan = plan_tiling(&[100], &[&c], 2, 0, 1);
        assert_eq!(plan.axes[0].tile_count, 2);
        // ceil(100 / 2 / 16) * 16 = 64; grid covers 128 >= 100.
        assert_eq!(plan.axes[0].tile_size, 64);
        assert_eq!(plan.padded_extents(), vec![128]);
    }
}
