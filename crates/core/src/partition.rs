//! Tiled partitioner: materializes the planned grid over the fitted input,
//! hands out halo-padded input tiles in row-major grid order, and writes
//! halo-stripped results into per-output stores.

use ndarray::{ArrayD, SliceInfoElem};
use tracing::debug;

use crate::axis::AxisKind;
use crate::error::ExecError;
use crate::fitting::{mirror_extend, read_reflected_block, FittedInput};
use crate::node::{InputNode, OutputNode};
use crate::planner::TilingPlan;
use crate::store::{CacheDir, CompletedOutput, OutputStore};

/// Derived output extent: `input_extent * scale + offset`, floored at zero.
fn scaled_extent(extent: usize, scale: f64, offset: i64) -> usize {
    ((extent as f64 * scale).round() as i64 + offset).max(0) as usize
}

/// One physical dimension of an output store.
struct LaneAxis {
    /// Physical input dimension of matching semantic kind, if any.
    input_dim: Option<usize>,
    /// Extent of one tile's output core (halo stripped).
    core: usize,
    /// Halo to strip from each side of a raw result.
    halo: usize,
    /// Extent the model is expected to return per tile.
    raw: usize,
    /// Final extent the caller reads, with fit/grid expansion cropped away.
    crop: usize,
}

struct OutputLane {
    name: String,
    axes: Vec<LaneAxis>,
    store: OutputStore,
}

/// Grid state of one planning attempt. Tiles are produced and resolved in
/// row-major order over the grid coordinates (last dimension fastest);
/// downstream progress reporting relies on that order.
pub struct Partition {
    input: ArrayD<f32>,
    plan: TilingPlan,
    counts: Vec<usize>,
    total: usize,
    cursor: usize,
    resolved: usize,
    lanes: Vec<OutputLane>,
}

impl Partition {
    /// Expands the fitted input so the grid covers it exactly, derives the
    /// output extents from the matching input axes, and allocates one
    /// store per output node (any store from a previous attempt is gone by
    /// the time its file tag is reused; `attempt` keeps tags distinct).
    pub fn build(
        plan: TilingPlan,
        fitted: FittedInput,
        input_node: &InputNode,
        outputs: &[OutputNode],
        cache: &CacheDir,
        attempt: usize,
    ) -> Result<Self, ExecError> {
        let mut input = fitted.data;
        for (dim, &target) in plan.padded_extents().iter().enumerate() {
            if target > input.shape()[dim] {
                input = mirror_extend(&input, dim, target);
            }
        }

        let counts = plan.tile_counts();
        let total = plan.total_tiles();

        let mut lanes = Vec::with_capacity(outputs.len());
        for output in outputs {
            let mut axes = Vec::with_capacity(output.rank());
            for dim in 0..output.rank() {
                let constraint = output.constraint_for_dim(dim);
                let input_dim = find_input_dim(input_node, constraint.kind);
                let axis = match input_dim {
                    Some(input_dim) => {
                        let axis_plan = &plan.axes[input_dim];
                        let core =
                            scaled_extent(axis_plan.tile_size, constraint.scale, constraint.offset);
                        let raw = scaled_extent(
                            axis_plan.tile_size + 2 * axis_plan.halo,
                            constraint.scale,
                            constraint.offset,
                        );
                        let crop = scaled_extent(
                            fitted.original_extents[input_dim],
                            constraint.scale,
                            constraint.offset,
                        );
                        LaneAxis {
                            input_dim: Some(input_dim),
                            core,
                            halo: raw.saturating_sub(core) / 2,
                            raw,
                            crop,
                        }
                    }
                    None => {
                        let extent = constraint.min_size.max(1);
                        LaneAxis {
                            input_dim: None,
                            core: extent,
                            halo: 0,
                            raw: extent,
                            crop: extent,
                        }
                    }
                };
                axes.push(axis);
            }

            let store_extents: Vec<usize> = axes
                .iter()
                .map(|axis| {
                    let count = axis
                        .input_dim
                        .map_or(1, |input_dim| plan.axes[input_dim].tile_count);
                    count * axis.core
                })
                .collect();
            let store = OutputStore::allocate(
                &store_extents,
                cache,
                &format!("{}-a{attempt}", output.name()),
            )?;
            debug!(
                output = output.name(),
                extents = ?store_extents,
                "Allocated output store"
            );
            lanes.push(OutputLane {
                name: output.name().to_string(),
                axes,
                store,
            });
        }

        Ok(Self {
            input,
            plan,
            counts,
            total,
            cursor: 0,
            resolved: 0,
            lanes,
        })
    }

    pub fn total_tiles(&self) -> usize {
        self.total
    }

    pub fn tiles_done(&self) -> usize {
        self.resolved
    }

    pub fn has_tiles_left(&self) -> bool {
        self.cursor < self.total
    }

    /// Whole expanded input, for the single-tile bypass.
    pub fn whole_input(&self) -> &ArrayD<f32> {
        &self.input
    }

    /// Advances the cursor and returns the next halo-padded input tile, or
    /// `None` when the grid is exhausted.
    pub fn next_input_tile(&mut self) -> Option<ArrayD<f32>> {
        if self.cursor >= self.total {
            return None;
        }
        let coord = self.grid_coord(self.cursor);
        self.cursor += 1;

        let rank = self.input.ndim();
        let mut starts = Vec::with_capacity(rank);
        let mut sizes = Vec::with_capacity(rank);
        for dim in 0..rank {
            let axis = &self.plan.axes[dim];
            starts.push((coord[dim] * axis.tile_size) as isize - axis.halo as isize);
            sizes.push(axis.tile_size + 2 * axis.halo);
        }
        Some(read_reflected_block(&self.input, &starts, &sizes))
    }

    /// Consumes the model's raw results for the tile most recently handed
    /// out: validates their shapes, strips the halo from each side, and
    /// writes the cores into the corresponding output regions.
    pub fn resolve_tile(&mut self, raws: &[ArrayD<f32>]) -> Result<(), ExecError> {
        if self.cursor == self.resolved {
            return Err(ExecError::invocation(
                "resolve_tile called with no tile outstanding",
            ));
        }
        if raws.len() != self.lanes.len() {
            return Err(ExecError::invocation(format!(
                "model returned {} outputs, expected {}",
                raws.len(),
                self.lanes.len()
            )));
        }

        let coord = self.grid_coord(self.cursor - 1);
        for (lane, raw) in self.lanes.iter_mut().zip(raws) {
            let expected: Vec<usize> = lane.axes.iter().map(|axis| axis.raw).collect();
            if raw.shape() != expected.as_slice() {
                return Err(ExecError::invocation(format!(
                    "output `{}` tile has shape {:?}, expected {:?}",
                    lane.name,
                    raw.shape(),
                    expected
                )));
            }

            let slices: Vec<SliceInfoElem> = lane
                .axes
                .iter()
                .map(|axis| SliceInfoElem::Slice {
                    start: axis.halo as isize,
                    end: Some((axis.halo + axis.core) as isize),
                    step: 1,
                })
                .collect();
            let mut core = raw.view();
            core.slice_collapse(slices.as_slice());

            let starts: Vec<usize> = lane
                .axes
                .iter()
                .map(|axis| {
                    axis.input_dim
                        .map_or(0, |input_dim| coord[input_dim] * axis.core)
                })
                .collect();
            lane.store.assign_region(&starts, &core);
        }

        self.resolved += 1;
        Ok(())
    }

    /// After every tile is resolved, the stores *are* the final outputs,
    /// cropped back to the extents derived from the pre-fit input.
    pub fn finish(self) -> Vec<CompletedOutput> {
        self.lanes
            .into_iter()
            .map(|lane| {
                let crop: Vec<usize> = lane.axes.iter().map(|axis| axis.crop).collect();
                CompletedOutput::new(lane.name, lane.store, crop)
            })
            .collect()
    }

    /// Row-major grid coordinate (last dimension fastest) of a linear
    /// tile index.
    fn grid_coord(&self, index: usize) -> Vec<usize> {
        let mut coord = vec![0usize; self.counts.len()];
        let mut rest = index;
        for dim in (0..self.counts.len()).rev() {
            coord[dim] = rest % self.counts[dim];
            rest /= self.counts[dim];
        }
        coord
    }
}

fn find_input_dim(input: &InputNode, kind: AxisKind) -> Option<usize> {
    (0..input.axes().len()).find(|&dim| input.constraint_for_dim(dim).kind == kind)
}
