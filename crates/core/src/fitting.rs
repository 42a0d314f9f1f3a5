//! Shape fitting: normalizes a physical array against a node's per-axis
//! constraints before any tiling happens.
//!
//! Undersized or step-misaligned extents are expanded with reflected
//! border content at the high edge; fixed-size axes that do not match are
//! a hard validation error. The pre-expansion extents are recorded so the
//! final output can be cropped back to the caller's requested size.

use ndarray::{ArrayD, Axis};

use crate::error::ExecError;
use crate::node::InputNode;

/// A fitted view of an input: the (possibly expanded) data plus the
/// extents it had before expansion, in physical dimension order.
#[derive(Debug)]
pub struct FittedInput {
    pub data: ArrayD<f32>,
    pub original_extents: Vec<usize>,
}

/// Fits the node's snapshot against its axis constraints.
///
/// Singleton dimensions are appended until the physical rank matches the
/// declared rank; axes below `min_size` or off the step grid are expanded
/// to the next valid extent. Axes are never shrunk.
pub fn fit_input(node: &InputNode) -> Result<FittedInput, ExecError> {
    let declared_rank = node.axes().len();
    let mut data = node.original().as_ref().clone();
    while data.ndim() < declared_rank {
        let dim = data.ndim();
        data = data.insert_axis(Axis(dim));
    }

    let original_extents: Vec<usize> = data.shape().to_vec();

    for declared_axis in 0..declared_rank {
        let dim = node.mapping().physical_dim(declared_axis);
        let constraint = &node.axes()[declared_axis];
        let extent = data.len_of(Axis(dim));

        if constraint.is_fixed() {
            if extent != constraint.min_size {
                return Err(ExecError::shape_mismatch(
                    node.name(),
                    declared_axis,
                    constraint.min_size,
                    extent,
                ));
            }
            continue;
        }

        let target = constraint.next_valid_extent(extent);
        if target > extent {
            data = mirror_extend(&data, dim, target);
        }
    }

    Ok(FittedInput {
        data,
        original_extents,
    })
}

/// Maps an index that may lie outside `0..len` back into range by
/// reflecting at the borders without repeating the border sample
/// (`abcd` continues as `cb a` on the low side and `cba` on the high side).
/// A length-1 axis repeats its single sample.
pub(crate) fn reflect_index(index: isize, len: usize) -> usize {
    debug_assert!(len > 0);
    if len == 1 {
        return 0;
    }
    let len = len as isize;
    let period = 2 * (len - 1);
    let mut folded = index % period;
    if folded < 0 {
        folded += period;
    }
    if folded >= len {
        folded = period - folded;
    }
    folded as usize
}

/// Grows dimension `dim` to `new_len` by reflecting existing content past
/// the high edge. Content below the old extent is preserved unchanged.
pub(crate) fn mirror_extend(data: &ArrayD<f32>, dim: usize, new_len: usize) -> ArrayD<f32> {
    let old_len = data.len_of(Axis(dim));
    if new_len <= old_len {
        return data.clone();
    }
    let indices: Vec<usize> = (0..new_len)
        .map(|i| reflect_index(i as isize, old_len))
        .collect();
    data.select(Axis(dim), &indices)
}

/// Copies the block starting at `starts` (which may be negative or extend
/// past the array) with the given `sizes`, reflecting out-of-range reads
/// at the borders.
pub(crate) fn read_reflected_block(
    data: &ArrayD<f32>,
    starts: &[isize],
    sizes: &[usize],
) -> ArrayD<f32> {
    debug_assert_eq!(starts.len(), data.ndim());
    debug_assert_eq!(sizes.len(), data.ndim());

    let mut block: Option<ArrayD<f32>> = None;
    for dim in 0..data.ndim() {
        // Selecting along one axis leaves the other extents untouched, so
        // the source length can always be read off the original array.
        let len = data.len_of(Axis(dim));
        let indices: Vec<usize> = (0..sizes[dim])
            .map(|i| reflect_index(starts[dim] + i as isize, len))
            .collect();
        block = Some(match &block {
            Some(partial) => partial.select(Axis(dim), &indices),
            None => data.select(Axis(dim), &indices),
        });
    }
    block.unwrap_or_else(|| data.to_owned())
}
