use anyhow::{bail, Result};

/// Semantic identity of an axis, independent of its physical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisKind {
    X,
    Y,
    Z,
    Channel,
    Batch,
    Unknown,
}

/// How an axis participates in tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilingMode {
    /// The axis is never split; every tile spans its full extent.
    None,
    /// Spatial tiling with overlap context on each side.
    WithHalo,
    /// Batch tiling: independent samples, split without overlap.
    Batch,
}

/// One declared axis of a node.
///
/// Legal extents are `min_size + k * step`. `step == Some(0)` pins the
/// extent to exactly `min_size`; `step == None` leaves it unconstrained
/// above `min_size`. `scale`/`offset` are only meaningful on output-node
/// axes, where the derived extent is `input_extent * scale + offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConstraint {
    pub kind: AxisKind,
    pub mode: TilingMode,
    pub min_size: usize,
    pub step: Option<usize>,
    pub halo: Option<usize>,
    pub scale: f64,
    pub offset: i64,
}

impl AxisConstraint {
    pub fn new(kind: AxisKind, mode: TilingMode, min_size: usize) -> Self {
        Self {
            kind,
            mode,
            min_size,
            step: None,
            halo: None,
            scale: 1.0,
            offset: 0,
        }
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_halo(mut self, halo: usize) -> Self {
        self.halo = Some(halo);
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: i64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Whether the extent is pinned to exactly `min_size`.
    pub fn is_fixed(&self) -> bool {
        self.step == Some(0)
    }

    /// Smallest legal extent at or above `wanted`. Never shrinks.
    pub fn next_valid_extent(&self, wanted: usize) -> usize {
        if self.is_fixed() {
            return self.min_size;
        }
        if wanted <= self.min_size {
            return self.min_size;
        }
        match self.step {
            Some(step) if step > 0 => {
                let over = wanted - self.min_size;
                self.min_size + over.div_ceil(step) * step
            }
            _ => wanted,
        }
    }
}

/// Permutation from a node's declared axis order to the physical array's
/// dimension order. `physical_dim(i)` is the physical dimension holding
/// declared axis `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisMapping {
    to_physical: Vec<usize>,
}

impl AxisMapping {
    pub fn identity(rank: usize) -> Self {
        Self {
            to_physical: (0..rank).collect(),
        }
    }

    pub fn new(to_physical: Vec<usize>) -> Result<Self> {
        let rank = to_physical.len();
        let mut seen = vec![false; rank];
        for &dim in &to_physical {
            if dim >= rank {
                bail!("axis mapping entry {dim} is out of range for rank {rank}");
            }
            if seen[dim] {
                bail!("axis mapping maps two axes to physical dimension {dim}");
            }
            seen[dim] = true;
        }
        Ok(Self { to_physical })
    }

    pub fn rank(&self) -> usize {
        self.to_physical.len()
    }

    pub fn physical_dim(&self, declared_axis: usize) -> usize {
        self.to_physical[declared_axis]
    }

    /// Inverse lookup: the declared axis stored in physical dimension `dim`.
    pub fn declared_axis(&self, dim: usize) -> usize {
        self.to_physical
            .iter()
            .position(|&d| d == dim)
            .unwrap_or(dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_valid_extent_respects_min_and_step() {
        let axis = AxisConstraint::new(AxisKind::X, TilingMode::WithHalo, 32).with_step(16);
        assert_eq!(axis.next_valid_extent(10), 32);
        assert_eq!(axis.next_valid_extent(32), 32);
        assert_eq!(axis.next_valid_extent(33), 48);
        assert_eq!(axis.next_valid_extent(100), 112);
    }

    #[test]
    fn next_valid_extent_unconstrained_without_step() {
        let axis = AxisConstraint::new(AxisKind::Y, TilingMode::WithHalo, 8);
        assert_eq!(axis.next_valid_extent(3), 8);
        assert_eq!(axis.next_valid_extent(77), 77);
    }

    #[test]
    fn fixed_axis_always_reports_min_size() {
        let axis = AxisConstraint::new(AxisKind::Channel, TilingMode::None, 3).with_step(0);
        assert!(axis.is_fixed());
        assert_eq!(axis.next_valid_extent(1), 3);
        assert_eq!(axis.next_valid_extent(7), 3);
    }

    #[test]
    fn mapping_round_trips_between_declared_and_physical() {
        // Declared (B, C, Y, X) stored physically as (Y, X, C, B).
        let mapping = AxisMapping::new(vec![3, 2, 0, 1]).expect("valid mapping");
        assert_eq!(mapping.physical_dim(0), 3);
        assert_eq!(mapping.physical_dim(2), 0);
        assert_eq!(mapping.declared_axis(0), 2);
        assert_eq!(mapping.declared_axis(3), 0);
    }

    #[test]
    fn mapping_rejects_duplicates_and_out_of_range() {
        assert!(AxisMapping::new(vec![0, 0]).is_err());
        assert!(AxisMapping::new(vec![0, 2]).is_err());
    }

    #[test]
    fn identity_mapping_is_noop() {
        let mapping = AxisMapping::identity(3);
        for axis in 0..3 {
            assert_eq!(mapping.physical_dim(axis), axis);
            assert_eq!(mapping.declared_axis(axis), axis);
        }
    }
}
