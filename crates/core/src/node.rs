use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::ArrayD;

use crate::axis::{AxisConstraint, AxisMapping};

/// An input of the model: declared axes, the declared-to-physical mapping,
/// and an immutable snapshot of the original array.
///
/// The snapshot never changes for the lifetime of a run. Every planning
/// attempt (including out-of-memory retries) derives a fresh fitted view
/// from it, so there is no state to reset between attempts.
pub struct InputNode {
    name: String,
    axes: Vec<AxisConstraint>,
    mapping: AxisMapping,
    original: Arc<ArrayD<f32>>,
}

impl InputNode {
    pub fn new(
        name: impl Into<String>,
        axes: Vec<AxisConstraint>,
        mapping: AxisMapping,
        array: ArrayD<f32>,
    ) -> Result<Self> {
        let name = name.into();
        if axes.is_empty() {
            bail!("input node `{name}` declares no axes");
        }
        if mapping.rank() != axes.len() {
            bail!(
                "input node `{name}`: mapping rank {} does not match {} declared axes",
                mapping.rank(),
                axes.len()
            );
        }
        if array.ndim() > axes.len() {
            bail!(
                "input node `{name}`: array rank {} exceeds {} declared axes",
                array.ndim(),
                axes.len()
            );
        }
        Ok(Self {
            name,
            axes,
            mapping,
            original: Arc::new(array),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn axes(&self) -> &[AxisConstraint] {
        &self.axes
    }

    pub fn mapping(&self) -> &AxisMapping {
        &self.mapping
    }

    pub fn original(&self) -> &Arc<ArrayD<f32>> {
        &self.original
    }

    /// The constraint governing physical dimension `dim`.
    pub fn constraint_for_dim(&self, dim: usize) -> &AxisConstraint {
        &self.axes[self.mapping.declared_axis(dim)]
    }

    /// Constraints rearranged into physical dimension order.
    pub fn physical_constraints(&self) -> Vec<&AxisConstraint> {
        (0..self.axes.len())
            .map(|dim| self.constraint_for_dim(dim))
            .collect()
    }
}

/// An output of the model. Its extents are never constrained directly:
/// each axis is derived from the input axis of matching semantic kind via
/// that axis's `scale`/`offset`.
pub struct OutputNode {
    name: String,
    axes: Vec<AxisConstraint>,
    mapping: AxisMapping,
}

impl OutputNode {
    pub fn new(
        name: impl Into<String>,
        axes: Vec<AxisConstraint>,
        mapping: AxisMapping,
    ) -> Result<Self> {
        let name = name.into();
        if axes.is_empty() {
            bail!("output node `{name}` declares no axes");
        }
        if mapping.rank() != axes.len() {
            bail!(
                "output node `{name}`: mapping rank {} does not match {} declared axes",
                mapping.rank(),
                axes.len()
            );
        }
        Ok(Self {
            name,
            axes,
            mapping,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn axes(&self) -> &[AxisConstraint] {
        &self.axes
    }

    pub fn mapping(&self) -> &AxisMapping {
        &self.mapping
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn constraint_for_dim(&self, dim: usize) -> &AxisConstraint {
        &self.axes[self.mapping.declared_axis(dim)]
    }
}
