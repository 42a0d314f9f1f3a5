//! Tiled execution loop and its out-of-memory retry scheduler.
//!
//! One logical worker drives the tile grid strictly sequentially: plan,
//! partition, predict per tile, resolve. An out-of-memory signal from the
//! model restarts the whole attempt with more conservative parameters
//! (batch size halves until it reaches 1, then the tile count doubles)
//! and becomes fatal once those parameters stop changing between attempts.

use ndarray::ArrayD;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::ExecError;
use crate::fitting::fit_input;
use crate::model::{ModelRunner, PredictError};
use crate::node::{InputNode, OutputNode};
use crate::partition::Partition;
use crate::planner::plan_tiling;
use crate::store::{CacheDir, CompletedOutput, OutputStore};

/// Progress observer: `(tiles_done, tiles_total)` after each resolved tile.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send>;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Planning,
    Running,
    Done,
    Failed,
    Canceled,
}

/// Everything a finished run hands back. Holds the scratch cache alive so
/// disk-backed outputs stay readable until the caller drops this value.
#[derive(Debug)]
pub struct RunOutput {
    outputs: Vec<CompletedOutput>,
    _cache: Option<CacheDir>,
}

impl RunOutput {
    pub fn outputs(&self) -> &[CompletedOutput] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&CompletedOutput> {
        self.outputs.iter().find(|output| output.name() == name)
    }
}

/// Drives a model over a node set according to the run options.
pub struct TiledExecutor<M: ModelRunner> {
    model: M,
    options: RunOptions,
    state: RunState,
}

impl<M: ModelRunner> TiledExecutor<M> {
    pub fn new(model: M, options: RunOptions) -> Self {
        Self {
            model,
            options,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Runs to a terminal state and returns the completed outputs.
    ///
    /// Cancellation is observed between tiles only; once seen, partial
    /// output is discarded and the run ends as `Canceled`.
    pub fn run(
        &mut self,
        inputs: &[InputNode],
        outputs: &[OutputNode],
        progress: Option<ProgressCallback>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput, ExecError> {
        let result = self.run_inner(inputs, outputs, progress, cancel);
        self.state = match &result {
            Ok(_) => RunState::Done,
            Err(ExecError::Canceled) => RunState::Canceled,
            Err(_) => RunState::Failed,
        };
        result
    }

    fn run_inner(
        &mut self,
        inputs: &[InputNode],
        outputs: &[OutputNode],
        progress: Option<ProgressCallback>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput, ExecError> {
        if inputs.is_empty() {
            return Err(ExecError::options("at least one input node is required"));
        }
        if outputs.is_empty() {
            return Err(ExecError::options("at least one output node is required"));
        }
        if self.options.number_of_tiles == 0 {
            return Err(ExecError::options("number_of_tiles must be at least 1"));
        }
        if self.options.batch_size == 0 {
            return Err(ExecError::options("batch_size must be at least 1"));
        }
        if !self.model.is_initialized() {
            return Err(ExecError::invocation("model is not initialized"));
        }

        if is_canceled(&cancel) {
            return Err(ExecError::Canceled);
        }

        // Multi-input node sets are never tiled: the tile grids of
        // correlated inputs cannot be aligned from the information
        // available here, so the whole fitted arrays go through a single
        // prediction. Memory-adaptive retries do not apply on this path.
        if inputs.len() > 1 || !self.options.tiling_enabled {
            self.state = RunState::Planning;
            return self.run_untiled(inputs, outputs);
        }

        self.run_tiled(&inputs[0], outputs, progress, cancel)
    }

    fn run_untiled(
        &mut self,
        inputs: &[InputNode],
        outputs: &[OutputNode],
    ) -> Result<RunOutput, ExecError> {
        debug!(
            inputs = inputs.len(),
            tiling_enabled = self.options.tiling_enabled,
            "Running whole-array prediction without tiling"
        );
        let mut fitted = Vec::with_capacity(inputs.len());
        for input in inputs {
            fitted.push(fit_input(input)?.data);
        }

        self.state = RunState::Running;
        let raws = match self.model.predict(&fitted) {
            Ok(raws) => raws,
            // Without tiling there is no parameter left to shrink.
            Err(PredictError::OutOfMemory) => return Err(ExecError::OutOfMemory),
            Err(PredictError::Failure(error)) => return Err(ExecError::ModelInvocation(error)),
        };
        wrap_raw_outputs(raws, outputs)
    }

    fn run_tiled(
        &mut self,
        input: &InputNode,
        outputs: &[OutputNode],
        progress: Option<ProgressCallback>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutput, ExecError> {
        let cache = CacheDir::prepare(self.options.cache_directory.as_deref())?;

        let mut tile_request = self.options.number_of_tiles;
        let mut batch_request = self.options.batch_size;
        // Parameters in effect at the previous OOM recovery; when a new
        // OOM arrives with identical planned values, nothing can shrink
        // further and the failure is final.
        let mut last_recovery: Option<(usize, usize)> = None;
        let mut attempt = 0usize;

        'attempts: loop {
            self.state = RunState::Planning;
            let fitted = fit_input(input)?;
            let extents: Vec<usize> = fitted.data.shape().to_vec();
            let plan = plan_tiling(
                &extents,
                &input.physical_constraints(),
                tile_request,
                self.options.default_halo,
                batch_request,
            );
            let planned_tiles = plan.total_tiles();
            let planned_batch = plan.batch_size;
            debug!(
                attempt,
                tiles = planned_tiles,
                batch = planned_batch,
                "Planned tiled execution"
            );

            let mut partition = Partition::build(plan, fitted, input, outputs, &cache, attempt)?;

            self.state = RunState::Running;
            if planned_tiles <= 1 {
                // Single tile: the grid machinery adds nothing, predict
                // the whole expanded input directly.
                let whole = partition.whole_input().clone();
                match self.model.predict(&[whole]) {
                    Ok(raws) => {
                        if let Some(callback) = &progress {
                            callback(1, 1);
                        }
                        return wrap_raw_outputs(raws, outputs);
                    }
                    Err(PredictError::OutOfMemory) => {
                        recover_or_fail(
                            &mut tile_request,
                            &mut batch_request,
                            &mut last_recovery,
                            planned_tiles,
                            planned_batch,
                        )?;
                        attempt += 1;
                        continue 'attempts;
                    }
                    Err(PredictError::Failure(error)) => {
                        return Err(ExecError::ModelInvocation(error));
                    }
                }
            }

            let total = partition.total_tiles() as u64;
            loop {
                if is_canceled(&cancel) {
                    info!("Cancellation observed at tile boundary, discarding partial output");
                    return Err(ExecError::Canceled);
                }
                let Some(tile) = partition.next_input_tile() else {
                    break;
                };

                match self.model.predict(&[tile]) {
                    Ok(raws) => {
                        partition.resolve_tile(&raws)?;
                        if let Some(callback) = &progress {
                            callback(partition.tiles_done() as u64, total);
                        }
                    }
                    Err(PredictError::OutOfMemory) => {
                        recover_or_fail(
                            &mut tile_request,
                            &mut batch_request,
                            &mut last_recovery,
                            planned_tiles,
                            planned_batch,
                        )?;
                        attempt += 1;
                        continue 'attempts;
                    }
                    Err(PredictError::Failure(error)) => {
                        return Err(ExecError::ModelInvocation(error));
                    }
                }
            }

            return Ok(RunOutput {
                outputs: partition.finish(),
                _cache: Some(cache),
            });
        }
    }
}

/// Adjusts the retry parameters after an out-of-memory signal, or fails
/// when the previous recovery already ran with the same planned values.
fn recover_or_fail(
    tile_request: &mut usize,
    batch_request: &mut usize,
    last_recovery: &mut Option<(usize, usize)>,
    planned_tiles: usize,
    planned_batch: usize,
) -> Result<(), ExecError> {
    if *last_recovery == Some((planned_tiles, planned_batch)) {
        warn!(
            tiles = planned_tiles,
            batch = planned_batch,
            "Out of memory with no parameter left to shrink, giving up"
        );
        return Err(ExecError::OutOfMemory);
    }
    *last_recovery = Some((planned_tiles, planned_batch));

    if planned_batch > 1 {
        *batch_request = (planned_batch / 2).max(1);
    } else {
        *tile_request = planned_tiles * 2;
    }
    warn!(
        tiles = *tile_request,
        batch = *batch_request,
        "Out of memory, retrying with reduced parameters"
    );
    Ok(())
}

/// Packages raw whole-array predictions as completed outputs.
fn wrap_raw_outputs(
    raws: Vec<ArrayD<f32>>,
    outputs: &[OutputNode],
) -> Result<RunOutput, ExecError> {
    if raws.len() != outputs.len() {
        return Err(ExecError::invocation(format!(
            "model returned {} outputs, expected {}",
            raws.len(),
            outputs.len()
        )));
    }
    let completed = raws
        .into_iter()
        .zip(outputs)
        .map(|(raw, node)| {
            let crop = raw.shape().to_vec();
            CompletedOutput::new(node.name().to_string(), OutputStore::Memory(raw), crop)
        })
        .collect();
    Ok(RunOutput {
        outputs: completed,
        _cache: None,
    })
}

fn is_canceled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|receiver| *receiver.borrow())
}

/// Convenience wrapper for callers that do not track executor state.
pub fn execute<M: ModelRunner>(
    model: M,
    inputs: &[InputNode],
    outputs: &[OutputNode],
    options: RunOptions,
) -> Result<RunOutput, ExecError> {
    TiledExecutor::new(model, options).run(inputs, outputs, None, None)
}

/// As [`execute`], with optional progress reporting and cancellation.
pub fn execute_with_context<M: ModelRunner>(
    model: M,
    inputs: &[InputNode],
    outputs: &[OutputNode],
    options: RunOptions,
    progress: Option<ProgressCallback>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<RunOutput, ExecError> {
    TiledExecutor::new(model, options).run(inputs, outputs, progress, cancel)
}
