use ndarray::ArrayD;
use thiserror::Error;

/// Failure signal from a single `predict` call.
///
/// The executor only distinguishes two cases: memory exhaustion, which is
/// retried with smaller tiles/batches, and everything else, which is fatal
/// on first occurrence.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("model ran out of memory")]
    OutOfMemory,

    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

/// The opaque inference collaborator.
///
/// Implementations wrap whatever actually evaluates the model (a native
/// runtime session, a remote endpoint, a test stub). The executor feeds it
/// one tile (or the whole fitted array on the no-tiling path) per call
/// and expects one raw result per output node, in output-node order.
/// Resource teardown is the implementor's `Drop`.
pub trait ModelRunner: Send {
    fn predict(&mut self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, PredictError>;

    /// Whether the underlying model is loaded and ready. A run against an
    /// uninitialized model fails immediately without retries.
    fn is_initialized(&self) -> bool {
        true
    }
}
