use thiserror::Error;

/// Terminal failures of a tiled execution run.
///
/// Recoverable out-of-memory signals from the model are handled inside the
/// executor's retry loop and never surface here; [`ExecError::OutOfMemory`]
/// is the fatal escalation once shrinking parameters stopped changing.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(
        "node `{node}` axis {axis} has a fixed extent of {expected}, got {actual}"
    )]
    ShapeMismatch {
        node: String,
        axis: usize,
        expected: usize,
        actual: usize,
    },

    #[error("out of memory: could not reduce tile or batch size any further")]
    OutOfMemory,

    #[error("run canceled before completion, no output was produced")]
    Canceled,

    #[error("model invocation failed: {0}")]
    ModelInvocation(#[source] anyhow::Error),

    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub(crate) fn shape_mismatch(
        node: impl Into<String>,
        axis: usize,
        expected: usize,
        actual: usize,
    ) -> Self {
        ExecError::ShapeMismatch {
            node: node.into(),
            axis,
            expected,
            actual,
        }
    }

    pub(crate) fn invocation(msg: impl Into<String>) -> Self {
        ExecError::ModelInvocation(anyhow::anyhow!(msg.into()))
    }

    pub(crate) fn options(msg: impl Into<String>) -> Self {
        ExecError::InvalidOptions(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_names_node_and_axis() {
        let error = ExecError::shape_mismatch("membrane", 2, 3, 5);
        let message = error.to_string();
        assert!(message.contains("membrane"));
        assert!(message.contains("axis 2"));
        assert!(message.contains('3'));
        assert!(message.contains('5'));
    }

    #[test]
    fn out_of_memory_message_mentions_exhausted_reduction() {
        let message = ExecError::OutOfMemory.to_string();
        assert!(message.contains("could not reduce"));
    }
}
