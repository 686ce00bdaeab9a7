use meshwork_gpu::GpuError;
use thiserror::Error;

use crate::nn::OutputName;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the landmark pipeline.
///
/// Every error is reported synchronously to the caller of the operation that caused it. The
/// pipeline never retries. Use [`Error::kind`] to tell configuration problems apart from failures
/// of a single frame.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource set is missing its {0}")]
    MissingResource(&'static str),
    #[error("resource set kernels were created on different GPU devices")]
    DeviceMismatch,
    #[error("failed to compile {kernel} kernel")]
    Kernel {
        kernel: &'static str,
        #[source]
        source: GpuError,
    },
    #[error("input image cannot be sampled by the preprocessing kernel: {0}")]
    UnsampleableImage(String),
    #[error("failed to create inference worker")]
    CreateWorker(#[source] BoxError),
    #[error("model graph does not expose required output `{0}`")]
    MissingOutput(OutputName),
    #[error("model output `{name}` holds {len} values, but at least {expected} are required")]
    OutputTooSmall {
        name: OutputName,
        len: usize,
        expected: usize,
    },
    #[error("inference failed")]
    Inference(#[source] BoxError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("the previous frame failed to process, its landmarks are not valid")]
    IncompleteFrame,
    #[error("detector has been disposed")]
    Disposed,
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The resource set, model or input image cannot work together. Retrying the same call will
    /// fail again.
    Configuration,
    /// A dispatch, inference or readback failed. The frame's results must not be used.
    Execution,
    /// The detector was used after [`Detector::dispose`](crate::Detector::dispose).
    UseAfterDispose,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingResource(_)
            | Error::DeviceMismatch
            | Error::Kernel { .. }
            | Error::UnsampleableImage(_)
            | Error::CreateWorker(_)
            | Error::MissingOutput(_)
            | Error::OutputTooSmall { .. } => ErrorKind::Configuration,
            Error::Inference(_) | Error::Gpu(_) | Error::IncompleteFrame => ErrorKind::Execution,
            Error::Disposed => ErrorKind::UseAfterDispose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            Error::MissingResource("model graph").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::MissingOutput(OutputName::Lips).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::Inference(anyhow::anyhow!("device lost").into()).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            Error::Gpu(GpuError::MapAborted).kind(),
            ErrorKind::Execution
        );
        assert_eq!(Error::Disposed.kind(), ErrorKind::UseAfterDispose);
    }

    #[test]
    fn messages() {
        assert_eq!(
            Error::MissingOutput(OutputName::Lips).to_string(),
            "model graph does not expose required output `output_lips`"
        );
        assert_eq!(
            Error::OutputTooSmall {
                name: OutputName::LeftIris,
                len: 4,
                expected: 10
            }
            .to_string(),
            "model output `output_left_iris` holds 4 values, but at least 10 are required"
        );
    }
}
