//! Error taxonomy for the denoising engine.
//!
//! Validation failures are raised before any collaborator is invoked.
//! Tensor and collaborator failures are carried through unmodified in
//! [`DenoiseError::Candle`]. Cancellation is not an error and never shows up here.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum DenoiseError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(
        "`negative_prompt` has batch size {negative}, but `prompt` has batch size {prompt}. \
         Please make sure that passed `negative_prompt` matches the batch size of `prompt`."
    )]
    BatchSizeMismatch { prompt: usize, negative: usize },

    #[error("Inference context lock poisoned by a previous invocation")]
    ContextPoisoned,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl DenoiseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DenoiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_mismatch_message_names_both_sizes() {
        let err = DenoiseError::BatchSizeMismatch {
            prompt: 2,
            negative: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("batch size 3"));
        assert!(msg.contains("batch size 2"));
    }

    #[test]
    fn test_candle_error_converts() {
        let err: DenoiseError = candle_core::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, DenoiseError::Candle(_)));
    }
}
