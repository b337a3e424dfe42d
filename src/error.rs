//! Error types for musicgen-api.

use std::fmt;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// The first four variants are the request-level taxonomy the HTTP layer maps
/// to status codes; the rest wrap the sources that end up as generation
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was rejected before any work was done (blank prompt).
    #[error("{0}")]
    InvalidArgument(String),

    /// A pipeline failed to initialize at startup and stays unavailable.
    #[error("{0}")]
    ModelUnavailable(String),

    /// Inference or encoding failed for this request.
    #[error("{0}")]
    Generation(String),

    /// No stored artifact with that name.
    #[error("{0}")]
    NotFound(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// WAV encoding error.
    #[error("audio: {0}")]
    Audio(String),

    /// PNG encoding error.
    #[error("image: {0}")]
    Image(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("hf-hub: {0}")]
    HfHub(String),

    /// The generation manager is gone or dropped a reply.
    #[error("manager: {0}")]
    Manager(String),
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(error: image::ImageError) -> Self {
        Error::Image(error.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}
