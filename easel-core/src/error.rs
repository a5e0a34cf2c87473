use image::DynamicImage;

use crate::request::NormalizedRequest;

/// Errors produced by the history store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors reported by an engine backend.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Required weights are not present locally, or the request does not
    /// fit the tier's memory ceiling.
    #[error("resources unavailable: {0}")]
    Resource(String),

    #[error("pipeline failed: {reason}")]
    Pipeline { reason: String },

    /// Cancellation was observed between two steps.
    #[error("generation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn pipeline(reason: impl Into<String>) -> Self {
        Self::Pipeline {
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::pipeline(format!("{err:#}"))
    }
}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        Self::pipeline(err.to_string())
    }
}

/// Model download failure.
#[derive(Debug, thiserror::Error)]
#[error("model download failed for {model_id}: {message}")]
pub struct TransportError {
    pub model_id: String,
    pub message: String,
}

/// Stored image bytes that could not be turned into a thumbnail.
///
/// Never leaves the cache; it is logged and the lookup yields nothing.
#[derive(Debug, thiserror::Error)]
pub enum CacheDecodeError {
    #[error("no stored image for record")]
    Missing,

    #[error("could not read stored image: {0}")]
    Load(String),

    #[error("could not decode stored image: {0}")]
    Image(#[from] image::ImageError),

    #[error("decode task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Settings file problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// An image that was generated but could not be persisted.
#[derive(Debug, Clone)]
pub struct UnsavedImage {
    pub image: DynamicImage,
    pub encoded: Vec<u8>,
    pub request: NormalizedRequest,
}

/// Everything [`Orchestrator::submit`](crate::Orchestrator::submit) can fail with.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The request was rejected before any work started.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Another generation currently occupies the engine.
    #[error("a generation is already in progress")]
    Busy,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("resources unavailable: {0}")]
    Resource(String),

    #[error("pipeline failed: {reason}")]
    Pipeline { reason: String },

    /// The image was produced but appending it to history failed. The
    /// pixels are handed back so the caller can still display them.
    #[error("failed to save generation: {source}")]
    Store {
        #[source]
        source: StoreError,
        unsaved: Box<UnsavedImage>,
    },

    #[error("generation cancelled")]
    Cancelled,
}

impl From<EngineError> for GenerationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Resource(msg) => Self::Resource(msg),
            EngineError::Pipeline { reason } => Self::Pipeline { reason },
            EngineError::Cancelled => Self::Cancelled,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
