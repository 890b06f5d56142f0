use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::collaborators::{BuildError, InventoryError, RegistryError, UploadError},
    domain::types::OwnerId,
    infra::error::InfraError,
    util::bytes::ByteSize,
};

/// Rejections raised before any background work starts. Nothing needs refunding.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("map dimensions must be at least 1x1, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid map name: {reason}")]
    InvalidName { reason: String },
    #[error("map area {area} exceeds the maximum of {max}")]
    AreaExceeded { area: u64, max: u64 },
    #[error("source `{source_locator}` is not allowed")]
    SourceNotAllowed { source_locator: String },
    #[error("creation limit of {limit} maps reached")]
    LimitReached { limit: u64 },
    #[error("an image map named `{name}` already exists")]
    DuplicateName { name: String },
    #[error("not enough empty maps: {required} required, {available} held")]
    InsufficientUnits { required: u64, available: u64 },
    #[error("placeholder units could not be withdrawn")]
    Inventory(#[source] InventoryError),
    #[error("failed to look up existing maps")]
    Lookup(#[source] RegistryError),
}

impl From<InventoryError> for ValidationError {
    fn from(error: InventoryError) -> Self {
        match error {
            InventoryError::InsufficientUnits {
                required,
                available,
            } => Self::InsufficientUnits {
                required,
                available,
            },
            other => Self::Inventory(other),
        }
    }
}

/// Failures after the request left the calling context.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upload failed")]
    UploadFailed(#[source] UploadError),
    #[error("upload source requested but uploads are disabled")]
    UploadsDisabled,
    #[error("image is {size}, above the maximum of {max}")]
    FileTooLarge { size: ByteSize, max: ByteSize },
    #[error("another image map is already being processed for owner `{owner}`")]
    EnqueueRejected { owner: OwnerId },
    #[error("image map creation failed")]
    BuildFailed(#[source] Box<dyn StdError + Send + Sync>),
}

impl PipelineError {
    pub fn build_failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::BuildFailed(Box::new(error))
    }
}

impl From<BuildError> for PipelineError {
    fn from(error: BuildError) -> Self {
        Self::build_failed(error)
    }
}

/// The single failure cause delivered through a creation handle.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CreationError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CreationError::Validation(_) => "validation",
            CreationError::Pipeline(PipelineError::UploadFailed(_)) => "upload_failed",
            CreationError::Pipeline(PipelineError::FileTooLarge { .. }) => "file_too_large",
            CreationError::Pipeline(PipelineError::EnqueueRejected { .. }) => "enqueue_rejected",
            CreationError::Pipeline(PipelineError::UploadsDisabled)
            | CreationError::Pipeline(PipelineError::BuildFailed(_)) => "build_failed",
        }
    }
}

/// Flatten an error and its sources into display lines, outermost first.
pub fn error_chain(error: &dyn StdError) -> Vec<String> {
    let mut messages = vec![error.to_string()];
    let mut current = error.source();
    while let Some(inner) = current {
        messages.push(inner.to_string());
        current = inner.source();
    }
    messages
}

/// Top-level error of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Creation(#[from] CreationError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
