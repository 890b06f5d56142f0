//! Traits describing the collaborators the creation pipeline drives.
//!
//! The pipeline only orchestrates: decoding, storage, inventories and transport live behind
//! these seams. Reference adapters are in [`crate::infra`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::domain::{
    entities::ImageMap,
    error::DomainError,
    source::SourceLocator,
    types::{ActorId, Dimensions, DitheringType, MapKind, OwnerId, TileId},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry persistence error: {0}")]
    Persistence(String),
    #[error("image map `{id}` is already registered")]
    Duplicate { id: String },
    #[error("tile allocator exhausted")]
    TilesExhausted,
}

impl RegistryError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Canonical store of completed image maps.
#[async_trait]
pub trait MapRegistry: Send + Sync {
    async fn count_by_owner(&self, owner: OwnerId) -> Result<u64, RegistryError>;

    async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<ImageMap>, RegistryError>;

    async fn add(&self, map: ImageMap) -> Result<(), RegistryError>;

    /// Reserve fresh tile handles for a map under construction.
    async fn allocate_tiles(&self, count: u64) -> Result<Vec<TileId>, RegistryError>;
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("not enough placeholder units: {required} required, {available} held")]
    InsufficientUnits { required: u64, available: u64 },
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// Placeholder units held by actors.
#[async_trait]
pub trait PlaceholderInventory: Send + Sync {
    /// Atomically take `count` units, or take none and fail.
    async fn withdraw(&self, actor: ActorId, count: u64) -> Result<u64, InventoryError>;

    /// Give units back. Callers treat failures as best effort and only log them.
    async fn restore(&self, actor: ActorId, count: u64) -> Result<(), InventoryError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("actor `{actor}` cannot receive items: {reason}")]
    Rejected { actor: ActorId, reason: String },
}

/// Hands finished maps to the requesting actor.
#[async_trait]
pub trait MapDelivery: Send + Sync {
    async fn deliver_combined(&self, map: &ImageMap, actor: ActorId) -> Result<(), DeliveryError>;

    async fn deliver_individual(&self, map: &ImageMap, actor: ActorId)
    -> Result<(), DeliveryError>;
}

/// Maximum number of maps an actor may own. Raw values `<= 0` mean no cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationLimit {
    Unlimited,
    AtMost(u64),
}

impl CreationLimit {
    pub fn from_raw(raw: i64) -> Self {
        if raw <= 0 {
            Self::Unlimited
        } else {
            Self::AtMost(raw as u64)
        }
    }

    pub fn is_reached(self, current: u64) -> bool {
        match self {
            CreationLimit::Unlimited => false,
            CreationLimit::AtMost(limit) => current >= limit,
        }
    }
}

/// Source allow-list and per-actor quota lookups. Both must be cheap and side-effect free.
pub trait CreationPolicy: Send + Sync {
    fn is_source_allowed(&self, source: &SourceLocator) -> bool;

    fn creation_limit(&self, actor: ActorId) -> CreationLimit;
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload was not received within {0:?}")]
    TimedOut(Duration),
    #[error("upload session was cancelled")]
    Cancelled,
    #[error("upload session was replaced by a newer one")]
    Superseded,
    #[error("upload could not be stored: {0}")]
    Storage(String),
}

/// An upload slot awaiting data from the uploader. Resolved at most once.
#[derive(Debug)]
pub struct PendingUpload {
    owner: OwnerId,
    receiver: oneshot::Receiver<Result<String, UploadError>>,
    timeout: Duration,
}

impl PendingUpload {
    pub fn new(
        owner: OwnerId,
        receiver: oneshot::Receiver<Result<String, UploadError>>,
        timeout: Duration,
    ) -> Self {
        Self {
            owner,
            receiver,
            timeout,
        }
    }

    /// Wait until the uploader supplies a fetchable location.
    pub async fn resolve(self) -> Result<String, UploadError> {
        match tokio::time::timeout(self.timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(UploadError::Cancelled),
            Err(_elapsed) => {
                warn!(
                    target = "application::collaborators",
                    owner = %self.owner,
                    timeout = ?self.timeout,
                    "upload did not arrive in time"
                );
                Err(UploadError::TimedOut(self.timeout))
            }
        }
    }
}

/// Turns the upload token into a concrete location supplied later by the uploader.
#[async_trait]
pub trait UploadResolver: Send + Sync {
    async fn new_pending_upload(&self, owner: OwnerId) -> Result<PendingUpload, UploadError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid location `{location}`: {reason}")]
    InvalidLocation { location: String, reason: String },
    #[error("request to `{location}` failed: {message}")]
    Transport { location: String, message: String },
    #[error("`{location}` answered with status {status}")]
    Status { location: String, status: u16 },
    #[error("`{location}` exceeds {limit} bytes")]
    TooLarge { location: String, limit: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Looks at a location before the full download.
#[async_trait]
pub trait ContentProber: Send + Sync {
    /// Declared size in bytes; `None` when the remote does not say.
    async fn content_size(&self, location: &str) -> Result<Option<u64>, ProbeError>;

    async fn content_type(&self, location: &str) -> Result<Option<String>, ProbeError>;
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] ProbeError),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("build task panicked: {0}")]
    Panicked(String),
    #[error("build task was aborted")]
    Aborted,
}

/// Input to a builder; the registry is passed alongside for tile allocation.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub name: String,
    pub location: String,
    pub dimensions: Dimensions,
    pub dithering: DitheringType,
    pub owner: OwnerId,
}

/// Decodes, dithers and tiles an image into a map.
#[async_trait]
pub trait MapBuilder: Send + Sync {
    async fn build(
        &self,
        registry: Arc<dyn MapRegistry>,
        spec: BuildSpec,
    ) -> Result<ImageMap, BuildError>;
}

/// The two builders, selected by [`MapKind`].
#[derive(Clone)]
pub struct MapBuilders {
    static_maps: Arc<dyn MapBuilder>,
    animated_maps: Arc<dyn MapBuilder>,
}

impl MapBuilders {
    pub fn new(static_maps: Arc<dyn MapBuilder>, animated_maps: Arc<dyn MapBuilder>) -> Self {
        Self {
            static_maps,
            animated_maps,
        }
    }

    pub fn for_kind(&self, kind: MapKind) -> Arc<dyn MapBuilder> {
        match kind {
            MapKind::Static => Arc::clone(&self.static_maps),
            MapKind::Animated => Arc::clone(&self.animated_maps),
        }
    }
}
