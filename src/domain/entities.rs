//! Image maps and the requests that create them.

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::{
    error::DomainError,
    source::SourceLocator,
    types::{ActorId, DeliveryMode, Dimensions, DitheringType, MapId, MapKind, OwnerId, TileId},
};

/// A finished, tiled image map. Owned by the registry once added.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMap {
    pub id: MapId,
    pub name: String,
    pub owner: OwnerId,
    pub dimensions: Dimensions,
    /// Row-major tile handles, `width * height` of them.
    pub tiles: Vec<TileId>,
    pub kind: MapKind,
    pub source: String,
    pub dithering: DitheringType,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ImageMap {
    pub fn new(
        name: impl Into<String>,
        owner: OwnerId,
        dimensions: Dimensions,
        tiles: Vec<TileId>,
        kind: MapKind,
        source: impl Into<String>,
        dithering: DitheringType,
    ) -> Result<Self, DomainError> {
        if tiles.len() as u64 != dimensions.area() {
            return Err(DomainError::invariant(format!(
                "map {dimensions} needs {} tiles, got {}",
                dimensions.area(),
                tiles.len()
            )));
        }

        Ok(Self {
            id: MapId::generate(),
            name: name.into(),
            owner,
            dimensions,
            tiles,
            kind,
            source: source.into(),
            dithering,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn is_animated(&self) -> bool {
        self.kind.is_animated()
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.to_lowercase()
    }
}

/// Everything needed to create one image map. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreationRequest {
    pub source: SourceLocator,
    pub dimensions: Dimensions,
    pub name: String,
    pub owner: OwnerId,
    /// When absent, quota, name and unit checks are skipped and nothing is delivered.
    pub actor: Option<ActorId>,
    pub delivery: DeliveryMode,
    pub dithering: DitheringType,
}

impl CreationRequest {
    pub fn new(
        source: &str,
        width: u32,
        height: u32,
        name: impl Into<String>,
        owner: OwnerId,
    ) -> Self {
        Self {
            source: SourceLocator::parse(source),
            dimensions: Dimensions::new(width, height),
            name: name.into(),
            owner,
            actor: None,
            delivery: DeliveryMode::Individual,
            dithering: DitheringType::NearestColor,
        }
    }

    /// Request on behalf of an actor that owns the result itself.
    pub fn for_actor(
        source: &str,
        width: u32,
        height: u32,
        name: impl Into<String>,
        actor: ActorId,
        combined: bool,
    ) -> Self {
        Self::new(source, width, height, name, actor.as_owner())
            .with_actor(actor)
            .with_delivery(DeliveryMode::from_combined(combined))
    }

    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_dithering(mut self, dithering: DitheringType) -> Self {
        self.dithering = dithering;
        self
    }

    /// Placeholder units an actor must hold for this request.
    pub fn required_units(&self) -> u64 {
        self.dimensions.area()
    }
}
