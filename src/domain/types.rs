//! Identifiers and small value types shared by the creation pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DomainError;

/// Media type that routes a build to the animated builder.
pub const GIF_CONTENT_TYPE: &str = "image/gif";

/// Identity on whose behalf maps are created and against whose quota checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Entity that requested a creation and holds placeholder units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// The owner identity of an actor creating maps for itself.
    pub fn as_owner(self) -> OwnerId {
        OwnerId(self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(pub Uuid);

impl MapId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle of a single rendered map tile, allocated by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u32);

/// Size of an image map in map units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of tiles covered; computed in 64 bits so large inputs cannot wrap.
    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One item per tile.
    #[default]
    Individual,
    /// A single item representing the whole map.
    Combined,
}

impl DeliveryMode {
    pub fn from_combined(combined: bool) -> Self {
        if combined {
            Self::Combined
        } else {
            Self::Individual
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Individual => "individual",
            DeliveryMode::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitheringType {
    #[default]
    NearestColor,
    FloydSteinberg,
}

impl DitheringType {
    pub fn as_str(self) -> &'static str {
        match self {
            DitheringType::NearestColor => "nearest-color",
            DitheringType::FloydSteinberg => "floyd-steinberg",
        }
    }
}

impl FromStr for DitheringType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "nearest-color" => Ok(Self::NearestColor),
            "floyd-steinberg" => Ok(Self::FloydSteinberg),
            other => Err(DomainError::validation(format!(
                "unknown dithering type `{other}`"
            ))),
        }
    }
}

/// Which builder produces a map, decided once the content type is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Static,
    Animated,
}

impl MapKind {
    /// Expects a content type that was already normalized by [`normalize_content_type`].
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type == GIF_CONTENT_TYPE {
            Self::Animated
        } else {
            Self::Static
        }
    }

    pub fn is_animated(self) -> bool {
        matches!(self, MapKind::Animated)
    }
}

/// Absent content types become the empty string; surrounding whitespace is dropped.
pub fn normalize_content_type(raw: Option<&str>) -> String {
    raw.map(str::trim).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_does_not_overflow_u32() {
        let dims = Dimensions::new(u32::MAX, 2);
        assert_eq!(dims.area(), u64::from(u32::MAX) * 2);
    }

    #[test]
    fn dithering_parses_both_spellings() {
        assert_eq!(
            "floyd_steinberg".parse::<DitheringType>().unwrap(),
            DitheringType::FloydSteinberg
        );
        assert_eq!(
            " Nearest-Color ".parse::<DitheringType>().unwrap(),
            DitheringType::NearestColor
        );
        assert!("ordered".parse::<DitheringType>().is_err());
    }

    #[test]
    fn gif_selects_animated_kind() {
        let normalized = normalize_content_type(Some("  image/gif \n"));
        assert_eq!(MapKind::from_content_type(&normalized), MapKind::Animated);
        assert_eq!(MapKind::from_content_type("image/png"), MapKind::Static);
        assert_eq!(normalize_content_type(None), "");
        assert_eq!(MapKind::from_content_type(""), MapKind::Static);
    }
}
