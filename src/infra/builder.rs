//! Reference map builder: fetches the image, checks it decodes and carves out tiles.
//!
//! Palette conversion and dithering belong to the rendering backend; this builder records the
//! requested dithering on the map and stops at tile allocation.

use std::sync::Arc;

use async_trait::async_trait;
use imagesize::{ImageError, ImageSize, ImageType};
use tracing::debug;

use crate::{
    application::collaborators::{BuildError, BuildSpec, MapBuilder, MapRegistry},
    domain::{entities::ImageMap, types::MapKind},
    infra::remote::RemoteContent,
};

pub struct FetchingMapBuilder {
    content: Arc<RemoteContent>,
    kind: MapKind,
}

impl FetchingMapBuilder {
    pub fn new(content: Arc<RemoteContent>, kind: MapKind) -> Self {
        Self { content, kind }
    }

    fn inspect(&self, data: &[u8]) -> Result<ImageSize, BuildError> {
        if self.kind.is_animated() {
            match imagesize::image_type(data) {
                Ok(ImageType::Gif) => {}
                Ok(other) => {
                    return Err(BuildError::Decode(format!(
                        "expected an animated GIF, found {other:?}"
                    )));
                }
                Err(err) => return Err(decode_error(err)),
            }
        }
        imagesize::blob_size(data).map_err(decode_error)
    }
}

#[async_trait]
impl MapBuilder for FetchingMapBuilder {
    async fn build(
        &self,
        registry: Arc<dyn MapRegistry>,
        spec: BuildSpec,
    ) -> Result<ImageMap, BuildError> {
        let data = self.content.fetch(&spec.location).await?;
        let size = self.inspect(&data)?;
        if size.width == 0 || size.height == 0 {
            return Err(BuildError::Decode("image has no pixels".to_string()));
        }

        let tiles = registry.allocate_tiles(spec.dimensions.area()).await?;
        debug!(
            target = "infra::builder",
            name = %spec.name,
            source_width = size.width,
            source_height = size.height,
            tiles = tiles.len(),
            dithering = spec.dithering.as_str(),
            "image map built"
        );

        Ok(ImageMap::new(
            spec.name,
            spec.owner,
            spec.dimensions,
            tiles,
            self.kind,
            spec.location,
            spec.dithering,
        )?)
    }
}

fn decode_error(err: ImageError) -> BuildError {
    match err {
        ImageError::NotSupported => BuildError::Decode("unsupported image format".to_string()),
        ImageError::CorruptedImage => BuildError::Decode("corrupted image".to_string()),
        ImageError::IoError(err) => BuildError::Decode(err.to_string()),
    }
}
