//! Artifact persistence and plate cropping.
//!
//! Artifacts are JPEG files written under one root directory. The pipeline
//! only ever sees references of the form `<url_prefix>/<file name>`, which
//! stay valid as long as the file exists and are meant for static serving
//! by whatever fronts the service.

use crate::error::PipelineError;
use common::plate_tasks::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Directory-backed artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    url_prefix: String,
}

impl ArtifactStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Result<Self, PipelineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reference returned to callers for an artifact name
    pub fn reference(&self, name: &str) -> String {
        if self.url_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.url_prefix, name)
        }
    }

    /// Write `bytes` under `name` and return its reference.
    ///
    /// Names are single relative path components; distinct invocations must
    /// use distinct names, the store does not arbitrate collisions.
    pub fn write(&self, bytes: &[u8], name: &str) -> io::Result<String> {
        let path = self.resolve(name)?;
        std::fs::write(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote artifact");
        Ok(self.reference(name))
    }

    /// Read an artifact back by name or by reference
    pub fn read(&self, name_or_ref: &str) -> io::Result<Vec<u8>> {
        let name = name_or_ref
            .strip_prefix(&self.url_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name_or_ref);
        std::fs::read(self.resolve(name)?)
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact name '{}'", name),
            )),
        }
    }
}

/// Encode an image as baseline JPEG (RGB, alpha dropped)
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(buffer)
}

/// A plate region cut out of the source image
#[derive(Debug, Clone)]
pub struct PlateCrop {
    pub image: DynamicImage,

    /// Box actually cropped, clamped to the source image
    pub region: BoundingBox,
}

/// Crop `bbox` out of `image` after clamping it to the image bounds.
///
/// Returns `None` when the clamped box has no area; such plates are skipped.
pub fn crop_plate(image: &DynamicImage, bbox: &BoundingBox) -> Option<PlateCrop> {
    let region = bbox.clamp_to(image.width(), image.height())?;
    let cropped = image.crop_imm(
        region.x1 as u32,
        region.y1 as u32,
        region.width() as u32,
        region.height() as u32,
    );

    Some(PlateCrop {
        image: cropped,
        region,
    })
}
