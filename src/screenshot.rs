use std::path::Path;

use ash::vk;
use image::error::{ParameterError, ParameterErrorKind};
use image::{ImageError, RgbaImage};

use crate::error::Result;

/// Writes tightly packed RGBA8 pixels as PNG.
pub fn save_png(path: &Path, extent: vk::Extent2D, pixels: Vec<u8>) -> Result<()> {
    let image = RgbaImage::from_raw(extent.width, extent.height, pixels).ok_or_else(|| {
        ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch))
    })?;
    image.save(path)?;
    log::info!("Saved screenshot to {}", path.display());
    Ok(())
}
