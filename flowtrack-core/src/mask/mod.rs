//! mask — permitted-hidden-zone collaborator contract
//!
//! A single-channel image marking where an object is allowed to vanish
//! without being declared lost: pixel values above the engine's threshold
//! mean "disappearing here reads as occlusion".  When no mask file exists
//! the driver synthesises an all-permissive one, matching the upstream
//! collaborator's behavior.

use std::path::Path;

use anyhow::{Context, Result};
use image::GrayImage;

/// Grayscale occlusion-zone mask in frame coordinates.
pub struct HiddenMask {
    image: GrayImage,
}

impl HiddenMask {
    pub fn from_image(image: GrayImage) -> Self {
        Self { image }
    }

    /// Load any image file and collapse it to luma.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let image = image::open(path.as_ref())
            .with_context(|| format!("failed to open hidden mask {}", path.as_ref().display()))?
            .into_luma8();
        Ok(Self { image })
    }

    /// Whole-frame permissive mask (every pixel 255), the default when no
    /// mask file is supplied.
    pub fn permissive(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::from_pixel(width, height, image::Luma([255u8])),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Mask value at `(x, y)`; positions outside the frame read as 0
    /// (not a permitted hidden zone).
    pub fn sample(&self, x: f32, y: f32) -> u8 {
        if x < 0.0 || y < 0.0 {
            return 0;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= self.image.width() || y >= self.image.height() {
            return 0;
        }
        self.image.get_pixel(x, y).0[0]
    }
}
