//! Grayscale frame type: decoding from encoded bytes and region cropping.

use crate::types::FaceRegion;
use image::{DynamicImage, GrayImage};
use std::path::Path;

/// A decoded grayscale image.
#[derive(Clone, Debug, PartialEq)]
pub struct GrayFrame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayFrame {
    /// Decode an encoded image (PNG, JPEG, ...) and convert it to 8-bit luma.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_dynamic(&image))
    }

    /// Read and decode an image file.
    pub fn open(path: &Path) -> Result<Self, FrameError> {
        let image = image::open(path)?;
        Ok(Self::from_dynamic(&image))
    }

    pub fn from_dynamic(image: &DynamicImage) -> Self {
        Self::from_luma(image.to_luma8())
    }

    pub fn from_luma(luma: GrayImage) -> Self {
        let (width, height) = luma.dimensions();
        Self {
            data: luma.into_raw(),
            width,
            height,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    /// Copy out the pixels covered by `region`.
    pub fn crop(&self, region: &FaceRegion) -> Result<GrayFrame, FrameError> {
        if !region.within(self.width, self.height) {
            return Err(FrameError::RegionOutOfBounds {
                region: *region,
                width: self.width,
                height: self.height,
            });
        }

        let w = self.width as usize;
        let mut data = Vec::with_capacity(region.area() as usize);
        for row in region.y..region.y + region.height {
            let start = row as usize * w + region.x as usize;
            data.extend_from_slice(&self.data[start..start + region.width as usize]);
        }

        Ok(GrayFrame {
            data,
            width: region.width,
            height: region.height,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("region {region:?} lies outside {width}x{height} frame")]
    RegionOutOfBounds {
        region: FaceRegion,
        width: u32,
        height: u32,
    },
}
