//! Fake detectors and synthetic faces for tests. No ONNX model is needed.
//!
//! Compiled for this crate's own tests and, through the `test-util`
//! feature, for dependent crates' tests.

use crate::detector::{DetectorError, FaceDetect};
use crate::frame::GrayFrame;
use crate::types::{DetectParams, FaceRegion};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::Cursor;
use std::path::Path;
use std::sync::mpsc;

/// Deterministic pseudo-random pixel value in `20..=219`.
pub fn texture_pixel(seed: u32, x: u32, y: u32) -> u8 {
    let mut v = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ seed.wrapping_mul(83_492_791);
    v ^= v >> 13;
    v = v.wrapping_mul(0x5bd1_e995);
    v ^= v >> 15;
    (v % 200) as u8 + 20
}

/// Treats the bounding box of all non-black pixels as the single face.
pub struct BrightBoxDetector;

impl FaceDetect for BrightBoxDetector {
    fn detect(
        &mut self,
        frame: &GrayFrame,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0, 0);
        for y in 0..frame.height {
            for x in 0..frame.width {
                if frame.pixel(x, y) > 0 {
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x);
                    y1 = y1.max(y);
                }
            }
        }
        if x0 == u32::MAX {
            return Ok(Vec::new());
        }
        let region = FaceRegion {
            x: x0,
            y: y0,
            width: x1 - x0 + 1,
            height: y1 - y0 + 1,
            confidence: 1.0,
        };
        if region.width < params.min_size || region.height < params.min_size {
            return Ok(Vec::new());
        }
        Ok(vec![region])
    }
}

/// `BrightBoxDetector` whose first call blocks until the gate is opened.
pub struct GatedDetector {
    gate: Option<mpsc::Receiver<()>>,
}

impl GatedDetector {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { gate: Some(rx) }, tx)
    }
}

impl FaceDetect for GatedDetector {
    fn detect(
        &mut self,
        frame: &GrayFrame,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        BrightBoxDetector.detect(frame, params)
    }
}

/// A 96×96 black image with a 64×64 textured "face" at (16, 16).
/// Pixel values stay within 20..=219, so `shift` up to 36 is lossless.
pub fn face_image(seed: u32, shift: u8) -> GrayImage {
    GrayImage::from_fn(96, 96, |x, y| {
        if !(16..80).contains(&x) || !(16..80).contains(&y) {
            return Luma([0]);
        }
        Luma([texture_pixel(seed, x, y) + shift])
    })
}

pub fn blank_image() -> GrayImage {
    GrayImage::new(96, 96)
}

pub fn png_bytes(image: GrayImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("in-memory PNG encode");
    buf.into_inner()
}

pub fn face_png(seed: u32, shift: u8) -> Vec<u8> {
    png_bytes(face_image(seed, shift))
}

pub fn blank_png() -> Vec<u8> {
    png_bytes(blank_image())
}

/// Drop an encoded image straight into `<root>/<id>/<id>.<index>.png`.
pub fn write_capture(capture_root: &Path, identity: u64, index: u32, bytes: &[u8]) {
    let dir = capture_root.join(identity.to_string());
    std::fs::create_dir_all(&dir).expect("create capture dir");
    std::fs::write(dir.join(format!("{identity}.{index}.png")), bytes).expect("write capture");
}
