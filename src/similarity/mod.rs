use image::{imageops::{self, FilterType}, GrayImage, ImageReader, Luma, RgbImage};
use serde::Serialize;
use std::path::Path;

use crate::{config::KeypointCfg, error::SimilarityError};

pub mod orb;
pub mod ssim;

pub use orb::{cross_check_match, KeypointMatch, OrbExtractor};

/// Result of keypoint matching. `NotApplicable` is returned when one of the
/// images has no descriptors at all, so there is nothing to match.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeypointOutcome {
    Matched {
        match_count: usize,
        keypoints1: usize,
        keypoints2: usize,
        matches: Vec<KeypointMatch>,
    },
    NotApplicable { reason: String },
}

pub struct SimilarityEngine {
    orb: OrbExtractor,
}

impl SimilarityEngine {
    pub fn new(keypoints: KeypointCfg) -> Self {
        Self { orb: OrbExtractor::new(keypoints) }
    }

    /// SSIM in [-1, 1] after grayscale conversion and resizing both images to
    /// the smaller width and the smaller height.
    pub fn structural_similarity(&self, a: &Path, b: &Path) -> Result<f64, SimilarityError> {
        let (a, b) = normalize_pair(load_gray(a)?, load_gray(b)?);
        ssim::mean_ssim(&a, &b)
    }

    pub fn keypoint_matches(&self, a: &Path, b: &Path) -> Result<KeypointOutcome, SimilarityError> {
        let (img1, img2) = (load_gray(a)?, load_gray(b)?);
        let (kp1, d1) = self.orb.detect_and_compute(&img1);
        let (kp2, d2) = self.orb.detect_and_compute(&img2);

        let missing = match (d1.is_empty(), d2.is_empty()) {
            (true, true) => Some("no descriptors found in either image"),
            (true, false) => Some("no descriptors found in image1"),
            (false, true) => Some("no descriptors found in image2"),
            (false, false) => None,
        };
        if let Some(reason) = missing {
            return Ok(KeypointOutcome::NotApplicable { reason: reason.to_string() });
        }

        let matches = cross_check_match(&d1, &d2);
        Ok(KeypointOutcome::Matched {
            match_count: matches.len(),
            keypoints1: kp1.len(),
            keypoints2: kp2.len(),
            matches,
        })
    }
}

/// Decodes an image from disk, detecting the format from its content rather
/// than its extension, and converts it to 8-bit Rec.601 luma.
pub fn load_gray(path: &Path) -> Result<GrayImage, SimilarityError> {
    let io_err = |source| SimilarityError::Io { path: path.to_path_buf(), source };
    let reader = ImageReader::open(path).map_err(io_err)?.with_guessed_format().map_err(io_err)?;
    let img = reader
        .decode()
        .map_err(|source| SimilarityError::Decode { path: path.to_path_buf(), source })?;
    Ok(luma_601(&img.to_rgb8()))
}

// `to_luma8` weights channels with Rec.709; PIL-style "L" conversion uses
// 299/587/114 in 16-bit fixed point.
fn luma_601(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = (r as u32 * 19_595 + g as u32 * 38_470 + b as u32 * 7_471 + 0x8000) >> 16;
        Luma([l as u8])
    })
}

/// Resizes both images to the element-wise minimum of their dimensions.
pub fn normalize_pair(a: GrayImage, b: GrayImage) -> (GrayImage, GrayImage) {
    let w = a.width().min(b.width());
    let h = a.height().min(b.height());
    let fit = |img: GrayImage| {
        if img.dimensions() == (w, h) { img } else { imageops::resize(&img, w, h, FilterType::CatmullRom) }
    };
    (fit(a), fit(b))
}
