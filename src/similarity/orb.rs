//! Oriented FAST keypoints with rotated BRIEF descriptors, plus cross-checked
//! brute-force Hamming matching.

use image::{imageops::{self, FilterType}, GrayImage};
use imageproc::{corners::{corners_fast9, Corner}, filter::gaussian_blur_f32};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

use crate::config::KeypointCfg;

/// Radius of the patch used for orientation and descriptor sampling.
const HALF_PATCH: i32 = 15;
/// Keypoints closer than this to the border are dropped.
const EDGE: u32 = HALF_PATCH as u32 + 1;
/// Sampling points stay inside this radius so rotated points remain in the patch.
const SAMPLE_RADIUS: i32 = 13;
const DESCRIPTOR_BITS: usize = 256;
const BLUR_SIGMA: f32 = 2.0;
const PATTERN_SEED: u64 = 0x0b5e_55ed;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in level-0 pixel coordinates.
    pub x: f32,
    pub y: f32,
    pub level: u32,
    /// Orientation in radians.
    pub angle: f32,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| (a ^ b).count_ones()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeypointMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

#[derive(Debug, Clone, Copy)]
struct TestPair { x1: f32, y1: f32, x2: f32, y2: f32 }

pub struct OrbExtractor {
    cfg: KeypointCfg,
    pattern: Vec<TestPair>,
}

impl OrbExtractor {
    pub fn new(cfg: KeypointCfg) -> Self {
        Self { cfg, pattern: sampling_pattern() }
    }

    /// Detects up to `max_features` keypoints over the scale pyramid and
    /// computes one descriptor per keypoint. Both vectors share indices.
    pub fn detect_and_compute(&self, img: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let levels = self.pyramid(img);
        let quotas = level_quotas(&levels, self.cfg.max_features);

        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (level, (level_img, quota)) in levels.iter().zip(quotas).enumerate() {
            if quota == 0 { continue; }
            let scale = self.cfg.scale_factor.powi(level as i32);
            let blurred = gaussian_blur_f32(level_img, BLUR_SIGMA);

            for c in self.detect(level_img, quota) {
                let angle = orientation(level_img, c.x, c.y);
                descriptors.push(self.describe(&blurred, c.x, c.y, angle));
                keypoints.push(Keypoint {
                    x: c.x as f32 * scale,
                    y: c.y as f32 * scale,
                    level: level as u32,
                    angle,
                    score: c.score,
                });
            }
        }
        (keypoints, descriptors)
    }

    fn pyramid(&self, img: &GrayImage) -> Vec<GrayImage> {
        let min_side = 2 * EDGE + 1;
        let mut out = Vec::new();
        for level in 0..self.cfg.levels.max(1) {
            let scale = self.cfg.scale_factor.powi(level as i32);
            let w = (img.width() as f32 / scale).round() as u32;
            let h = (img.height() as f32 / scale).round() as u32;
            if w < min_side || h < min_side { break; }
            if level == 0 {
                out.push(img.clone());
            } else {
                out.push(imageops::resize(img, w, h, FilterType::Triangle));
            }
        }
        out
    }

    /// FAST-9 corners away from the border, 3x3 non-maximum suppressed,
    /// strongest first.
    fn detect(&self, img: &GrayImage, quota: usize) -> Vec<Corner> {
        let (w, h) = img.dimensions();
        let corners: Vec<Corner> = corners_fast9(img, self.cfg.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= EDGE && c.y >= EDGE && c.x < w - EDGE && c.y < h - EDGE)
            .collect();

        let mut scores = vec![0f32; (w * h) as usize];
        for c in &corners {
            scores[(c.y * w + c.x) as usize] = c.score;
        }
        let mut kept: Vec<Corner> = corners
            .into_iter()
            .filter(|c| {
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 { continue; }
                        let nx = (c.x as i32 + dx) as u32;
                        let ny = (c.y as i32 + dy) as u32;
                        if scores[(ny * w + nx) as usize] > c.score { return false; }
                    }
                }
                true
            })
            .collect();

        kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        kept.truncate(quota);
        kept
    }

    fn describe(&self, blurred: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let sample = |px: f32, py: f32| -> u8 {
            let rx = (cos * px - sin * py).round() as i32;
            let ry = (sin * px + cos * py).round() as i32;
            blurred.get_pixel((x as i32 + rx) as u32, (y as i32 + ry) as u32)[0]
        };

        let mut bits = [0u64; 4];
        for (i, p) in self.pattern.iter().enumerate() {
            if sample(p.x1, p.y1) < sample(p.x2, p.y2) {
                bits[i / 64] |= 1 << (i % 64);
            }
        }
        Descriptor(bits)
    }
}

/// Splits the feature budget across levels in proportion to their area.
/// Rounding leftovers go to level 0.
fn level_quotas(levels: &[GrayImage], max_features: usize) -> Vec<usize> {
    let areas: Vec<f64> = levels.iter().map(|l| l.width() as f64 * l.height() as f64).collect();
    let total: f64 = areas.iter().sum();
    if total == 0.0 { return vec![0; levels.len()]; }

    let mut quotas: Vec<usize> = areas.iter().map(|a| (max_features as f64 * a / total).floor() as usize).collect();
    let assigned: usize = quotas.iter().sum();
    if let Some(first) = quotas.first_mut() {
        *first += max_features.saturating_sub(assigned);
    }
    quotas
}

/// Intensity-centroid angle over a circular patch.
fn orientation(img: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m01, mut m10) = (0i64, 0i64);
    for dy in -HALF_PATCH..=HALF_PATCH {
        let span = ((HALF_PATCH * HALF_PATCH - dy * dy) as f32).sqrt() as i32;
        for dx in -span..=span {
            let v = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

fn sampling_pattern() -> Vec<TestPair> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let mut point = move || loop {
        let x = rng.random_range(-SAMPLE_RADIUS..=SAMPLE_RADIUS);
        let y = rng.random_range(-SAMPLE_RADIUS..=SAMPLE_RADIUS);
        if x * x + y * y <= SAMPLE_RADIUS * SAMPLE_RADIUS {
            return (x as f32, y as f32);
        }
    };
    (0..DESCRIPTOR_BITS)
        .map(|_| {
            let (x1, y1) = point();
            let (x2, y2) = point();
            TestPair { x1, y1, x2, y2 }
        })
        .collect()
}

/// Mutual nearest neighbours under Hamming distance, best first.
/// Ties pick the lowest index.
pub fn cross_check_match(query: &[Descriptor], train: &[Descriptor]) -> Vec<KeypointMatch> {
    let best_for_train: Vec<Option<usize>> = train.iter().map(|t| nearest(t, query).map(|(i, _)| i)).collect();

    let mut matches: Vec<KeypointMatch> = query
        .iter()
        .enumerate()
        .filter_map(|(qi, q)| {
            let (ti, distance) = nearest(q, train)?;
            (best_for_train[ti] == Some(qi)).then_some(KeypointMatch { query_idx: qi, train_idx: ti, distance })
        })
        .collect();
    matches.sort_by_key(|m| m.distance);
    matches
}

fn nearest(d: &Descriptor, pool: &[Descriptor]) -> Option<(usize, u32)> {
    pool.iter()
        .enumerate()
        .map(|(i, p)| (i, d.hamming(p)))
        .min_by_key(|&(i, dist)| (dist, i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn blocks(w: u32, h: u32, salt: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let cell = (x / 8).wrapping_mul(7919) ^ (y / 8).wrapping_mul(104_729) ^ salt;
            Luma([(cell.wrapping_mul(2_654_435_761) >> 24) as u8])
        })
    }

    fn extractor() -> OrbExtractor {
        OrbExtractor::new(KeypointCfg::default())
    }

    #[test]
    fn hamming_counts_differing_bits() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 1 << 63]);
        assert_eq!(a.hamming(&a), 0);
        assert_eq!(a.hamming(&b), 3 + 64 + 1);
        assert_eq!(b.hamming(&a), a.hamming(&b));
    }

    #[test]
    fn cross_check_keeps_only_mutual_pairs() {
        let q = vec![Descriptor([0, 0, 0, 0]), Descriptor([0b1, 0, 0, 0])];
        // Both queries are nearest to train[0]; only query 0 is train[0]'s best.
        let t = vec![Descriptor([0, 0, 0, 0]), Descriptor([u64::MAX, 0, 0, 0])];
        let m = cross_check_match(&q, &t);
        assert_eq!(m, vec![KeypointMatch { query_idx: 0, train_idx: 0, distance: 0 }]);
    }

    #[test]
    fn matches_are_sorted_by_distance() {
        let q = vec![Descriptor([0b111, 0, 0, 0]), Descriptor([0, 0, 0, 1 << 40])];
        let t = vec![Descriptor([0b110, 0, 0, 0]), Descriptor([0, 0, 0, 1 << 40])];
        let m = cross_check_match(&q, &t);
        assert_eq!(m.len(), 2);
        assert_eq!(m[0], KeypointMatch { query_idx: 1, train_idx: 1, distance: 0 });
        assert_eq!(m[1], KeypointMatch { query_idx: 0, train_idx: 0, distance: 1 });
    }

    #[test]
    fn empty_sets_match_nothing() {
        let d = vec![Descriptor([1, 2, 3, 4])];
        assert!(cross_check_match(&[], &d).is_empty());
        assert!(cross_check_match(&d, &[]).is_empty());
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(96, 96, Luma([128]));
        let (kps, descs) = extractor().detect_and_compute(&img);
        assert!(kps.is_empty());
        assert!(descs.is_empty());
    }

    #[test]
    fn textured_image_yields_bounded_keypoints() {
        let img = blocks(160, 120, 0);
        let cfg = KeypointCfg { max_features: 40, ..KeypointCfg::default() };
        let (kps, descs) = OrbExtractor::new(cfg).detect_and_compute(&img);
        assert!(!kps.is_empty());
        assert!(kps.len() <= 40);
        assert_eq!(kps.len(), descs.len());
        for k in &kps {
            assert!(k.x >= 0.0 && k.x < 160.0 && k.y >= 0.0 && k.y < 120.0);
        }
    }

    #[test]
    fn same_image_matches_itself_at_zero_distance() {
        let img = blocks(128, 128, 3);
        let ex = extractor();
        let (_, d1) = ex.detect_and_compute(&img);
        let (_, d2) = ex.detect_and_compute(&img);
        assert_eq!(d1, d2);

        let m = cross_check_match(&d1, &d2);
        assert!(!m.is_empty());
        assert!(m.iter().all(|m| m.distance == 0));
    }

    #[test]
    fn rotated_copy_still_matches() {
        let ex = extractor();
        let img = blocks(200, 200, 5);
        let rotated = image::imageops::rotate90(&img);
        let unrelated = blocks(200, 200, 9);

        let (_, d) = ex.detect_and_compute(&img);
        let (_, d_rot) = ex.detect_and_compute(&rotated);
        let (_, d_other) = ex.detect_and_compute(&unrelated);
        let close = |m: &[KeypointMatch]| m.iter().filter(|m| m.distance < 40).count();

        let rot = close(&cross_check_match(&d, &d_rot));
        let other = close(&cross_check_match(&d, &d_other));
        assert!(rot >= 30, "only {rot} close matches against the rotated copy");
        assert!(rot > 2 * other, "rotated {rot} vs unrelated {other}");
    }

    #[test]
    fn tiny_image_is_skipped_by_pyramid() {
        let img = blocks(20, 20, 1);
        let (kps, _) = extractor().detect_and_compute(&img);
        assert!(kps.is_empty());
    }

    #[test]
    fn quotas_sum_to_budget() {
        let levels = vec![GrayImage::new(100, 100), GrayImage::new(83, 83), GrayImage::new(69, 69)];
        let q = level_quotas(&levels, 500);
        assert_eq!(q.iter().sum::<usize>(), 500);
        assert!(q[0] >= q[1] && q[1] >= q[2]);
    }

    #[test]
    fn pattern_stays_inside_patch() {
        let p = sampling_pattern();
        assert_eq!(p.len(), DESCRIPTOR_BITS);
        let r = SAMPLE_RADIUS as f32;
        assert!(p.iter().all(|t| t.x1 * t.x1 + t.y1 * t.y1 <= r * r && t.x2 * t.x2 + t.y2 * t.y2 <= r * r));
    }
}
