//! FAST corners with BRIEF-style binary descriptors.

use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;

/// Half-size of the square patch sampled around each keypoint.
pub const PATCH_RADIUS: i32 = 15;

/// Descriptor length in bits.
pub const DESCRIPTOR_BITS: usize = 256;

const PATTERN_SEED: u64 = 0x0b51_4c0d_e5ee_d5ee;

/// Smoothing applied before sampling intensity pairs.
const PATCH_SIGMA: f32 = 2.0;

/// Fewest keypoints on either side for matching to be attempted.
const MIN_KEYPOINTS: usize = 2;

/// Fewest matches kept after sorting by distance.
const MIN_KEPT_MATCHES: usize = 10;

pub type Descriptor = [u64; DESCRIPTOR_BITS / 64];

/// Fixed sampling pattern: `(x1, y1, x2, y2)` offsets within the patch.
fn pattern() -> &'static [[i8; 4]] {
    static PATTERN: OnceLock<Vec<[i8; 4]>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let r = PATCH_RADIUS as i8;
        (0..DESCRIPTOR_BITS)
            .map(|_| {
                [
                    rng.random_range(-r..=r),
                    rng.random_range(-r..=r),
                    rng.random_range(-r..=r),
                    rng.random_range(-r..=r),
                ]
            })
            .collect()
    })
}

pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Keypoint positions and their descriptors, index-aligned.
#[derive(Clone, Debug, Default)]
pub struct Features {
    points: Vec<(u32, u32)>,
    descriptors: Vec<Descriptor>,
}

impl Features {
    /// Detects up to `max_features` of the strongest FAST-9 corners far
    /// enough from the border to be described.
    pub fn extract(gray: &GrayImage, fast_threshold: u8, max_features: usize) -> Self {
        let (w, h) = gray.dimensions();
        let margin = PATCH_RADIUS as u32;
        if w <= 2 * margin || h <= 2 * margin {
            return Self::default();
        }

        let mut corners: Vec<_> = corners_fast9(gray, fast_threshold)
            .into_iter()
            .filter(|c| c.x >= margin && c.y >= margin && c.x < w - margin && c.y < h - margin)
            .collect();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners.truncate(max_features);

        let smooth = gaussian_blur_f32(gray, PATCH_SIGMA);
        let mut features = Self::default();
        for corner in corners {
            features.points.push((corner.x, corner.y));
            features.descriptors.push(describe(&smooth, corner.x, corner.y));
        }
        features
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> (u32, u32) {
        self.points[index]
    }
}

fn describe(smooth: &GrayImage, x: u32, y: u32) -> Descriptor {
    let mut desc: Descriptor = [0; DESCRIPTOR_BITS / 64];
    let at = |dx: i8, dy: i8| {
        let px = (x as i32 + i32::from(dx)) as u32;
        let py = (y as i32 + i32::from(dy)) as u32;
        smooth.get_pixel(px, py)[0]
    };
    for (bit, &[x1, y1, x2, y2]) in pattern().iter().enumerate() {
        if at(x1, y1) < at(x2, y2) {
            desc[bit / 64] |= 1 << (bit % 64);
        }
    }
    desc
}

/// A mutual nearest-neighbour pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureMatch {
    pub template: usize,
    pub frame: usize,
    pub distance: u32,
}

fn nearest(desc: &Descriptor, among: &[Descriptor]) -> Option<(usize, u32)> {
    among
        .iter()
        .enumerate()
        .map(|(i, other)| (i, hamming(desc, other)))
        .min_by_key(|&(_, d)| d)
}

/// Brute-force Hamming matching keeping only cross-checked pairs, sorted by
/// distance.
pub fn cross_check(template: &Features, frame: &Features) -> Vec<FeatureMatch> {
    let mut matches: Vec<FeatureMatch> = template
        .descriptors
        .iter()
        .enumerate()
        .filter_map(|(t, desc)| {
            let (f, distance) = nearest(desc, &frame.descriptors)?;
            let (back, _) = nearest(&frame.descriptors[f], &template.descriptors)?;
            (back == t).then_some(FeatureMatch {
                template: t,
                frame: f,
                distance,
            })
        })
        .collect();
    matches.sort_by_key(|m| (m.distance, m.template));
    matches
}

/// Locates the template by keypoint matching.
///
/// Keeps the best `max(n/4, 10)` matches and accepts when they cover at least
/// `threshold × factor` of the template's keypoints. Returns the mean frame
/// position of the kept matches and the coverage ratio.
pub fn locate(template: &Features, frame: &Features, threshold: f64, factor: f64) -> Option<(i32, i32, f64)> {
    if template.len() < MIN_KEYPOINTS || frame.len() < MIN_KEYPOINTS {
        return None;
    }
    let matches = cross_check(template, frame);
    if matches.is_empty() {
        return None;
    }
    let keep = (matches.len() / 4).max(MIN_KEPT_MATCHES).min(matches.len());
    let kept = &matches[..keep];

    let ratio = kept.len() as f64 / template.len() as f64;
    if ratio < threshold * factor {
        log::trace!("Keypoint ratio {:.3} below {:.3}", ratio, threshold * factor);
        return None;
    }

    let (sx, sy) = kept.iter().fold((0u64, 0u64), |(sx, sy), m| {
        let (x, y) = frame.point(m.frame);
        (sx + u64::from(x), sy + u64::from(y))
    });
    let n = kept.len() as u64;
    Some(((sx / n) as i32, (sy / n) as i32, ratio))
}
