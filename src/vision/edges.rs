//! Edge maps for the scale-tolerant matching stage.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;

use super::matching::{search, Hit, Planes};

/// Scaled templates with a side below this are skipped.
pub const MIN_SCALED_SIDE: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeParams {
    pub canny_low: f32,
    pub canny_high: f32,
    /// Gaussian smoothing of edge maps; 0 disables it.
    pub blur_sigma: f32,
}

/// Canny edge map without smoothing.
pub fn edge_map(gray: &GrayImage, params: EdgeParams) -> GrayImage {
    canny(gray, params.canny_low, params.canny_high)
}

pub fn smooth(edges: &GrayImage, sigma: f32) -> GrayImage {
    if sigma > 0.0 {
        gaussian_blur_f32(edges, sigma)
    } else {
        edges.clone()
    }
}

/// `steps` values evenly spaced over `[min, max]`, both ends included.
pub fn linspace(min: f64, max: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![min],
        _ => (0..steps)
            .map(|i| min + (max - min) * i as f64 / (steps - 1) as f64)
            .collect(),
    }
}

/// Best placement across scales: the hit, the scaled template size, and the scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaledHit {
    pub hit: Hit,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

/// Matches the template edge map against the (already smoothed) frame edge
/// map at every scale and keeps the best score.
pub fn best_scaled_match(
    frame_edges: &Planes,
    template_edges: &GrayImage,
    scales: &[f64],
    blur_sigma: f32,
) -> Option<ScaledHit> {
    let (tw, th) = template_edges.dimensions();
    let mut best: Option<ScaledHit> = None;
    for &scale in scales {
        let w = (f64::from(tw) * scale) as u32;
        let h = (f64::from(th) * scale) as u32;
        if w < MIN_SCALED_SIDE || h < MIN_SCALED_SIDE {
            continue;
        }
        if w > frame_edges.width() || h > frame_edges.height() {
            continue;
        }

        let resized = imageops::resize(template_edges, w, h, FilterType::Triangle);
        let template = Planes::from_gray(&smooth(&resized, blur_sigma));
        let Some(hit) = search(frame_edges, &template) else {
            continue;
        };
        log::trace!("Scale {:.3} ({}x{}): {:.3}", scale, w, h, hit.score);
        if best.is_none_or(|b| hit.score > b.hit.score) {
            best = Some(ScaledHit {
                hit,
                width: w,
                height: h,
                scale,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_includes_ends() {
        let v = linspace(0.5, 1.5, 15);
        assert_eq!(v.len(), 15);
        assert!((v[0] - 0.5).abs() < 1e-12);
        assert!((v[14] - 1.5).abs() < 1e-12);
        assert!((v[7] - 1.0).abs() < 1e-12);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
    }

    #[test]
    fn test_tiny_scales_are_skipped() {
        let frame = Planes::from_gray(&GrayImage::new(50, 50));
        let template = GrayImage::new(12, 12);
        // 12 * 0.5 = 6 px, too small to match
        assert!(best_scaled_match(&frame, &template, &[0.5], 1.0).is_none());
    }
}
