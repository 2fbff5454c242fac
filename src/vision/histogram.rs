//! Hue/saturation histograms in the OpenCV 8-bit HSV convention
//! (hue 0..180, saturation 0..256).

use image::RgbImage;

/// Hue and saturation planes of an image.
pub struct HsPlanes {
    width: u32,
    height: u32,
    hue: Vec<u8>,
    saturation: Vec<u8>,
}

/// Converts one RGB pixel to 8-bit `(hue, saturation)`.
pub fn rgb_to_hs(r: u8, g: u8, b: u8) -> (u8, u8) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;
    if v <= 0.0 {
        return (0, 0);
    }
    let s = (255.0 * diff / v).round();
    if diff <= 0.0 {
        return (0, s as u8);
    }
    let mut h = if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    let h = (h / 2.0).round().min(179.0);
    (h as u8, s as u8)
}

impl HsPlanes {
    pub fn new(img: &RgbImage) -> Self {
        let n = (img.width() * img.height()) as usize;
        let mut hue = Vec::with_capacity(n);
        let mut saturation = Vec::with_capacity(n);
        for p in img.pixels() {
            let (h, s) = rgb_to_hs(p[0], p[1], p[2]);
            hue.push(h);
            saturation.push(s);
        }
        Self {
            width: img.width(),
            height: img.height(),
            hue,
            saturation,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Histogram of the `w × h` window at `(x, y)`, min-max normalized to 0..255.
    pub fn histogram(&self, x: u32, y: u32, w: u32, h: u32, bins: HistogramBins) -> Histogram {
        let mut counts = vec![0.0f32; bins.len()];
        let stride = self.width as usize;
        for row in y as usize..(y + h) as usize {
            let start = row * stride + x as usize;
            let end = start + w as usize;
            for (&hue, &sat) in self.hue[start..end].iter().zip(&self.saturation[start..end]) {
                counts[bins.index(hue, sat)] += 1.0;
            }
        }
        Histogram::normalized(counts)
    }

    pub fn full_histogram(&self, bins: HistogramBins) -> Histogram {
        self.histogram(0, 0, self.width, self.height, bins)
    }
}

/// Bin layout of a 2D hue/saturation histogram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistogramBins {
    pub hue: u32,
    pub saturation: u32,
}

impl HistogramBins {
    pub fn new(hue: u32, saturation: u32) -> Self {
        Self {
            hue: hue.clamp(1, 180),
            saturation: saturation.clamp(1, 256),
        }
    }

    fn len(&self) -> usize {
        (self.hue * self.saturation) as usize
    }

    fn index(&self, hue: u8, sat: u8) -> usize {
        let hb = (u32::from(hue) * self.hue / 180).min(self.hue - 1);
        let sb = (u32::from(sat) * self.saturation / 256).min(self.saturation - 1);
        (hb * self.saturation + sb) as usize
    }
}

impl Default for HistogramBins {
    fn default() -> Self {
        Self::new(30, 32)
    }
}

#[derive(Clone, Debug)]
pub struct Histogram {
    bins: Vec<f32>,
}

impl Histogram {
    fn normalized(mut bins: Vec<f32>) -> Self {
        let min = bins.iter().copied().fold(f32::INFINITY, f32::min);
        let max = bins.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;
        if range > 0.0 {
            for v in &mut bins {
                *v = (*v - min) * 255.0 / range;
            }
        } else {
            bins.iter_mut().for_each(|v| *v = 0.0);
        }
        Self { bins }
    }

    /// Pearson correlation of the bin values, in `[-1, 1]`.
    ///
    /// Zero when either histogram is constant or the layouts differ.
    pub fn correlation(&self, other: &Histogram) -> f64 {
        if self.bins.len() != other.bins.len() || self.bins.is_empty() {
            return 0.0;
        }
        let n = self.bins.len() as f64;
        let mean_a = self.bins.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let mean_b = other.bins.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let (mut num, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
        for (&a, &b) in self.bins.iter().zip(&other.bins) {
            let da = f64::from(a) - mean_a;
            let db = f64::from(b) - mean_b;
            num += da * db;
            var_a += da * da;
            var_b += db * db;
        }
        let denom = (var_a * var_b).sqrt();
        if denom <= f64::EPSILON {
            return 0.0;
        }
        num / denom
    }
}

/// Best window position by histogram correlation, scanned on a coarse grid.
///
/// The step is `max(h/4, w/4, 10)`. Returns the top-left and the score.
pub fn best_window(
    frame: &HsPlanes,
    template: &Histogram,
    tw: u32,
    th: u32,
    bins: HistogramBins,
) -> Option<(u32, u32, f64)> {
    if tw == 0 || th == 0 || tw > frame.width || th > frame.height {
        return None;
    }
    let step = (th / 4).max(tw / 4).max(10) as usize;
    let mut best: Option<(u32, u32, f64)> = None;
    // Inclusive: a window flush with the right or bottom edge is a valid placement
    for y in (0..=frame.height - th).step_by(step) {
        for x in (0..=frame.width - tw).step_by(step) {
            let score = template.correlation(&frame.histogram(x, y, tw, th, bins));
            if best.is_none_or(|(_, _, b)| score > b) {
                best = Some((x, y, score));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_hs_primaries() {
        assert_eq!(rgb_to_hs(255, 0, 0), (0, 255));
        assert_eq!(rgb_to_hs(0, 255, 0), (60, 255));
        assert_eq!(rgb_to_hs(0, 0, 255), (120, 255));
        assert_eq!(rgb_to_hs(128, 128, 128), (0, 0));
        assert_eq!(rgb_to_hs(0, 0, 0), (0, 0));
    }

    #[test]
    fn test_identical_histograms_correlate() {
        let img = RgbImage::from_fn(20, 20, |x, _| {
            if x < 10 { Rgb([200, 40, 40]) } else { Rgb([40, 40, 200]) }
        });
        let planes = HsPlanes::new(&img);
        let bins = HistogramBins::default();
        let a = planes.full_histogram(bins);
        let b = planes.full_histogram(bins);
        assert!((a.correlation(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_best_window_finds_color_patch() {
        let mut frame = RgbImage::from_pixel(120, 80, Rgb([30, 160, 30]));
        let patch = RgbImage::from_fn(20, 20, |x, _| {
            if x % 4 < 2 { Rgb([220, 30, 30]) } else { Rgb([230, 200, 20]) }
        });
        image::imageops::replace(&mut frame, &patch, 60, 40);

        let bins = HistogramBins::default();
        let template = HsPlanes::new(&patch).full_histogram(bins);
        let (x, y, score) =
            best_window(&HsPlanes::new(&frame), &template, 20, 20, bins).unwrap();
        assert_eq!((x, y), (60, 40), "grid step 10 lands on the patch");
        assert!(score > 0.99, "score {}", score);
    }

    #[test]
    fn test_best_window_reaches_last_position() {
        let patch = RgbImage::from_fn(20, 20, |x, _| {
            if x % 4 < 2 { Rgb([220, 30, 30]) } else { Rgb([230, 200, 20]) }
        });
        let bins = HistogramBins::default();
        let template = HsPlanes::new(&patch).full_histogram(bins);

        // Flush with the bottom-right corner: (100, 60) is the last grid point
        let mut frame = RgbImage::from_pixel(120, 80, Rgb([30, 160, 30]));
        image::imageops::replace(&mut frame, &patch, 100, 60);
        let (x, y, score) = best_window(&HsPlanes::new(&frame), &template, 20, 20, bins).unwrap();
        assert_eq!((x, y), (100, 60));
        assert!(score > 0.99, "score {}", score);

        // A frame the template's own size has exactly one placement
        let (x, y, _) = best_window(&HsPlanes::new(&patch), &template, 20, 20, bins).unwrap();
        assert_eq!((x, y), (0, 0));
    }
}
