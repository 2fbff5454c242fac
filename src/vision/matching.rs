//! Zero-mean normalized cross-correlation (`TM_CCOEFF_NORMED`).
//!
//! Scores are in `[-1, 1]`; 1 means the window is an affine brightness
//! transform of the template. Window sums come from integral images so only
//! the cross term costs `template pixels` per position. Searches too large to
//! evaluate densely run coarse-to-fine on a downsampled pyramid level.

use image::{GrayImage, RgbImage};

/// Positions × template pixels × channels above which the pyramid is used.
pub const DIRECT_SEARCH_BUDGET: u64 = 25_000_000;

/// Smallest template side allowed at a coarse pyramid level.
const MIN_COARSE_TEMPLATE: u32 = 12;

/// Coarse peaks refined at full resolution by [`search`].
const COARSE_PEAKS: usize = 5;

/// Coarse candidates refined by [`search_all`].
const COARSE_CANDIDATES: usize = 64;

/// Coarse scores may sit this far below the final threshold.
const COARSE_SLACK: f32 = 0.2;

/// Tolerance for float error when comparing against a threshold.
pub const SCORE_EPSILON: f64 = 1e-6;

pub fn passes(score: f32, threshold: f64) -> bool {
    f64::from(score) + SCORE_EPSILON >= threshold
}

/// Planar `f32` copy of an image, one plane per channel.
#[derive(Clone, Debug)]
pub struct Planes {
    width: u32,
    height: u32,
    data: Vec<Vec<f32>>,
}

impl Planes {
    pub fn from_rgb(img: &RgbImage) -> Self {
        let n = (img.width() * img.height()) as usize;
        let mut data = vec![Vec::with_capacity(n); 3];
        for p in img.pixels() {
            for (c, plane) in data.iter_mut().enumerate() {
                plane.push(f32::from(p[c]));
            }
        }
        Self {
            width: img.width(),
            height: img.height(),
            data,
        }
    }

    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: vec![img.as_raw().iter().map(|&v| f32::from(v)).collect()],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.data.len()
    }

    /// Box-averages `factor × factor` blocks; trailing partial blocks are dropped.
    pub fn downsample(&self, factor: u32) -> Planes {
        let w = self.width / factor;
        let h = self.height / factor;
        let src_w = self.width as usize;
        let f = factor as usize;
        let area = (f * f) as f32;
        let data = self
            .data
            .iter()
            .map(|plane| {
                let mut out = Vec::with_capacity((w * h) as usize);
                for y in 0..h as usize {
                    for x in 0..w as usize {
                        let mut sum = 0.0f32;
                        for dy in 0..f {
                            let row = (y * f + dy) * src_w + x * f;
                            sum += plane[row..row + f].iter().sum::<f32>();
                        }
                        out.push(sum / area);
                    }
                }
                out
            })
            .collect();
        Planes {
            width: w,
            height: h,
            data,
        }
    }
}

/// Summed-area tables of values and squared values, `(w+1) × (h+1)`.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(plane: &[f32], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0.0; stride * (height + 1)];
        let mut sq = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..width {
                let v = f64::from(plane[y * width + x]);
                row_sum += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row_sum;
                sq[i] = sq[i - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sq[d] - self.sq[b] - self.sq[c] + self.sq[a],
        )
    }
}

/// Scores one template against every placement inside one image.
pub struct Correlator<'a> {
    image: &'a Planes,
    integrals: Vec<Integral>,
    template: Vec<Vec<f32>>,
    tw: u32,
    th: u32,
    template_energy: f64,
}

impl<'a> Correlator<'a> {
    /// `None` when the template is empty, larger than the image, or the
    /// channel counts differ.
    pub fn new(image: &'a Planes, template: &Planes) -> Option<Self> {
        let (tw, th) = (template.width, template.height);
        if tw == 0 || th == 0 || tw > image.width || th > image.height {
            return None;
        }
        if template.channels() != image.channels() {
            return None;
        }

        let n = f64::from(tw * th);
        let mut energy = 0.0;
        let centered: Vec<Vec<f32>> = template
            .data
            .iter()
            .map(|plane| {
                let mean = plane.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
                plane
                    .iter()
                    .map(|&v| {
                        let d = f64::from(v) - mean;
                        energy += d * d;
                        d as f32
                    })
                    .collect()
            })
            .collect();

        let integrals = image
            .data
            .iter()
            .map(|plane| Integral::new(plane, image.width as usize, image.height as usize))
            .collect();

        Some(Self {
            image,
            integrals,
            template: centered,
            tw,
            th,
            template_energy: energy,
        })
    }

    /// Number of placements along each axis.
    pub fn positions(&self) -> (u32, u32) {
        (self.image.width - self.tw + 1, self.image.height - self.th + 1)
    }

    pub fn work(&self) -> u64 {
        let (nx, ny) = self.positions();
        u64::from(nx) * u64::from(ny) * u64::from(self.tw * self.th) * self.template.len() as u64
    }

    /// Score with the template's top-left at `(x, y)`.
    pub fn score(&self, x: u32, y: u32) -> f32 {
        let (tw, th) = (self.tw as usize, self.th as usize);
        let (x, y) = (x as usize, y as usize);
        let iw = self.image.width as usize;
        let n = (tw * th) as f64;

        let mut cross = 0.0f64;
        let mut variance = 0.0f64;
        for (c, tplane) in self.template.iter().enumerate() {
            let (s, sq) = self.integrals[c].window(x, y, tw, th);
            variance += sq - s * s / n;

            let plane = &self.image.data[c];
            for ty in 0..th {
                let row = &plane[(y + ty) * iw + x..(y + ty) * iw + x + tw];
                let trow = &tplane[ty * tw..(ty + 1) * tw];
                cross += row
                    .iter()
                    .zip(trow)
                    .map(|(&a, &b)| f64::from(a) * f64::from(b))
                    .sum::<f64>();
            }
        }

        // Flat windows or flat templates carry no pattern to correlate
        if variance <= 1e-6 * n || self.template_energy <= 1e-6 * n {
            return 0.0;
        }
        let denom = (variance * self.template_energy).sqrt();
        (cross / denom).clamp(-1.0, 1.0) as f32
    }

    pub fn score_map(&self) -> ScoreMap {
        let (nx, ny) = self.positions();
        let mut scores = Vec::with_capacity((nx * ny) as usize);
        for y in 0..ny {
            for x in 0..nx {
                scores.push(self.score(x, y));
            }
        }
        ScoreMap {
            width: nx,
            height: ny,
            scores,
        }
    }

    /// Best score in the clamped window `[x0, x1] × [y0, y1]`.
    fn best_in(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Option<Hit> {
        let (nx, ny) = self.positions();
        let mut best: Option<Hit> = None;
        for y in y0..=y1.min(ny - 1) {
            for x in x0..=x1.min(nx - 1) {
                let score = self.score(x, y);
                if best.is_none_or(|b| score > b.score) {
                    best = Some(Hit { x, y, score });
                }
            }
        }
        best
    }
}

/// Top-left placement of a template and its score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

/// Dense scores, row-major over placements.
pub struct ScoreMap {
    width: u32,
    height: u32,
    scores: Vec<f32>,
}

impl ScoreMap {
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.scores[(y * self.width + x) as usize]
    }

    pub fn best(&self) -> Option<Hit> {
        self.iter().fold(None, |best: Option<Hit>, hit| {
            if best.is_none_or(|b| hit.score > b.score) {
                Some(hit)
            } else {
                best
            }
        })
    }

    /// Row-major iterator over every placement.
    pub fn iter(&self) -> impl Iterator<Item = Hit> + '_ {
        self.scores.iter().enumerate().map(move |(i, &score)| Hit {
            x: i as u32 % self.width,
            y: i as u32 / self.width,
            score,
        })
    }

    /// Highest-scoring placements at least `radius` apart on some axis.
    pub fn peaks(&self, count: usize, radius: u32, min_score: f32) -> Vec<Hit> {
        let mut candidates: Vec<Hit> = self.iter().filter(|h| h.score >= min_score).collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut peaks: Vec<Hit> = Vec::with_capacity(count);
        for hit in candidates {
            if peaks.len() >= count {
                break;
            }
            let near = peaks
                .iter()
                .any(|p| p.x.abs_diff(hit.x) < radius && p.y.abs_diff(hit.y) < radius);
            if !near {
                peaks.push(hit);
            }
        }
        peaks
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Chooses a pyramid factor for searches over the direct budget.
fn pyramid_factor(image: &Planes, template: &Planes, work: u64) -> Option<u32> {
    if work <= DIRECT_SEARCH_BUDGET {
        return None;
    }
    let min_side = template.width.min(template.height);
    let mut chosen = None;
    for factor in [2u32, 4] {
        if min_side / factor < MIN_COARSE_TEMPLATE
            || image.width / factor < template.width / factor
            || image.height / factor < template.height / factor
        {
            break;
        }
        chosen = Some(factor);
        if work / u64::from(factor.pow(4)) <= DIRECT_SEARCH_BUDGET {
            break;
        }
    }
    chosen
}

/// Coarse placements mapped back to full-resolution search windows.
fn coarse_candidates(
    image: &Planes,
    template: &Planes,
    factor: u32,
    count: usize,
    min_score: f32,
) -> Option<Vec<Hit>> {
    let small_image = image.downsample(factor);
    let small_template = template.downsample(factor);
    let coarse = Correlator::new(&small_image, &small_template)?;
    let map = coarse.score_map();
    let radius = (small_template.width.min(small_template.height) / 2).max(1);
    Some(map.peaks(count, radius, min_score))
}

fn refine(full: &Correlator, coarse: Hit, factor: u32) -> Option<Hit> {
    let cx = coarse.x * factor;
    let cy = coarse.y * factor;
    full.best_in(
        cx.saturating_sub(factor),
        cy.saturating_sub(factor),
        cx + factor,
        cy + factor,
    )
}

/// Best placement of `template` inside `image`.
pub fn search(image: &Planes, template: &Planes) -> Option<Hit> {
    let full = Correlator::new(image, template)?;
    match pyramid_factor(image, template, full.work()) {
        None => full.score_map().best(),
        Some(factor) => {
            let peaks = coarse_candidates(image, template, factor, COARSE_PEAKS, f32::MIN)?;
            log::trace!("Pyramid search x{}: {} coarse peaks", factor, peaks.len());
            peaks
                .into_iter()
                .filter_map(|peak| refine(&full, peak, factor))
                .max_by(|a, b| a.score.total_cmp(&b.score))
        }
    }
}

/// Every placement scoring at least `threshold`, in row-major order.
///
/// Pyramid searches report one refined placement per coarse candidate.
pub fn search_all(image: &Planes, template: &Planes, threshold: f64) -> Vec<Hit> {
    let Some(full) = Correlator::new(image, template) else {
        return Vec::new();
    };
    let mut hits: Vec<Hit> = match pyramid_factor(image, template, full.work()) {
        None => full
            .score_map()
            .iter()
            .filter(|h| passes(h.score, threshold))
            .collect(),
        Some(factor) => {
            let floor = threshold as f32 - COARSE_SLACK;
            coarse_candidates(image, template, factor, COARSE_CANDIDATES, floor)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|peak| refine(&full, peak, factor))
                .filter(|h| passes(h.score, threshold))
                .collect()
        }
    };
    hits.sort_by_key(|h| (h.y, h.x));
    hits.dedup_by_key(|h| (h.x, h.y));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Deterministic pseudo-random texture.
    fn noise(w: u32, h: u32, seed: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        RgbImage::from_fn(w, h, |_, _| {
            let mut next = || {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    fn paste(canvas: &mut RgbImage, patch: &RgbImage, x: u32, y: u32) {
        image::imageops::replace(canvas, patch, i64::from(x), i64::from(y));
    }

    #[test]
    fn test_exact_copy_scores_one() {
        let mut canvas = noise(60, 40, 1);
        let patch = noise(12, 10, 2);
        paste(&mut canvas, &patch, 31, 17);

        let image = Planes::from_rgb(&canvas);
        let template = Planes::from_rgb(&patch);
        let hit = search(&image, &template).expect("template fits");
        assert_eq!((hit.x, hit.y), (31, 17));
        assert!(hit.score > 0.9999, "score {}", hit.score);
    }

    #[test]
    fn test_brightness_offset_is_ignored() {
        let patch = noise(10, 10, 3);
        let brighter = RgbImage::from_fn(10, 10, |x, y| {
            let p = patch.get_pixel(x, y);
            Rgb([p[0] / 2 + 60, p[1] / 2 + 60, p[2] / 2 + 60])
        });
        let image = Planes::from_rgb(&brighter);
        let template = Planes::from_rgb(&patch);
        let corr = Correlator::new(&image, &template).unwrap();
        assert!(corr.score(0, 0) > 0.99, "affine change keeps correlation");
    }

    #[test]
    fn test_flat_window_scores_zero() {
        let canvas = RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]));
        let image = Planes::from_rgb(&canvas);
        let template = Planes::from_rgb(&noise(5, 5, 4));
        let corr = Correlator::new(&image, &template).unwrap();
        assert_eq!(corr.score(3, 3), 0.0);
    }

    #[test]
    fn test_template_larger_than_image() {
        let image = Planes::from_rgb(&noise(10, 10, 5));
        let template = Planes::from_rgb(&noise(11, 4, 6));
        assert!(Correlator::new(&image, &template).is_none());
        assert!(search(&image, &template).is_none());
    }

    #[test]
    fn test_pyramid_search_finds_large_match() {
        // 400x300 frame with a 64x48 template is well over the direct budget
        let mut canvas = noise(400, 300, 7);
        let patch = RgbImage::from_fn(64, 48, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([250, 240, 30])
            } else {
                Rgb([10, 20, 140])
            }
        });
        paste(&mut canvas, &patch, 211, 123);

        let image = Planes::from_rgb(&canvas);
        let template = Planes::from_rgb(&patch);
        let full = Correlator::new(&image, &template).unwrap();
        assert!(full.work() > DIRECT_SEARCH_BUDGET);

        let hit = search(&image, &template).unwrap();
        assert_eq!((hit.x, hit.y), (211, 123));
        assert!(hit.score > 0.999);
    }

    #[test]
    fn test_search_all_row_major() {
        let mut canvas = RgbImage::from_pixel(80, 40, Rgb([0, 0, 0]));
        let patch = noise(8, 8, 9);
        paste(&mut canvas, &patch, 50, 5);
        paste(&mut canvas, &patch, 10, 20);
        paste(&mut canvas, &patch, 30, 5);

        let image = Planes::from_rgb(&canvas);
        let template = Planes::from_rgb(&patch);
        let hits: Vec<(u32, u32)> = search_all(&image, &template, 0.99)
            .into_iter()
            .map(|h| (h.x, h.y))
            .collect();
        assert_eq!(hits, vec![(30, 5), (50, 5), (10, 20)]);
    }

    #[test]
    fn test_downsample_averages_blocks() {
        let img = GrayImage::from_fn(4, 2, |x, _| image::Luma([if x < 2 { 10 } else { 30 }]));
        let small = Planes::from_gray(&img).downsample(2);
        assert_eq!((small.width(), small.height()), (2, 1));
        assert_eq!(small.data[0], vec![10.0, 30.0]);
    }
}
