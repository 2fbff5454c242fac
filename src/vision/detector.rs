//! Template detection with an escalating chain of matchers.
//!
//! Each stage runs only when the previous one found nothing above the
//! threshold:
//! 1. Exact: color NCC at the template's native size.
//! 2. Multi-scale: NCC of smoothed Canny edge maps over a range of scales.
//! 3. Histogram: hue/saturation histogram correlation on a coarse grid.
//! 4. Keypoint: FAST + binary descriptors with cross-checked matching.

use anyhow::Result;
use image::imageops::grayscale;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use super::edges::{self, EdgeParams};
use super::features::{self, Features};
use super::histogram::{self, Histogram, HistogramBins, HsPlanes};
use super::library::{Resolution, Template, TemplateLibrary};
use super::matching::{self, Planes};
use crate::capture::{Frame, FrameSource, Point, Region};

/// Tuning for the detection chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub scale_min: f64,
    pub scale_max: f64,
    pub scale_steps: usize,
    pub canny_low: f32,
    pub canny_high: f32,
    pub edge_blur_sigma: f32,
    pub hue_bins: u32,
    pub saturation_bins: u32,
    /// Keypoint stage accepts at `threshold × feature_threshold_factor`.
    pub feature_threshold_factor: f64,
    pub max_features: usize,
    pub fast_threshold: u8,
    /// `find_all` results closer than this on both axes are merged.
    pub dedupe_distance: u32,
    /// Run stages 2-4 when the exact match fails.
    pub use_fallbacks: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_min: 0.5,
            scale_max: 1.5,
            scale_steps: 15,
            canny_low: 50.0,
            canny_high: 200.0,
            edge_blur_sigma: 1.0,
            hue_bins: 30,
            saturation_bins: 32,
            feature_threshold_factor: 0.5,
            max_features: 500,
            fast_threshold: 20,
            dedupe_distance: 10,
            use_fallbacks: true,
        }
    }
}

impl DetectorConfig {
    fn edge_params(&self) -> EdgeParams {
        EdgeParams {
            canny_low: self.canny_low,
            canny_high: self.canny_high,
            blur_sigma: self.edge_blur_sigma,
        }
    }

    fn bins(&self) -> HistogramBins {
        HistogramBins::new(self.hue_bins, self.saturation_bins)
    }

    fn scales(&self) -> Vec<f64> {
        edges::linspace(self.scale_min, self.scale_max, self.scale_steps)
    }
}

/// Which stage produced a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    Exact,
    MultiScale,
    Histogram,
    Keypoint,
}

impl MatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStage::Exact => "exact",
            MatchStage::MultiScale => "multi_scale",
            MatchStage::Histogram => "histogram",
            MatchStage::Keypoint => "keypoint",
        }
    }
}

impl fmt::Display for MatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A located template in screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub point: Point,
    pub stage: MatchStage,
    pub score: f64,
}

/// Per-template data derived once and reused across frames.
struct Prepared {
    template: Arc<Template>,
    planes: Planes,
    gray: GrayImage,
    edges: OnceLock<GrayImage>,
    histogram: OnceLock<Histogram>,
    features: OnceLock<Features>,
}

impl Prepared {
    fn new(template: Arc<Template>) -> Self {
        Self {
            planes: Planes::from_rgb(template.image()),
            gray: grayscale(template.image()),
            template,
            edges: OnceLock::new(),
            histogram: OnceLock::new(),
            features: OnceLock::new(),
        }
    }
}

/// Frame-side data, computed only when a stage needs it.
struct FrameData<'a> {
    frame: &'a Frame,
    gray: OnceLock<GrayImage>,
}

impl FrameData<'_> {
    fn gray(&self) -> &GrayImage {
        self.gray.get_or_init(|| grayscale(self.frame.image()))
    }
}

/// Finds named templates on screen.
pub struct TemplateDetector {
    library: TemplateLibrary,
    source: Arc<FrameSource>,
    config: DetectorConfig,
    prepared: HashMap<String, Prepared>,
}

impl TemplateDetector {
    pub fn new(library: TemplateLibrary, source: Arc<FrameSource>, config: DetectorConfig) -> Self {
        Self {
            library,
            source,
            config,
            prepared: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn library(&self) -> &TemplateLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut TemplateLibrary {
        &mut self.library
    }

    pub fn source(&self) -> &Arc<FrameSource> {
        &self.source
    }

    /// Center of the best match in screen coordinates.
    pub fn find(&mut self, name: &str, threshold: f64, region: Option<Region>) -> Option<Point> {
        self.find_with_stage(name, threshold, region).map(|d| d.point)
    }

    pub fn can_see(&mut self, name: &str, threshold: f64, region: Option<Region>) -> bool {
        self.find(name, threshold, region).is_some()
    }

    /// Like [`find`](Self::find), also reporting the stage and score.
    pub fn find_with_stage(
        &mut self,
        name: &str,
        threshold: f64,
        region: Option<Region>,
    ) -> Option<Detection> {
        self.prepare(name)?;
        let frame = self.source.frame_for(region)?;
        self.locate(&frame, name, threshold)
    }

    /// Runs the detection chain on a caller-supplied frame.
    pub fn locate(&mut self, frame: &Frame, name: &str, threshold: f64) -> Option<Detection> {
        self.prepare(name)?;
        let prepared = self.prepared.get(name)?;
        let data = FrameData {
            frame,
            gray: OnceLock::new(),
        };

        let stages: [fn(&DetectorConfig, &Prepared, &FrameData, f64) -> Option<Detection>; 4] =
            [exact, multi_scale, color_histogram, keypoints];
        let enabled = if self.config.use_fallbacks { 4 } else { 1 };
        for stage in &stages[..enabled] {
            if let Some(found) = stage(&self.config, prepared, &data, threshold) {
                log::debug!(
                    "Found '{}' at {} via {} (score {:.3})",
                    name,
                    found.point,
                    found.stage,
                    found.score
                );
                return Some(found);
            }
        }
        log::trace!("'{}' not found at threshold {:.2}", name, threshold);
        None
    }

    /// Every exact-match location above `threshold`, row-major, deduplicated.
    pub fn find_all(
        &mut self,
        name: &str,
        threshold: f64,
        region: Option<Region>,
        limit: usize,
    ) -> Vec<Point> {
        if self.prepare(name).is_none() {
            return Vec::new();
        }
        let Some(frame) = self.source.frame_for(region) else {
            return Vec::new();
        };
        let Some(prepared) = self.prepared.get(name) else {
            return Vec::new();
        };

        let (tw, th) = (prepared.template.width(), prepared.template.height());
        let planes = Planes::from_rgb(frame.image());
        let dedupe = self.config.dedupe_distance;
        let mut results: Vec<Point> = Vec::new();
        for hit in matching::search_all(&planes, &prepared.planes, threshold) {
            if results.len() >= limit {
                break;
            }
            let center = frame.to_screen((hit.x + tw / 2) as i32, (hit.y + th / 2) as i32);
            let duplicate = results.iter().any(|p| {
                p.x.abs_diff(center.x) < dedupe && p.y.abs_diff(center.y) < dedupe
            });
            if !duplicate {
                results.push(center);
            }
        }
        results
    }

    /// Saves a template through the library and drops derived data for it.
    pub fn save_template(
        &mut self,
        name: &str,
        image: &RgbImage,
        resolution: Option<Resolution>,
    ) -> Result<PathBuf> {
        self.prepared.remove(name);
        self.library.save(name, image, resolution)
    }

    /// Captures `region` and saves it as template `name`.
    pub fn capture_template(
        &mut self,
        name: &str,
        region: Region,
        resolution: Option<Resolution>,
    ) -> Result<PathBuf> {
        self.prepared.remove(name);
        self.library
            .capture_template(&self.source, name, region, resolution)
    }

    pub fn clear_cache(&mut self) {
        self.library.clear_cache();
        self.prepared.clear();
    }

    /// Loads the template and (re)builds its derived data when the library
    /// hands out a different image than last time.
    fn prepare(&mut self, name: &str) -> Option<()> {
        let template = self.library.get(name)?;
        let stale = self
            .prepared
            .get(name)
            .is_none_or(|p| !Arc::ptr_eq(&p.template, &template));
        if stale {
            self.prepared.insert(name.to_string(), Prepared::new(template));
        }
        Some(())
    }
}

fn center_of(frame: &Frame, x: u32, y: u32, w: u32, h: u32) -> Point {
    frame.to_screen((x + w / 2) as i32, (y + h / 2) as i32)
}

fn exact(_: &DetectorConfig, prepared: &Prepared, data: &FrameData, threshold: f64) -> Option<Detection> {
    let planes = Planes::from_rgb(data.frame.image());
    let hit = matching::search(&planes, &prepared.planes)?;
    if !matching::passes(hit.score, threshold) {
        log::trace!("Exact match best {:.3}", hit.score);
        return None;
    }
    let t = &prepared.template;
    Some(Detection {
        point: center_of(data.frame, hit.x, hit.y, t.width(), t.height()),
        stage: MatchStage::Exact,
        score: f64::from(hit.score),
    })
}

fn multi_scale(config: &DetectorConfig, prepared: &Prepared, data: &FrameData, threshold: f64) -> Option<Detection> {
    let params = config.edge_params();
    let template_edges = prepared
        .edges
        .get_or_init(|| edges::edge_map(&prepared.gray, params));
    let frame_edges = Planes::from_gray(&edges::smooth(
        &edges::edge_map(data.gray(), params),
        params.blur_sigma,
    ));

    let best = edges::best_scaled_match(&frame_edges, template_edges, &config.scales(), params.blur_sigma)?;
    if !matching::passes(best.hit.score, threshold) {
        log::trace!("Multi-scale best {:.3} at scale {:.2}", best.hit.score, best.scale);
        return None;
    }
    Some(Detection {
        point: center_of(data.frame, best.hit.x, best.hit.y, best.width, best.height),
        stage: MatchStage::MultiScale,
        score: f64::from(best.hit.score),
    })
}

fn color_histogram(
    config: &DetectorConfig,
    prepared: &Prepared,
    data: &FrameData,
    threshold: f64,
) -> Option<Detection> {
    let bins = config.bins();
    let template_hist = prepared
        .histogram
        .get_or_init(|| HsPlanes::new(prepared.template.image()).full_histogram(bins));
    let t = &prepared.template;
    let (x, y, score) = histogram::best_window(
        &HsPlanes::new(data.frame.image()),
        template_hist,
        t.width(),
        t.height(),
        bins,
    )?;
    if score < threshold {
        log::trace!("Histogram best {:.3}", score);
        return None;
    }
    Some(Detection {
        point: center_of(data.frame, x, y, t.width(), t.height()),
        stage: MatchStage::Histogram,
        score,
    })
}

fn keypoints(config: &DetectorConfig, prepared: &Prepared, data: &FrameData, threshold: f64) -> Option<Detection> {
    let template_features = prepared.features.get_or_init(|| {
        Features::extract(&prepared.gray, config.fast_threshold, config.max_features)
    });
    let frame_features = Features::extract(data.gray(), config.fast_threshold, config.max_features);
    let (x, y, ratio) = features::locate(
        template_features,
        &frame_features,
        threshold,
        config.feature_threshold_factor,
    )?;
    Some(Detection {
        point: data.frame.to_screen(x, y),
        stage: MatchStage::Keypoint,
        score: ratio,
    })
}
