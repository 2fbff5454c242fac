//! Per-tick screen scan.
//!
//! Looks for the tracked templates inside the game window and folds the
//! results into a [`DetectionSnapshot`] for the state machine.

use serde::Serialize;

use crate::capture::{Point, Region, RegionLocator};
use crate::vision::{Manifest, TemplateDetector};

pub const JOIN_BUTTON: &str = "join_button";
pub const SERVER_FULL: &str = "server_full";
pub const SERVER_LIST: &str = "server_list";
pub const LOADING: &str = "loading";
pub const SPAWN_SCREEN: &str = "spawn_screen";

/// What was visible on one tick. `Default` means nothing was seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectionSnapshot {
    pub window_found: bool,
    /// Screen position of the join button.
    pub join_button: Option<Point>,
    pub server_full: bool,
    pub server_list: bool,
    pub loading: bool,
    pub spawn_screen: bool,
}

/// Optional templates the user has captured. Signals for the others stay false.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalTemplates {
    pub loading: bool,
    pub server_list: bool,
    pub spawn_screen: bool,
}

impl OptionalTemplates {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            loading: manifest.contains(LOADING),
            server_list: manifest.contains(SERVER_LIST),
            spawn_screen: manifest.contains(SPAWN_SCREEN),
        }
    }
}

/// Builds detection snapshots from the window region and the template detector.
#[derive(Clone, Debug)]
pub struct Scanner {
    threshold: f64,
    optional: OptionalTemplates,
}

impl Scanner {
    pub fn new(threshold: f64, optional: OptionalTemplates) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            optional,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn optional(&self) -> OptionalTemplates {
        self.optional
    }

    /// Scans the window once. Returns the snapshot and the window region used.
    ///
    /// A missing window, or a frame that cannot be captured, yields a
    /// snapshot with every signal false apart from `window_found`.
    pub fn scan(
        &self,
        locator: &mut RegionLocator,
        detector: &mut TemplateDetector,
    ) -> (DetectionSnapshot, Option<Region>) {
        let Some(region) = locator.region() else {
            return (DetectionSnapshot::default(), None);
        };
        let mut snapshot = DetectionSnapshot {
            window_found: true,
            ..DetectionSnapshot::default()
        };

        // One frame for every template on this tick
        let Some(frame) = detector.source().frame_for(Some(region)) else {
            log::debug!("No frame for window region {}", region);
            return (snapshot, Some(region));
        };

        let threshold = self.threshold;
        let mut seen = |name: &str| detector.locate(&frame, name, threshold);

        snapshot.join_button = seen(JOIN_BUTTON).map(|d| d.point);
        snapshot.server_full = seen(SERVER_FULL).is_some();
        if self.optional.loading {
            snapshot.loading = seen(LOADING).is_some();
        }
        if self.optional.server_list {
            snapshot.server_list = seen(SERVER_LIST).is_some();
        }
        if self.optional.spawn_screen {
            snapshot.spawn_screen = seen(SPAWN_SCREEN).is_some();
        }

        (snapshot, Some(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureBackend, Frame, FrameSource, Grabber, WindowInfo, WindowProvider};
    use crate::vision::{DetectorConfig, TemplateLibrary};
    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;

    struct StaticGrabber(Frame);

    impl Grabber for StaticGrabber {
        fn grab(&mut self, region: Option<Region>) -> Result<Frame> {
            match region {
                None => Ok(self.0.clone()),
                Some(r) => self.0.crop(&r).ok_or_else(|| anyhow::anyhow!("outside")),
            }
        }
    }

    struct OneWindow(Option<WindowInfo>);

    impl WindowProvider for OneWindow {
        fn find(&mut self, _title: &str) -> Result<Option<WindowInfo>> {
            Ok(self.0.clone())
        }

        fn bring_to_front(&mut self, _title: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn noise(w: u32, h: u32, seed: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(11);
        RgbImage::from_fn(w, h, |_, _| {
            let mut next = || {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    fn window_at(left: i32, top: i32, right: i32, bottom: i32) -> RegionLocator {
        RegionLocator::with_provider(
            "ArkAscended",
            Box::new(OneWindow(Some(WindowInfo {
                title: "ArkAscended".to_string(),
                left,
                top,
                right,
                bottom,
                visible: true,
            }))),
        )
    }

    /// Screen with the join button pasted at (60, 40), templates saved in `dir`.
    fn setup(dir: &std::path::Path) -> TemplateDetector {
        let button = noise(30, 20, 1);
        let popup = noise(30, 20, 2);
        let mut screen = noise(240, 160, 3);
        image::imageops::replace(&mut screen, &button, 60, 40);

        let source = FrameSource::with_grabber(
            CaptureBackend::Universal,
            Box::new(StaticGrabber(Frame::at_origin(screen))),
        );
        let config = DetectorConfig {
            use_fallbacks: false,
            ..DetectorConfig::default()
        };
        let mut detector = TemplateDetector::new(TemplateLibrary::new(dir), Arc::new(source), config);
        detector.save_template(JOIN_BUTTON, &button, None).unwrap();
        detector.save_template(SERVER_FULL, &popup, None).unwrap();
        detector
    }

    #[test]
    fn test_scan_finds_join_button() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = setup(dir.path());
        let mut locator = window_at(20, 10, 220, 150);
        let scanner = Scanner::new(0.8, OptionalTemplates::default());

        let (snapshot, region) = scanner.scan(&mut locator, &mut detector);
        assert!(snapshot.window_found);
        assert_eq!(region, Region::new(20, 10, 220, 150));
        let button = snapshot.join_button.expect("join button visible");
        assert!(button.x.abs_diff(75) <= 1 && button.y.abs_diff(50) <= 1, "got {}", button);
        assert!(!snapshot.server_full, "popup not on screen");
        assert!(!snapshot.loading && !snapshot.server_list && !snapshot.spawn_screen);
    }

    #[test]
    fn test_missing_window_sees_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = setup(dir.path());
        let mut locator = RegionLocator::with_provider("ArkAscended", Box::new(OneWindow(None)));
        let scanner = Scanner::new(0.8, OptionalTemplates::default());

        let (snapshot, region) = scanner.scan(&mut locator, &mut detector);
        assert_eq!(snapshot, DetectionSnapshot::default());
        assert_eq!(region, None);
    }

    #[test]
    fn test_optional_signals_need_templates() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = setup(dir.path());
        // The join button doubles as the "loading" template here
        let button = detector.library_mut().get(JOIN_BUTTON).unwrap();
        detector
            .save_template(LOADING, button.image(), None)
            .unwrap();
        let mut locator = window_at(0, 0, 240, 160);

        let without = Scanner::new(0.8, OptionalTemplates::default());
        assert!(!without.scan(&mut locator, &mut detector).0.loading);

        let manifest = detector.library().manifest().unwrap();
        let optional = OptionalTemplates::from_manifest(&manifest);
        assert!(optional.loading);
        assert!(!optional.server_list);
        let with = Scanner::new(0.8, optional);
        assert!(with.scan(&mut locator, &mut detector).0.loading);
    }

    #[test]
    fn test_threshold_is_clamped() {
        assert_eq!(Scanner::new(1.5, OptionalTemplates::default()).threshold(), 1.0);
        assert_eq!(Scanner::new(-0.1, OptionalTemplates::default()).threshold(), 0.0);
    }
}
