//! Application configuration.
//!
//! Loaded from config.json next to the executable at startup. Every section
//! falls back to its defaults, so a partial file only overrides what it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::automation::detection::{JOIN_BUTTON, SERVER_FULL};
use crate::automation::state::StateMachineConfig;
use crate::capture::CaptureBackend;
use crate::input::MotionConfig;
use crate::vision::DetectorConfig;

/// Screen capture settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Background capture rate. 0 captures on demand each tick.
    pub background_fps: u32,
    /// Oldest background frame the detector will still use (milliseconds)
    pub max_frame_age_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::Native,
            background_fps: 0,
            max_frame_age_ms: 500,
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Substring of the game window title
    pub window_title: String,
    /// Template directory. Defaults to `<exe_dir>/templates/`
    pub templates_dir: Option<PathBuf>,
    /// Match score required for a detection (0.0-1.0)
    pub detection_threshold: f64,
    /// Delay between ticks (milliseconds)
    pub detection_interval_ms: u64,
    /// Templates that must be captured before a session can start
    pub required_templates: Vec<String>,
    /// Key pressed to close the "server full" popup
    pub dismiss_key: String,
    pub capture: CaptureConfig,
    pub detector: DetectorConfig,
    pub session: StateMachineConfig,
    pub motion: MotionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window_title: "ArkAscended".to_string(),
            templates_dir: None,
            detection_threshold: 0.8,
            detection_interval_ms: 500,
            required_templates: vec![JOIN_BUTTON.to_string(), SERVER_FULL.to_string()],
            dismiss_key: "escape".to_string(),
            capture: CaptureConfig::default(),
            detector: DetectorConfig::default(),
            session: StateMachineConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, falling back to defaults when the file is missing or
    /// cannot be parsed. The result is always sanitized.
    pub fn load(path: &Path) -> Self {
        log::info!("Looking for config at: {}", path.display());

        if !path.exists() {
            log::info!("{} not found. Using default config.", path.display());
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Config loaded from {}", path.display());
                    config.sanitized()
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Writes the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Template directory, resolved against `<exe_dir>/templates/` when unset.
    pub fn templates_dir(&self) -> PathBuf {
        self.templates_dir
            .clone()
            .unwrap_or_else(crate::paths::templates_dir)
    }

    /// Copy with ordered min/max pairs, bounded timings and the threshold in 0.0-1.0.
    pub fn sanitized(mut self) -> Self {
        if !self.detection_threshold.is_finite() {
            self.detection_threshold = AppConfig::default().detection_threshold;
        }
        self.detection_threshold = self.detection_threshold.clamp(0.0, 1.0);

        let defaults = StateMachineConfig::default();
        let session = &mut self.session;
        bound_secs(&mut session.timeout_seconds, defaults.timeout_seconds, "timeout_seconds");
        bound_secs(&mut session.window_timeout, defaults.window_timeout, "window_timeout");
        bound_secs(&mut session.list_screen_grace, defaults.list_screen_grace, "list_screen_grace");
        bound_secs(&mut session.retry_delay_min, defaults.retry_delay_min, "retry_delay_min");
        bound_secs(&mut session.retry_delay_max, defaults.retry_delay_max, "retry_delay_max");
        order(&mut session.retry_delay_min, &mut session.retry_delay_max, "retry_delay");

        let defaults = MotionConfig::default();
        let motion = &mut self.motion;
        bound_secs(&mut motion.click_duration_min, defaults.click_duration_min, "click_duration_min");
        bound_secs(&mut motion.click_duration_max, defaults.click_duration_max, "click_duration_max");
        order(
            &mut motion.click_duration_min,
            &mut motion.click_duration_max,
            "click_duration",
        );
        order(
            &mut motion.movement_steps_min,
            &mut motion.movement_steps_max,
            "movement_steps",
        );

        let detector = &mut self.detector;
        order(&mut detector.scale_min, &mut detector.scale_max, "scale");
        order(&mut detector.canny_low, &mut detector.canny_high, "canny");

        self
    }
}

/// Longest accepted timeout or delay (seconds).
const MAX_TIMING_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Replaces a negative or non-finite duration with `default` and caps it at a day.
fn bound_secs(value: &mut f64, default: f64, name: &str) {
    if !value.is_finite() || *value < 0.0 {
        log::warn!("{} {} is invalid, using {}", name, value, default);
        *value = default;
    } else if *value > MAX_TIMING_SECS {
        log::warn!("{} {} capped to {}", name, value, MAX_TIMING_SECS);
        *value = MAX_TIMING_SECS;
    }
}

/// Swaps `min` and `max` when they are inverted.
fn order<T: PartialOrd + std::fmt::Debug>(min: &mut T, max: &mut T, name: &str) {
    if *min > *max {
        log::warn!("{}_min {:?} > {}_max {:?}, swapping", name, min, name, max);
        std::mem::swap(min, max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputBackend;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("config.json"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load(&path), AppConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "window_title": "ShooterGame",
                "unknown_key": [1, 2, 3],
                "session": { "max_retries": 5 },
                "motion": { "backend": "universal", "pre_click": { "mean": 0.1, "stddev": 0.02, "min": 0.01 } },
                "capture": { "backend": "universal", "background_fps": 20 }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path);
        assert_eq!(config.window_title, "ShooterGame");
        assert_eq!(config.session.max_retries, 5);
        assert_eq!(config.session.timeout_seconds, 15.0);
        assert_eq!(config.motion.backend, InputBackend::Universal);
        assert_eq!(config.motion.pre_click.mean, 0.1);
        assert_eq!(config.motion.post_click, MotionConfig::default().post_click);
        assert_eq!(config.motion.position_jitter, 5, "unlisted motion keys keep defaults");
        assert_eq!(config.capture.backend, CaptureBackend::Universal);
        assert_eq!(config.capture.background_fps, 20);
        assert_eq!(config.capture.max_frame_age_ms, 500);
        assert_eq!(config.required_templates, vec!["join_button", "server_full"]);
        assert_eq!(config.dismiss_key, "escape");
    }

    #[test]
    fn test_sanitized_repairs_ranges() {
        let mut config = AppConfig::default();
        config.detection_threshold = 1.7;
        config.session.retry_delay_min = 5.0;
        config.session.retry_delay_max = 2.0;
        config.motion.movement_steps_min = 50;
        config.motion.movement_steps_max = 10;
        config.detector.scale_min = 2.0;
        config.detector.scale_max = 0.5;

        let config = config.sanitized();
        assert_eq!(config.detection_threshold, 1.0);
        assert_eq!((config.session.retry_delay_min, config.session.retry_delay_max), (2.0, 5.0));
        assert_eq!((config.motion.movement_steps_min, config.motion.movement_steps_max), (10, 50));
        assert_eq!((config.detector.scale_min, config.detector.scale_max), (0.5, 2.0));

        let mut negative = AppConfig::default();
        negative.detection_threshold = -3.0;
        assert_eq!(negative.sanitized().detection_threshold, 0.0);
    }

    #[test]
    fn test_sanitized_bounds_timings() {
        let mut config = AppConfig::default();
        config.session.timeout_seconds = 1e20;
        config.session.window_timeout = -4.0;
        config.session.retry_delay_max = f64::INFINITY;
        config.motion.click_duration_max = 1e30;

        let config = config.sanitized();
        assert_eq!(config.session.timeout_seconds, MAX_TIMING_SECS);
        assert_eq!(config.session.window_timeout, 10.0, "negative falls back to default");
        assert_eq!(config.session.retry_delay_max, 3.0, "infinite falls back to default");
        assert_eq!(config.motion.click_duration_max, MAX_TIMING_SECS);
    }

    #[test]
    fn test_load_sanitizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "detection_threshold": 3.0 }"#).unwrap();
        assert_eq!(AppConfig::load(&path).detection_threshold, 1.0);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.templates_dir = Some(dir.path().join("tpl"));
        config.session.list_screen_grace = 4.0;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.templates_dir(), dir.path().join("tpl"));
    }
}
