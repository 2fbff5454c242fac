//! Human-like pointer movement, clicks and key presses.
//!
//! Every operation holds one lock on the input device from its first event to
//! its last, so concurrent callers never interleave path steps or button
//! events.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::device::{open_device, InputBackend, InputDevice, Key, MouseButton};
use super::path::{bezier_path, step_count};
use super::timing::{secs, uniform, GaussianDelay};
use crate::capture::Point;

/// Shortest and longest automatic move duration, in seconds.
const AUTO_DURATION_RANGE: (f64, f64) = (0.05, 0.5);

/// Floor for the delay between path steps.
const MIN_STEP_DELAY: f64 = 0.001;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub backend: InputBackend,
    /// Clicks land up to this many pixels away from the target on each axis.
    pub position_jitter: i32,
    pub click_duration_min: f64,
    pub click_duration_max: f64,
    /// Scales the automatic move duration; higher is slower.
    pub movement_speed: f64,
    /// Control point displacement as a fraction of the move distance.
    pub curve_variance: f64,
    pub micro_jitter_enabled: bool,
    pub micro_jitter_pixels: i32,
    pub micro_jitter_interval: f64,
    pub movement_steps_min: u32,
    pub movement_steps_max: u32,
    pub pre_click: GaussianDelay,
    pub post_click: GaussianDelay,
    pub key_hold: GaussianDelay,
    pub post_key: GaussianDelay,
    pub double_click_gap: GaussianDelay,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            backend: InputBackend::default(),
            position_jitter: 5,
            click_duration_min: 0.05,
            click_duration_max: 0.15,
            movement_speed: 1.0,
            curve_variance: 0.3,
            micro_jitter_enabled: true,
            micro_jitter_pixels: 2,
            micro_jitter_interval: 0.02,
            movement_steps_min: 20,
            movement_steps_max: 40,
            pre_click: GaussianDelay::new(0.04, 0.02, 0.01),
            post_click: GaussianDelay::new(0.02, 0.01, 0.005),
            key_hold: GaussianDelay::new(0.08, 0.03, 0.03),
            post_key: GaussianDelay::new(0.03, 0.01, 0.01),
            double_click_gap: GaussianDelay::new(0.08, 0.02, 0.04),
        }
    }
}

/// Blocking waits between input events.
pub trait Sleeper: Send {
    fn sleep(&mut self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

struct Inner {
    device: Box<dyn InputDevice>,
    sleeper: Box<dyn Sleeper>,
    rng: StdRng,
}

/// Screen bounds for clamping, when the device can report them.
#[derive(Clone, Copy)]
struct Bounds(Option<(u32, u32)>);

impl Bounds {
    fn clamp(self, x: i32, y: i32) -> Point {
        match self.0 {
            Some((w, h)) => Point::new(
                x.clamp(0, w.saturating_sub(1) as i32),
                y.clamp(0, h.saturating_sub(1) as i32),
            ),
            None => Point::new(x.max(0), y.max(0)),
        }
    }
}

fn accepted(result: Result<()>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Input {} failed: {:#}", what, e);
            false
        }
    }
}

impl Inner {
    fn bounds(&mut self) -> Bounds {
        match self.device.screen_size() {
            Ok(size) => Bounds(Some(size)),
            Err(e) => {
                log::debug!("Screen size unavailable: {:#}", e);
                Bounds(None)
            }
        }
    }

    fn pause(&mut self, delay: &GaussianDelay) {
        let d = delay.sample(&mut self.rng);
        self.sleeper.sleep(d);
    }

    fn move_to(&mut self, config: &MotionConfig, bounds: Bounds, target: Point, duration: Option<Duration>) -> bool {
        let mut ok = true;
        let target = bounds.clamp(target.x, target.y);
        let start = match self.device.cursor_position() {
            Ok(p) => p,
            Err(e) => {
                log::debug!("Cursor position unavailable: {:#}", e);
                ok = false;
                target
            }
        };

        let distance = start.distance_to(target);
        let duration = match duration {
            Some(d) => d.as_secs_f64(),
            None => {
                let (lo, hi) = AUTO_DURATION_RANGE;
                let base = (distance / 1000.0 * config.movement_speed).clamp(lo, hi);
                base * uniform(&mut self.rng, 0.9, 1.1)
            }
        };
        let steps = step_count(distance, config.movement_steps_min, config.movement_steps_max);
        let path = bezier_path(&mut self.rng, start, target, steps, config.curve_variance);
        let step_delay = duration / path.len() as f64;

        for point in path {
            let p = bounds.clamp(point.x, point.y);
            ok &= accepted(self.device.move_to(p.x, p.y), "move");
            let delay = (step_delay * uniform(&mut self.rng, 0.8, 1.2)).max(MIN_STEP_DELAY);
            self.sleeper.sleep(secs(delay));
        }
        ok
    }

    /// Holds for `hold` seconds, nudging the pointer around `center` when
    /// micro-jitter is enabled.
    fn hold(&mut self, config: &MotionConfig, bounds: Bounds, center: Point, hold: f64) -> bool {
        let interval = config.micro_jitter_interval;
        let pixels = config.micro_jitter_pixels.max(0);
        if !config.micro_jitter_enabled || interval <= 0.0 {
            self.sleeper.sleep(secs(hold));
            return true;
        }

        let mut ok = true;
        let mut elapsed = 0.0;
        while elapsed < hold {
            let jx = center.x + self.rng.random_range(-pixels..=pixels);
            let jy = center.y + self.rng.random_range(-pixels..=pixels);
            let p = bounds.clamp(jx, jy);
            ok &= accepted(self.device.move_to(p.x, p.y), "jitter");
            self.sleeper.sleep(secs(interval.min(hold - elapsed)));
            elapsed += interval;
        }
        ok
    }

    fn click(&mut self, config: &MotionConfig, x: i32, y: i32, button: MouseButton, move_first: bool) -> bool {
        let bounds = self.bounds();
        let jitter = config.position_jitter.max(0);
        let target = bounds.clamp(
            x + self.rng.random_range(-jitter..=jitter),
            y + self.rng.random_range(-jitter..=jitter),
        );

        let mut ok = true;
        if move_first {
            ok &= self.move_to(config, bounds, target, None);
        }
        self.pause(&config.pre_click);

        ok &= accepted(self.device.button(button, true), "button down");
        let hold = uniform(&mut self.rng, config.click_duration_min, config.click_duration_max);
        ok &= self.hold(config, bounds, target, hold);
        ok &= accepted(self.device.button(button, false), "button up");

        self.pause(&config.post_click);
        ok
    }
}

/// Converts targets into randomized pointer paths and click timings.
pub struct MotionSimulator {
    config: MotionConfig,
    backend: Option<InputBackend>,
    inner: Mutex<Inner>,
}

impl MotionSimulator {
    /// Opens the configured input backend, falling back to the other one
    /// when it is not available on this platform.
    pub fn new(config: MotionConfig) -> Result<Self> {
        let preference = config.backend;
        let Some(backend) = preference.negotiate() else {
            bail!("No input backend is available in this build");
        };
        if backend != preference {
            log::info!("Input backend '{}' unavailable, using '{}'", preference, backend);
        }
        let device = open_device(backend)?;
        log::info!("Using {} input", backend);
        let mut simulator = Self::with_device(config, device);
        simulator.backend = Some(backend);
        Ok(simulator)
    }

    /// Builds a simulator around any device.
    pub fn with_device(config: MotionConfig, device: Box<dyn InputDevice>) -> Self {
        Self {
            config,
            backend: None,
            inner: Mutex::new(Inner {
                device,
                sleeper: Box::new(ThreadSleeper),
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    pub fn with_sleeper(self, sleeper: Box<dyn Sleeper>) -> Self {
        self.inner.lock().sleeper = sleeper;
        self
    }

    /// Makes the random draws reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        self.inner.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Backend chosen at construction, `None` for an injected device.
    pub fn backend(&self) -> Option<InputBackend> {
        self.backend
    }

    /// Moves along a curved path. `duration` defaults to one derived from
    /// the distance.
    pub fn move_to(&self, x: i32, y: i32, duration: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        let bounds = inner.bounds();
        inner.move_to(&self.config, bounds, Point::new(x, y), duration)
    }

    /// Clicks near `(x, y)`, moving there first unless `move_first` is false.
    pub fn click(&self, x: i32, y: i32, button: MouseButton, move_first: bool) -> bool {
        self.inner.lock().click(&self.config, x, y, button, move_first)
    }

    /// Presses and releases a named key such as `"escape"` or `"f5"`.
    pub fn press_key(&self, key: &str, hold: Option<Duration>) -> bool {
        let key: Key = match key.parse() {
            Ok(k) => k,
            Err(e) => {
                log::debug!("{:#}", e);
                return false;
            }
        };
        let mut inner = self.inner.lock();
        let hold = match hold {
            Some(d) => d,
            None => self.config.key_hold.sample(&mut inner.rng),
        };
        let mut ok = accepted(inner.device.key(key, true), "key down");
        inner.sleeper.sleep(hold);
        ok &= accepted(inner.device.key(key, false), "key up");
        inner.pause(&self.config.post_key);
        ok
    }

    pub fn double_click(&self, x: i32, y: i32, button: MouseButton) -> bool {
        let mut inner = self.inner.lock();
        let mut ok = inner.click(&self.config, x, y, button, true);
        inner.pause(&self.config.double_click_gap);
        ok &= inner.click(&self.config, x, y, button, false);
        ok
    }
}
