//! Screen capture with an optional background refresh loop.
//!
//! A [`FrameSource`] owns exactly one capture backend, picked once at
//! construction. Captures are polled at a high rate, so every failure is
//! logged and reported as "no frame" instead of an error.

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::frame::{Frame, Region};

/// How long `stop_background` waits for the capture thread to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default freshness limit for frames served from the background slot.
const DEFAULT_MAX_FRAME_AGE: Duration = Duration::from_millis(500);

/// Available capture strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Platform-specific full-desktop blit (Windows GDI).
    #[default]
    Native,
    /// Cross-platform monitor capture through `xcap`.
    Universal,
}

impl CaptureBackend {
    /// Whether this backend was compiled in for the current target.
    pub fn is_available(self) -> bool {
        match self {
            CaptureBackend::Native => cfg!(windows),
            CaptureBackend::Universal => cfg!(feature = "desktop"),
        }
    }

    /// Resolves a preference to a backend that can actually run here.
    pub fn negotiate(self) -> Option<CaptureBackend> {
        let fallback = match self {
            CaptureBackend::Native => CaptureBackend::Universal,
            CaptureBackend::Universal => CaptureBackend::Native,
        };
        [self, fallback].into_iter().find(|b| b.is_available())
    }
}

impl std::fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureBackend::Native => write!(f, "native"),
            CaptureBackend::Universal => write!(f, "universal"),
        }
    }
}

/// Something that can produce screen pixels.
pub trait Grabber: Send {
    /// Grabs `region` in screen coordinates, or the primary screen for `None`.
    fn grab(&mut self, region: Option<Region>) -> Result<Frame>;
}

struct LatestFrame {
    frame: Frame,
    captured_at: Instant,
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    region: Option<Region>,
}

/// Screen capture front end used by detection and calibration.
pub struct FrameSource {
    backend: CaptureBackend,
    grabber: Arc<Mutex<Box<dyn Grabber>>>,
    latest: Arc<RwLock<Option<LatestFrame>>>,
    worker: Mutex<Option<CaptureWorker>>,
    max_frame_age: Duration,
}

impl FrameSource {
    /// Builds a frame source for the preferred backend, falling back to the
    /// other one when the preference is not available on this platform.
    pub fn new(preference: CaptureBackend) -> Result<Self> {
        let Some(backend) = preference.negotiate() else {
            bail!("No screen capture backend is available in this build");
        };
        if backend != preference {
            log::info!("Capture backend '{}' unavailable, using '{}'", preference, backend);
        }
        let grabber = build_grabber(backend)?;
        log::info!("Using {} screen capture", backend);
        Ok(Self::with_grabber(backend, grabber))
    }

    /// Builds a frame source around an existing grabber.
    pub fn with_grabber(backend: CaptureBackend, grabber: Box<dyn Grabber>) -> Self {
        Self {
            backend,
            grabber: Arc::new(Mutex::new(grabber)),
            latest: Arc::new(RwLock::new(None)),
            worker: Mutex::new(None),
            max_frame_age: DEFAULT_MAX_FRAME_AGE,
        }
    }

    /// Sets how old a background frame may be before `frame_for` captures directly.
    pub fn with_max_frame_age(mut self, age: Duration) -> Self {
        self.max_frame_age = age;
        self
    }

    pub fn backend(&self) -> CaptureBackend {
        self.backend
    }

    /// Captures one frame synchronously.
    ///
    /// Returns `None` if the backend fails; the caller is expected to poll again.
    pub fn capture(&self, region: Option<Region>) -> Option<Frame> {
        grab_logged(&self.grabber, region)
    }

    /// Starts refreshing the latest-frame slot at `fps` in a background thread.
    ///
    /// Does nothing if the loop is already running.
    pub fn start_background(&self, region: Option<Region>, fps: u32) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        let running = Arc::new(AtomicBool::new(true));
        let grabber = Arc::clone(&self.grabber);
        let latest = Arc::clone(&self.latest);
        let flag = Arc::clone(&running);

        let handle = thread::spawn(move || {
            run_capture_loop(&grabber, &latest, &flag, region, interval);
        });

        log::info!("Started background capture at {} FPS", fps.max(1));
        *worker = Some(CaptureWorker {
            running,
            handle,
            region,
        });
    }

    /// Stops the background loop, waiting a bounded time for the thread to exit.
    pub fn stop_background(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                log::warn!("Capture thread panicked");
            }
        } else {
            log::warn!("Capture thread did not stop within {:?}, detaching", STOP_TIMEOUT);
        }
        log::info!("Stopped background capture");
    }

    pub fn is_background_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Region the background loop was started with, if it is running.
    pub fn background_region(&self) -> Option<Option<Region>> {
        self.worker.lock().as_ref().map(|w| w.region)
    }

    /// Returns a copy of the most recent background frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest.read().as_ref().map(|l| l.frame.clone())
    }

    /// Time since the latest-frame slot was written, `None` if it is empty.
    pub fn frame_age(&self) -> Option<Duration> {
        self.latest.read().as_ref().map(|l| l.captured_at.elapsed())
    }

    /// Like [`frame_age`](Self::frame_age) in seconds, infinite when empty.
    pub fn frame_age_secs(&self) -> f64 {
        self.frame_age().map_or(f64::INFINITY, |age| age.as_secs_f64())
    }

    /// Frame covering `region` for detection.
    ///
    /// Served from the background slot when the loop is running and its frame
    /// is fresh and covers the whole region, otherwise captured directly.
    pub fn frame_for(&self, region: Option<Region>) -> Option<Frame> {
        if self.is_background_running() {
            let slot = self.latest.read();
            if let Some(latest) = slot.as_ref() {
                if latest.captured_at.elapsed() <= self.max_frame_age {
                    match region {
                        None => return Some(latest.frame.clone()),
                        // A partial overlap would hand back a smaller frame
                        Some(r) => {
                            if let Some(cropped) = latest.frame.crop(&r).filter(|c| c.bounds() == Some(r)) {
                                return Some(cropped);
                            }
                        }
                    }
                }
            }
        }
        self.capture(region)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop_background();
    }
}

fn grab_logged(grabber: &Mutex<Box<dyn Grabber>>, region: Option<Region>) -> Option<Frame> {
    match grabber.lock().grab(region) {
        Ok(frame) if frame.width() > 0 && frame.height() > 0 => Some(frame),
        Ok(_) => {
            log::debug!("Screen capture returned an empty image");
            None
        }
        Err(e) => {
            log::debug!("Screen capture failed: {:#}", e);
            None
        }
    }
}

fn run_capture_loop(
    grabber: &Mutex<Box<dyn Grabber>>,
    latest: &RwLock<Option<LatestFrame>>,
    running: &AtomicBool,
    region: Option<Region>,
    interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        if let Some(frame) = grab_logged(grabber, region) {
            *latest.write() = Some(LatestFrame {
                frame,
                captured_at: Instant::now(),
            });
        }

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

#[cfg(windows)]
fn native_grabber() -> Result<Box<dyn Grabber>> {
    Ok(Box::new(super::native::GdiGrabber::new()))
}

#[cfg(not(windows))]
fn native_grabber() -> Result<Box<dyn Grabber>> {
    bail!("Native capture is only available on Windows")
}

#[cfg(feature = "desktop")]
fn universal_grabber() -> Result<Box<dyn Grabber>> {
    Ok(Box::new(super::universal::XcapGrabber::new()))
}

#[cfg(not(feature = "desktop"))]
fn universal_grabber() -> Result<Box<dyn Grabber>> {
    bail!("Universal capture requires the 'desktop' feature")
}

fn build_grabber(backend: CaptureBackend) -> Result<Box<dyn Grabber>> {
    match backend {
        CaptureBackend::Native => native_grabber(),
        CaptureBackend::Universal => universal_grabber(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Point;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicU32;

    /// Produces a 64x48 frame whose red channel encodes the capture count.
    struct CountingGrabber {
        count: Arc<AtomicU32>,
        fail: bool,
    }

    impl Grabber for CountingGrabber {
        fn grab(&mut self, region: Option<Region>) -> Result<Frame> {
            if self.fail {
                bail!("device busy");
            }
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            let screen = Frame::at_origin(RgbImage::from_pixel(64, 48, Rgb([n as u8, 0, 0])));
            match region {
                Some(r) => screen.crop(&r).ok_or_else(|| anyhow::anyhow!("off screen")),
                None => Ok(screen),
            }
        }
    }

    fn source(fail: bool) -> (FrameSource, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let grabber = CountingGrabber {
            count: Arc::clone(&count),
            fail,
        };
        (
            FrameSource::with_grabber(CaptureBackend::Universal, Box::new(grabber)),
            count,
        )
    }

    #[test]
    fn test_capture_failure_is_none() {
        let (source, _) = source(true);
        assert!(source.capture(None).is_none());
        assert!(source.frame_for(None).is_none());
    }

    #[test]
    fn test_capture_region_offsets_origin() {
        let (source, _) = source(false);
        let region = Region::new(10, 20, 30, 40).unwrap();
        let frame = source.capture(Some(region)).unwrap();
        assert_eq!(frame.origin(), Point::new(10, 20));
        assert_eq!((frame.width(), frame.height()), (20, 20));
    }

    #[test]
    fn test_empty_slot_reports_infinite_age() {
        let (source, _) = source(false);
        assert!(source.latest_frame().is_none());
        assert!(source.frame_age().is_none());
        assert!(source.frame_age_secs().is_infinite());
    }

    #[test]
    fn test_background_loop_publishes_copies() {
        let (source, count) = source(false);
        source.start_background(None, 200);
        source.start_background(None, 200); // second start is a no-op
        assert!(source.is_background_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        while source.latest_frame().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let first = source.latest_frame().expect("background frame");
        assert!(source.frame_age().unwrap() < Duration::from_secs(2));

        source.stop_background();
        assert!(!source.is_background_running());

        // A copy taken earlier is unaffected by later writes
        let captured = count.load(Ordering::SeqCst);
        assert!(captured >= 1);
        assert_eq!(first.width(), 64);
        let again = source.latest_frame().unwrap();
        assert_eq!(again.image().get_pixel(0, 0)[0], (captured - 1) as u8);
    }

    #[test]
    fn test_frame_for_crops_background_frame() {
        let (source, count) = source(false);
        source.start_background(None, 100);
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.latest_frame().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let region = Region::new(4, 4, 20, 12).unwrap();
        let frame = source.frame_for(Some(region)).unwrap();
        assert_eq!(frame.origin(), Point::new(4, 4));
        assert_eq!((frame.width(), frame.height()), (16, 8));
        source.stop_background();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_frame_for_partial_overlap_captures_directly() {
        let (source, count) = source(false);
        source.start_background(Some(Region::new(0, 0, 32, 24).unwrap()), 100);
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.latest_frame().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(source.latest_frame().unwrap().width(), 32);

        let region = Region::new(16, 12, 48, 36).unwrap();
        let frame = source.frame_for(Some(region)).unwrap();
        assert_eq!(frame.origin(), Point::new(16, 12));
        assert_eq!((frame.width(), frame.height()), (32, 24), "not clipped to the background region");
        assert_eq!(frame.bounds(), Some(region));
        source.stop_background();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_negotiate_prefers_request() {
        for pref in [CaptureBackend::Native, CaptureBackend::Universal] {
            if let Some(chosen) = pref.negotiate() {
                assert!(chosen.is_available());
                if pref.is_available() {
                    assert_eq!(chosen, pref);
                }
            }
        }
    }
}
