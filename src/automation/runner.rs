//! Session runner - drives the join loop end to end.
//!
//! Each tick scans the game window, feeds the snapshot to the state machine
//! and performs whatever action it asks for. Everything runs on the calling
//! thread; only the optional background capture has its own.

use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::automation::config::AppConfig;
use crate::automation::detection::{DetectionSnapshot, OptionalTemplates, Scanner};
use crate::automation::state::{Action, CallbackId, JoinState, JoinStateMachine, SessionInfo};
use crate::capture::{CaptureBackend, FrameSource, Region, RegionLocator, WindowBackend};
use crate::input::{MotionSimulator, MouseButton};
use crate::vision::{Manifest, SetupError, TemplateDetector, TemplateLibrary};

type SnapshotCallback = Box<dyn FnMut(&DetectionSnapshot, Option<Region>) + Send>;

/// One auto-join session and everything it owns.
pub struct Session {
    config: AppConfig,
    source: Arc<FrameSource>,
    locator: RegionLocator,
    detector: TemplateDetector,
    motion: MotionSimulator,
    machine: JoinStateMachine,
    scanner: Scanner,
    snapshot_observers: Vec<SnapshotCallback>,
}

impl Session {
    /// Opens the capture, window and input backends named in `config`.
    ///
    /// # Errors
    /// Returns an error if no capture or input backend is available.
    pub fn new(config: AppConfig) -> Result<Self> {
        let config = config.sanitized();
        let source = FrameSource::new(config.capture.backend)?
            .with_max_frame_age(Duration::from_millis(config.capture.max_frame_age_ms));
        let locator = RegionLocator::new(
            config.window_title.clone(),
            window_backend(config.capture.backend),
        );
        let motion = MotionSimulator::new(config.motion.clone())?;
        Ok(Self::from_parts(config, Arc::new(source), locator, motion))
    }

    /// Builds a session around already constructed components.
    pub fn from_parts(
        config: AppConfig,
        source: Arc<FrameSource>,
        locator: RegionLocator,
        motion: MotionSimulator,
    ) -> Self {
        let config = config.sanitized();
        let library = TemplateLibrary::new(config.templates_dir());
        let optional = library
            .manifest()
            .map(|m| OptionalTemplates::from_manifest(&m))
            .unwrap_or_default();
        let detector = TemplateDetector::new(library, Arc::clone(&source), config.detector.clone());
        let machine = JoinStateMachine::new(config.session.clone());
        let scanner = Scanner::new(config.detection_threshold, optional);
        Self {
            config,
            source,
            locator,
            detector,
            motion,
            machine,
            scanner,
            snapshot_observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> JoinState {
        self.machine.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.machine.info()
    }

    pub fn machine(&self) -> &JoinStateMachine {
        &self.machine
    }

    /// Detector access for calibration (template capture and saving).
    pub fn detector_mut(&mut self) -> &mut TemplateDetector {
        &mut self.detector
    }

    pub fn locator_mut(&mut self) -> &mut RegionLocator {
        &mut self.locator
    }

    /// Checks that every required template has been captured.
    ///
    /// Also refreshes which optional templates the scanner looks for.
    pub fn preflight(&mut self) -> std::result::Result<Manifest, SetupError> {
        let manifest = self
            .detector
            .library()
            .validate(&self.config.required_templates)?;
        let optional = OptionalTemplates::from_manifest(&manifest);
        self.scanner = Scanner::new(self.config.detection_threshold, optional);

        if let Some(res) = manifest.resolution {
            log::info!("Template resolution: {}", res);
        }
        log::info!(
            "Templates ready ({} captured, optional: loading={} server_list={} spawn_screen={})",
            manifest.templates.len(),
            optional.loading,
            optional.server_list,
            optional.spawn_screen
        );
        Ok(manifest)
    }

    /// Registers an observer for every tick's detection snapshot.
    pub fn on_snapshot<F>(&mut self, callback: F)
    where
        F: FnMut(&DetectionSnapshot, Option<Region>) + Send + 'static,
    {
        self.snapshot_observers.push(Box::new(callback));
    }

    pub fn on_state_change<F>(&mut self, callback: F) -> CallbackId
    where
        F: FnMut(JoinState, JoinState) + Send + 'static,
    {
        self.machine.on_state_change(callback)
    }

    pub fn remove_state_change_callback(&mut self, id: CallbackId) -> bool {
        self.machine.remove_state_change_callback(id)
    }

    /// Starts the state machine. Returns false if it is already running.
    pub fn start(&mut self) -> bool {
        self.machine.start()
    }

    pub fn stop(&mut self) {
        self.machine.stop();
    }

    /// Runs one scan / update / act cycle and returns the state after it.
    pub fn tick(&mut self) -> JoinState {
        let (snapshot, region) = self.scanner.scan(&mut self.locator, &mut self.detector);

        for observer in &mut self.snapshot_observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&snapshot, region))).is_err() {
                log::error!("Snapshot observer panicked");
            }
        }

        match self.machine.update(Some(&snapshot)) {
            Some(Action::Click { x, y }) => {
                log::info!("Clicking at ({}, {})", x, y);
                if !self.motion.click(x, y, MouseButton::Left, true) {
                    log::warn!("Click at ({}, {}) was not fully delivered", x, y);
                }
            }
            Some(Action::DismissPopup) => {
                log::info!("Dismissing popup ({})", self.config.dismiss_key);
                if !self.motion.press_key(&self.config.dismiss_key, None) {
                    log::warn!("Failed to press '{}'", self.config.dismiss_key);
                }
            }
            None => {}
        }

        self.machine.state()
    }

    /// Ticks at the configured interval until `stop` is set, the join
    /// succeeds, or the machine gives up and returns to idle.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> SessionInfo {
        if self.machine.state() == JoinState::Idle {
            self.machine.start();
        }

        let fps = self.config.capture.background_fps;
        if fps > 0 {
            self.source.start_background(None, fps);
        }
        let interval = Duration::from_millis(self.config.detection_interval_ms);

        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("Stop requested");
                self.machine.stop();
                break;
            }

            match self.tick() {
                JoinState::Success => {
                    log::info!("Joined the server");
                    break;
                }
                JoinState::Idle => {
                    let info = self.machine.info();
                    log::warn!(
                        "Session ended: {}",
                        info.last_error.as_deref().unwrap_or("stopped")
                    );
                    break;
                }
                _ => {}
            }

            thread::sleep(interval);
        }

        self.source.stop_background();
        let info = self.machine.info();
        log::info!(
            "Session finished in state {} ({} clicks, {} retries)",
            info.state.as_str(),
            info.total_clicks,
            info.retry_count
        );
        info
    }
}

/// Window lookup that goes with a capture backend.
fn window_backend(capture: CaptureBackend) -> WindowBackend {
    match capture {
        CaptureBackend::Native => WindowBackend::Native,
        CaptureBackend::Universal => WindowBackend::Universal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::detection::{JOIN_BUTTON, SERVER_FULL};
    use crate::capture::{Frame, Grabber, Point, WindowInfo, WindowProvider};
    use crate::input::{InputDevice, Key, Sleeper};
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Button(MouseButton, bool),
        Key(Key, bool),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

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
            Ok(true)
        }
    }

    struct FakeDevice {
        events: Events,
        cursor: Point,
    }

    impl InputDevice for FakeDevice {
        fn cursor_position(&mut self) -> Result<Point> {
            Ok(self.cursor)
        }

        fn screen_size(&mut self) -> Result<(u32, u32)> {
            Ok((1920, 1080))
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            self.cursor = Point::new(x, y);
            Ok(())
        }

        fn button(&mut self, button: MouseButton, down: bool) -> Result<()> {
            self.events.lock().push(Event::Button(button, down));
            Ok(())
        }

        fn key(&mut self, key: Key, down: bool) -> Result<()> {
            self.events.lock().push(Event::Key(key, down));
            Ok(())
        }
    }

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&mut self, _duration: Duration) {}
    }

    fn noise(w: u32, h: u32, seed: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(3);
        RgbImage::from_fn(w, h, |_, _| {
            let mut next = || {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    struct Harness {
        session: Session,
        events: Events,
        _dir: tempfile::TempDir,
    }

    /// Session over a 320x200 screen showing the join button at (100, 80)
    /// and, optionally, the "server full" popup at (200, 120).
    fn harness(show_popup: bool, window: bool, config: AppConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let button = noise(32, 18, 1);
        let popup = noise(40, 24, 2);
        let mut screen = noise(320, 200, 3);
        image::imageops::replace(&mut screen, &button, 100, 80);
        if show_popup {
            image::imageops::replace(&mut screen, &popup, 200, 120);
        }

        let mut library = TemplateLibrary::new(dir.path());
        library.save(JOIN_BUTTON, &button, None).unwrap();
        library.save(SERVER_FULL, &popup, None).unwrap();

        let config = AppConfig {
            templates_dir: Some(dir.path().to_path_buf()),
            detection_interval_ms: 1,
            detector: crate::vision::DetectorConfig {
                use_fallbacks: false,
                ..config.detector.clone()
            },
            ..config
        };
        let source = FrameSource::with_grabber(
            CaptureBackend::Universal,
            Box::new(StaticGrabber(Frame::at_origin(screen))),
        );
        let info = window.then(|| WindowInfo {
            title: "ArkAscended".to_string(),
            left: 0,
            top: 0,
            right: 320,
            bottom: 200,
            visible: true,
        });
        let locator = RegionLocator::with_provider("ArkAscended", Box::new(OneWindow(info)));
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let device = FakeDevice {
            events: Arc::clone(&events),
            cursor: Point::new(0, 0),
        };
        let motion = MotionSimulator::with_device(config.motion.clone(), Box::new(device))
            .with_sleeper(Box::new(NoSleep))
            .with_seed(9);

        Harness {
            session: Session::from_parts(config, Arc::new(source), locator, motion),
            events,
            _dir: dir,
        }
    }

    #[test]
    fn test_tick_clicks_join_button() {
        let mut h = harness(false, true, AppConfig::default());
        h.session.preflight().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.session
            .on_snapshot(move |snapshot, region| sink.lock().push((snapshot.clone(), region)));

        assert!(h.session.start());
        assert_eq!(h.session.tick(), JoinState::Clicking);
        assert_eq!(h.session.tick(), JoinState::Waiting);

        assert_eq!(
            *h.events.lock(),
            vec![
                Event::Button(MouseButton::Left, true),
                Event::Button(MouseButton::Left, false)
            ]
        );
        assert_eq!(h.session.info().total_clicks, 1);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        let (snapshot, region) = &seen[0];
        assert_eq!(*region, Region::new(0, 0, 320, 200));
        let button = snapshot.join_button.expect("join button seen");
        assert!(button.x.abs_diff(116) <= 1 && button.y.abs_diff(89) <= 1, "got {}", button);
    }

    #[test]
    fn test_server_full_dismissed_with_key() {
        let mut h = harness(true, true, AppConfig::default());
        h.session.start();
        h.session.tick();
        h.session.tick();
        assert_eq!(h.session.tick(), JoinState::FailedFull);
        assert_eq!(h.session.tick(), JoinState::Retry);

        let events = h.events.lock();
        assert!(events.contains(&Event::Key(Key::Escape, true)));
        assert!(events.contains(&Event::Key(Key::Escape, false)));
        assert_eq!(h.session.info().retry_count, 1);
        assert_eq!(h.session.info().last_error.as_deref(), Some("Server full"));
    }

    #[test]
    fn test_preflight_requires_templates() {
        let mut config = AppConfig::default();
        config.required_templates.push("loading".to_string());
        let mut h = harness(false, true, config);
        match h.session.preflight() {
            Err(SetupError::TemplateNotListed(name)) => assert_eq!(name, "loading"),
            other => panic!("expected TemplateNotListed, got {:?}", other),
        }
    }

    #[test]
    fn test_run_stops_when_requested() {
        let mut h = harness(false, true, AppConfig::default());
        let stop = Arc::new(AtomicBool::new(true));
        let info = h.session.run(stop);
        assert_eq!(info.state, JoinState::Idle);
        assert_eq!(info.total_clicks, 0);
        assert!(h.events.lock().is_empty());
    }

    #[test]
    fn test_run_ends_when_window_missing() {
        let mut config = AppConfig::default();
        config.session.window_timeout = 0.0;
        let mut h = harness(false, false, config);
        let info = h.session.run(Arc::new(AtomicBool::new(false)));
        assert_eq!(info.state, JoinState::Idle);
        assert_eq!(info.last_error.as_deref(), Some("Window not found"));
    }

    #[test]
    fn test_run_gives_up_after_max_retries() {
        let mut config = AppConfig::default();
        config.session.max_retries = 1;
        let mut h = harness(true, true, config);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        h.session.on_state_change(move |_, new| sink.lock().push(new));

        let info = h.session.run(Arc::new(AtomicBool::new(false)));
        assert_eq!(info.state, JoinState::Idle);
        assert_eq!(info.last_error.as_deref(), Some("Max retries reached"));
        assert_eq!(
            *transitions.lock(),
            vec![
                JoinState::Searching,
                JoinState::Clicking,
                JoinState::Waiting,
                JoinState::FailedFull,
                JoinState::Idle
            ]
        );
    }

    #[test]
    fn test_window_backend_follows_capture() {
        assert_eq!(window_backend(CaptureBackend::Native), WindowBackend::Native);
        assert_eq!(window_backend(CaptureBackend::Universal), WindowBackend::Universal);
    }
}
