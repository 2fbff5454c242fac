//! Locating the game window on screen.
//!
//! The preferred lookup walks top-level windows with `EnumWindows`; other
//! platforms (or builds without Win32) enumerate windows through `xcap`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::frame::Region;

/// How long a located window rectangle is reused before looking it up again.
pub const REGION_CACHE_TTL: Duration = Duration::from_secs(1);

/// Available window lookup strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowBackend {
    /// Win32 `EnumWindows`.
    #[default]
    Native,
    /// `xcap` window enumeration.
    Universal,
}

impl WindowBackend {
    pub fn is_available(self) -> bool {
        match self {
            WindowBackend::Native => cfg!(windows),
            WindowBackend::Universal => cfg!(feature = "desktop"),
        }
    }

    pub fn negotiate(self) -> Option<WindowBackend> {
        let fallback = match self {
            WindowBackend::Native => WindowBackend::Universal,
            WindowBackend::Universal => WindowBackend::Native,
        };
        [self, fallback].into_iter().find(|b| b.is_available())
    }
}

/// Raw geometry of a window as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowInfo {
    pub title: String,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub visible: bool,
}

/// Platform window enumeration.
pub trait WindowProvider: Send {
    /// First visible window whose title contains `title`.
    fn find(&mut self, title: &str) -> Result<Option<WindowInfo>>;

    /// Raises the matching window. Returns `false` if unsupported.
    fn bring_to_front(&mut self, title: &str) -> Result<bool>;
}

/// Finds the target window rectangle, caching it briefly.
pub struct RegionLocator {
    title: String,
    backend: Option<WindowBackend>,
    provider: Option<Box<dyn WindowProvider>>,
    cache: Option<(Region, Instant)>,
    ttl: Duration,
}

impl RegionLocator {
    /// Creates a locator for windows whose title contains `title`.
    ///
    /// If no window backend exists in this build the locator still works but
    /// never finds anything.
    pub fn new(title: impl Into<String>, preference: WindowBackend) -> Self {
        let backend = preference.negotiate();
        let provider = match backend {
            Some(backend) => {
                if backend != preference {
                    log::info!("Window lookup '{:?}' unavailable, using '{:?}'", preference, backend);
                }
                build_provider(backend)
            }
            None => {
                log::warn!("No window lookup backend available in this build");
                None
            }
        };
        Self {
            title: title.into(),
            backend,
            provider,
            cache: None,
            ttl: REGION_CACHE_TTL,
        }
    }

    /// Creates a locator around a custom provider.
    pub fn with_provider(title: impl Into<String>, provider: Box<dyn WindowProvider>) -> Self {
        Self {
            title: title.into(),
            backend: None,
            provider: Some(provider),
            cache: None,
            ttl: REGION_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn backend(&self) -> Option<WindowBackend> {
        self.backend
    }

    /// Window rectangle, reusing the last result for up to one second.
    pub fn region(&mut self) -> Option<Region> {
        if let Some((region, found_at)) = self.cache {
            if found_at.elapsed() < self.ttl {
                return Some(region);
            }
        }
        self.region_uncached()
    }

    /// Window rectangle looked up right now, refreshing the cache.
    pub fn region_uncached(&mut self) -> Option<Region> {
        let info = self.lookup()?;
        match Region::new(info.left, info.top, info.right, info.bottom) {
            Some(region) => {
                log::debug!("Window region: {}", region);
                self.cache = Some((region, Instant::now()));
                Some(region)
            }
            None => {
                log::warn!(
                    "Invalid window dimensions: {}x{} (window may be minimized)",
                    info.right - info.left,
                    info.bottom - info.top
                );
                None
            }
        }
    }

    /// Drops the cached rectangle.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    pub fn is_visible(&mut self) -> bool {
        self.lookup().is_some_and(|info| info.visible)
    }

    /// Best-effort attempt to raise the window.
    pub fn bring_to_front(&mut self) -> bool {
        let Some(provider) = self.provider.as_mut() else {
            return false;
        };
        match provider.bring_to_front(&self.title) {
            Ok(raised) => raised,
            Err(e) => {
                log::debug!("Failed to bring '{}' to front: {:#}", self.title, e);
                false
            }
        }
    }

    fn lookup(&mut self) -> Option<WindowInfo> {
        let provider = self.provider.as_mut()?;
        match provider.find(&self.title) {
            Ok(Some(info)) => Some(info),
            Ok(None) => {
                log::debug!("Window '{}' not found", self.title);
                None
            }
            Err(e) => {
                log::debug!("Window lookup failed: {:#}", e);
                None
            }
        }
    }
}

fn build_provider(backend: WindowBackend) -> Option<Box<dyn WindowProvider>> {
    match backend {
        #[cfg(windows)]
        WindowBackend::Native => Some(Box::new(win32::Win32Windows)),
        #[cfg(feature = "desktop")]
        WindowBackend::Universal => Some(Box::new(xcap_windows::XcapWindows)),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

#[cfg(windows)]
mod win32 {
    use super::{WindowInfo, WindowProvider};
    use anyhow::Result;
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT, TRUE};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowRect, GetWindowTextLengthW, GetWindowTextW, IsIconic,
        IsWindowVisible, SetForegroundWindow,
    };

    pub struct Win32Windows;

    struct EnumData<'a> {
        needle: &'a str,
        hwnd: Option<HWND>,
        title: String,
    }

    fn window_title(hwnd: HWND) -> String {
        unsafe {
            let len = GetWindowTextLengthW(hwnd);
            if len <= 0 {
                return String::new();
            }
            let mut buf: Vec<u16> = vec![0; (len + 1) as usize];
            let copied = GetWindowTextW(hwnd, &mut buf);
            OsString::from_wide(&buf[..copied.max(0) as usize])
                .to_string_lossy()
                .to_string()
        }
    }

    unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
        unsafe {
            let data = &mut *(lparam.0 as *mut EnumData);
            if !IsWindowVisible(hwnd).as_bool() {
                return TRUE;
            }
            let title = window_title(hwnd);
            if !title.is_empty() && title.contains(data.needle) {
                data.hwnd = Some(hwnd);
                data.title = title;
                return BOOL(0); // Stop enumeration
            }
            TRUE
        }
    }

    fn find_hwnd(needle: &str) -> Option<(HWND, String)> {
        let mut data = EnumData {
            needle,
            hwnd: None,
            title: String::new(),
        };
        unsafe {
            // EnumWindows reports an error when the callback stops it early
            let _ = EnumWindows(Some(enum_callback), LPARAM(&mut data as *mut _ as isize));
        }
        data.hwnd.map(|hwnd| (hwnd, data.title))
    }

    impl WindowProvider for Win32Windows {
        fn find(&mut self, title: &str) -> Result<Option<WindowInfo>> {
            let Some((hwnd, title)) = find_hwnd(title) else {
                return Ok(None);
            };
            let mut rect = RECT::default();
            unsafe { GetWindowRect(hwnd, &mut rect)? };
            let minimized = unsafe { IsIconic(hwnd).as_bool() };
            let visible = unsafe { IsWindowVisible(hwnd).as_bool() } && !minimized;
            Ok(Some(WindowInfo {
                title,
                left: rect.left,
                top: rect.top,
                right: rect.right,
                bottom: rect.bottom,
                visible,
            }))
        }

        fn bring_to_front(&mut self, title: &str) -> Result<bool> {
            let Some((hwnd, _)) = find_hwnd(title) else {
                return Ok(false);
            };
            Ok(unsafe { SetForegroundWindow(hwnd).as_bool() })
        }
    }
}

#[cfg(feature = "desktop")]
mod xcap_windows {
    use super::{WindowInfo, WindowProvider};
    use anyhow::{Context, Result};

    pub struct XcapWindows;

    impl WindowProvider for XcapWindows {
        fn find(&mut self, title: &str) -> Result<Option<WindowInfo>> {
            let windows = xcap::Window::all().context("Failed to enumerate windows")?;
            for window in windows {
                let Ok(window_title) = window.title() else {
                    continue;
                };
                if !window_title.contains(title) {
                    continue;
                }
                let minimized = window.is_minimized().unwrap_or(false);
                let left = window.x()?;
                let top = window.y()?;
                let (width, height) = if minimized {
                    (0, 0)
                } else {
                    (window.width()? as i32, window.height()? as i32)
                };
                return Ok(Some(WindowInfo {
                    title: window_title,
                    left,
                    top,
                    right: left + width,
                    bottom: top + height,
                    visible: !minimized,
                }));
            }
            Ok(None)
        }

        fn bring_to_front(&mut self, _title: &str) -> Result<bool> {
            // xcap has no activation API
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FakeWindows {
        info: Arc<Mutex<Option<WindowInfo>>>,
        lookups: Arc<Mutex<u32>>,
    }

    impl WindowProvider for FakeWindows {
        fn find(&mut self, title: &str) -> Result<Option<WindowInfo>> {
            *self.lookups.lock() += 1;
            Ok(self
                .info
                .lock()
                .clone()
                .filter(|info| info.title.contains(title)))
        }

        fn bring_to_front(&mut self, _title: &str) -> Result<bool> {
            anyhow::bail!("access denied")
        }
    }

    fn window(left: i32, top: i32, right: i32, bottom: i32) -> WindowInfo {
        WindowInfo {
            title: "ARK: Survival Ascended".to_string(),
            left,
            top,
            right,
            bottom,
            visible: true,
        }
    }

    fn locator(info: Option<WindowInfo>) -> (RegionLocator, Arc<Mutex<Option<WindowInfo>>>, Arc<Mutex<u32>>) {
        let info = Arc::new(Mutex::new(info));
        let lookups = Arc::new(Mutex::new(0));
        let provider = FakeWindows {
            info: Arc::clone(&info),
            lookups: Arc::clone(&lookups),
        };
        (
            RegionLocator::with_provider("Survival Ascended", Box::new(provider)),
            info,
            lookups,
        )
    }

    #[test]
    fn test_region_is_cached() {
        let (mut locator, _, lookups) = locator(Some(window(0, 0, 1920, 1080)));
        assert_eq!(locator.region(), Region::new(0, 0, 1920, 1080));
        assert_eq!(locator.region(), Region::new(0, 0, 1920, 1080));
        assert_eq!(*lookups.lock(), 1, "second call served from cache");

        locator.region_uncached();
        assert_eq!(*lookups.lock(), 2, "explicit bypass");
    }

    #[test]
    fn test_cache_expires() {
        let (locator, info, _) = locator(Some(window(0, 0, 800, 600)));
        let mut locator = locator.with_ttl(Duration::ZERO);
        assert!(locator.region().is_some());
        *info.lock() = Some(window(100, 100, 900, 700));
        assert_eq!(locator.region(), Region::new(100, 100, 900, 700));
    }

    #[test]
    fn test_minimized_window_is_not_found() {
        let (mut locator, _, _) = locator(Some(window(-32000, -32000, -32000, -32000)));
        assert_eq!(locator.region(), None);
    }

    #[test]
    fn test_missing_window() {
        let (mut locator, _, _) = locator(None);
        assert_eq!(locator.region(), None);
        assert!(!locator.is_visible());
    }

    #[test]
    fn test_bring_to_front_failure_is_false() {
        let (mut locator, _, _) = locator(Some(window(0, 0, 10, 10)));
        assert!(!locator.bring_to_front());
    }
}
