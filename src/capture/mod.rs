//! Screen capture and window location.
//!
//! This module provides:
//! - Frames and screen rectangles (`Frame`, `Region`, `Point`)
//! - One-shot and background capture (`FrameSource`)
//! - Game window lookup (`RegionLocator`)

pub mod frame;
#[cfg(windows)]
mod native;
pub mod source;
#[cfg(feature = "desktop")]
mod universal;
pub mod window;

pub use frame::{Frame, Point, Region};
pub use source::{CaptureBackend, FrameSource, Grabber};
pub use window::{RegionLocator, WindowBackend, WindowInfo, WindowProvider};
