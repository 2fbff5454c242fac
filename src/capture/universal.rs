//! Cross-platform monitor capture through `xcap`.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, RgbaImage};

use super::frame::{Frame, Region};
use super::source::Grabber;

/// Captures the monitor containing the requested region.
pub struct XcapGrabber;

impl XcapGrabber {
    pub fn new() -> Self {
        Self
    }
}

impl Default for XcapGrabber {
    fn default() -> Self {
        Self::new()
    }
}

fn monitor_bounds(monitor: &xcap::Monitor) -> Result<Option<Region>> {
    Ok(Region::from_origin_size(
        monitor.x()?,
        monitor.y()?,
        monitor.width()?,
        monitor.height()?,
    ))
}

impl Grabber for XcapGrabber {
    fn grab(&mut self, region: Option<Region>) -> Result<Frame> {
        let monitors = xcap::Monitor::all().context("Failed to enumerate monitors")?;
        if monitors.is_empty() {
            return Err(anyhow!("No monitors detected"));
        }

        let mut chosen: Option<(xcap::Monitor, Region)> = None;
        for monitor in monitors {
            let Some(bounds) = monitor_bounds(&monitor)? else {
                continue;
            };
            let wanted = match region {
                Some(r) => bounds.contains(r.center()),
                None => monitor.is_primary().unwrap_or(false),
            };
            if wanted {
                chosen = Some((monitor, bounds));
                break;
            }
            if chosen.is_none() {
                chosen = Some((monitor, bounds));
            }
        }
        let (monitor, bounds) = chosen.ok_or_else(|| anyhow!("No usable monitor"))?;

        let captured = monitor.capture_image().context("Monitor capture failed")?;
        let (w, h) = (captured.width(), captured.height());
        let rgba = RgbaImage::from_raw(w, h, captured.into_raw())
            .ok_or_else(|| anyhow!("Capture buffer has unexpected size"))?;
        let frame = Frame::new(DynamicImage::ImageRgba8(rgba).to_rgb8(), bounds.top_left());

        match region {
            Some(r) => frame
                .crop(&r)
                .ok_or_else(|| anyhow!("Region {} is outside monitor {}", r, bounds)),
            None => Ok(frame),
        }
    }
}
