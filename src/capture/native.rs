//! Desktop capture through GDI (`BitBlt` from the screen DC).

use anyhow::{anyhow, bail, Result};
use image::RgbImage;

use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, CAPTUREBLT, DIB_RGB_COLORS,
    SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    GetSystemMetrics, SM_CXSCREEN, SM_CXVIRTUALSCREEN, SM_CYSCREEN, SM_CYVIRTUALSCREEN,
    SM_XVIRTUALSCREEN, SM_YVIRTUALSCREEN,
};

use super::frame::{Frame, Region};
use super::source::Grabber;

/// Grabs pixels straight from the desktop device context.
///
/// Holds no handles between calls, so it is freely movable to the
/// background capture thread.
pub struct GdiGrabber;

impl GdiGrabber {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GdiGrabber {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds of the primary monitor.
fn primary_screen() -> Option<Region> {
    let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
    Region::new(0, 0, w, h)
}

/// Bounds of the virtual desktop spanning all monitors.
fn virtual_screen() -> Option<Region> {
    unsafe {
        let x = GetSystemMetrics(SM_XVIRTUALSCREEN);
        let y = GetSystemMetrics(SM_YVIRTUALSCREEN);
        let w = GetSystemMetrics(SM_CXVIRTUALSCREEN);
        let h = GetSystemMetrics(SM_CYVIRTUALSCREEN);
        Region::new(x, y, x + w, y + h)
    }
}

impl Grabber for GdiGrabber {
    fn grab(&mut self, region: Option<Region>) -> Result<Frame> {
        let target = match region {
            Some(r) => {
                let desktop = virtual_screen().ok_or_else(|| anyhow!("No monitors detected"))?;
                r.intersect(&desktop)
                    .ok_or_else(|| anyhow!("Region {} is outside the desktop", r))?
            }
            None => primary_screen().ok_or_else(|| anyhow!("No monitors detected"))?,
        };

        let width = target.width() as i32;
        let height = target.height() as i32;
        let mut bgra = vec![0u8; target.width() as usize * target.height() as usize * 4];

        unsafe {
            let screen_dc = GetDC(HWND::default());
            if screen_dc.is_invalid() {
                bail!("GetDC failed for the desktop");
            }
            let mem_dc = CreateCompatibleDC(screen_dc);
            let bitmap = CreateCompatibleBitmap(screen_dc, width, height);
            let previous = SelectObject(mem_dc, bitmap);

            let blit = BitBlt(
                mem_dc,
                0,
                0,
                width,
                height,
                screen_dc,
                target.left(),
                target.top(),
                SRCCOPY | CAPTUREBLT,
            );

            // Negative height requests a top-down DIB
            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    biHeight: -height,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let rows = GetDIBits(
                mem_dc,
                bitmap,
                0,
                height as u32,
                Some(bgra.as_mut_ptr().cast()),
                &mut info,
                DIB_RGB_COLORS,
            );

            SelectObject(mem_dc, previous);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(mem_dc);
            ReleaseDC(HWND::default(), screen_dc);

            blit.map_err(|e| anyhow!("BitBlt failed: {}", e))?;
            if rows == 0 {
                bail!("GetDIBits copied no rows");
            }
        }

        let image = RgbImage::from_fn(target.width(), target.height(), |x, y| {
            let offset = (y as usize * target.width() as usize + x as usize) * 4;
            // BGRA -> RGB
            image::Rgb([bgra[offset + 2], bgra[offset + 1], bgra[offset]])
        });

        Ok(Frame::new(image, target.top_left()))
    }
}
