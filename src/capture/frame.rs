//! Pixel snapshots and screen-space geometry shared by capture and detection.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

/// An integer screen coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns this point shifted by `(dx, dy)`.
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(self, other: Point) -> f64 {
        let dx = (other.x - self.x) as f64;
        let dy = (other.y - self.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An axis-aligned screen rectangle with strictly positive width and height.
///
/// `right` and `bottom` are exclusive. A rectangle with zero or negative
/// extent (for example a minimized window) cannot be represented; the
/// constructors return `None` for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl Region {
    /// Creates a region from its edges, or `None` if it has no area.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Option<Self> {
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    /// Creates a region from its top-left corner and size.
    pub fn from_origin_size(left: i32, top: i32, width: u32, height: u32) -> Option<Self> {
        let right = left.checked_add(i32::try_from(width).ok()?)?;
        let bottom = top.checked_add(i32::try_from(height).ok()?)?;
        Self::new(left, top, right, bottom)
    }

    pub fn left(&self) -> i32 {
        self.left
    }

    pub fn top(&self) -> i32 {
        self.top
    }

    pub fn right(&self) -> i32 {
        self.right
    }

    pub fn bottom(&self) -> i32 {
        self.bottom
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top) as u32
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.left, self.top)
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.left + (self.right - self.left) / 2,
            self.top + (self.bottom - self.top) / 2,
        )
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    /// Overlapping part of two regions, if any.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        Region::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}) {}x{}",
            self.left,
            self.top,
            self.right,
            self.bottom,
            self.width(),
            self.height()
        )
    }
}

/// A captured RGB image together with the screen position of its top-left pixel.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    origin: Point,
}

impl Frame {
    pub fn new(image: RgbImage, origin: Point) -> Self {
        Self { image, origin }
    }

    /// Wraps an image whose top-left pixel is the screen origin.
    pub fn at_origin(image: RgbImage) -> Self {
        Self::new(image, Point::default())
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Screen rectangle covered by this frame, `None` for an empty image.
    pub fn bounds(&self) -> Option<Region> {
        Region::from_origin_size(self.origin.x, self.origin.y, self.width(), self.height())
    }

    /// Copies the part of this frame that lies inside `region`.
    ///
    /// Returns `None` when the region does not overlap the frame.
    pub fn crop(&self, region: &Region) -> Option<Frame> {
        let visible = self.bounds()?.intersect(region)?;
        let x = (visible.left() - self.origin.x) as u32;
        let y = (visible.top() - self.origin.y) as u32;
        let image = imageops::crop_imm(&self.image, x, y, visible.width(), visible.height()).to_image();
        Some(Frame::new(image, visible.top_left()))
    }

    /// Converts a pixel position inside this frame to screen coordinates.
    pub fn to_screen(&self, x: i32, y: i32) -> Point {
        self.origin.offset(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_region_rejects_empty() {
        assert!(Region::new(10, 10, 10, 20).is_none(), "zero width");
        assert!(Region::new(10, 10, 20, 5).is_none(), "negative height");
        assert!(Region::from_origin_size(0, 0, 0, 5).is_none());

        let r = Region::new(-5, 0, 15, 10).unwrap();
        assert_eq!((r.width(), r.height()), (20, 10));
        assert_eq!(r.center(), Point::new(5, 5));
    }

    #[test]
    fn test_region_intersect() {
        let a = Region::new(0, 0, 100, 100).unwrap();
        let b = Region::new(50, 80, 200, 300).unwrap();
        assert_eq!(a.intersect(&b), Region::new(50, 80, 100, 100));

        let c = Region::new(100, 0, 120, 10).unwrap();
        assert_eq!(a.intersect(&c), None, "touching edges do not overlap");
    }

    #[test]
    fn test_frame_crop_keeps_screen_origin() {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8, y as u8, 0]));
        let frame = Frame::new(img, Point::new(100, 200));

        let region = Region::new(110, 205, 120, 300).unwrap();
        let cropped = frame.crop(&region).unwrap();

        assert_eq!(cropped.origin(), Point::new(110, 205));
        assert_eq!((cropped.width(), cropped.height()), (10, 25), "clamped to frame");
        assert_eq!(cropped.image().get_pixel(0, 0), &Rgb([10, 5, 0]));
        assert_eq!(cropped.to_screen(3, 4), Point::new(113, 209));
    }

    #[test]
    fn test_frame_crop_outside_is_none() {
        let frame = Frame::at_origin(RgbImage::new(10, 10));
        let region = Region::new(50, 50, 60, 60).unwrap();
        assert!(frame.crop(&region).is_none());
    }
}
