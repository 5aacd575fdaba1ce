//! # Calibration Patterns
//!
//! Binary test images for checking alignment and the usable work area.
//! Every pattern fills the full work area (1600 × 1520 px at 0.05 mm/px)
//! so it burns where the head actually reaches.
//!
//! | Name | Shows |
//! |------|-------|
//! | `center` | small box with crosshair in the middle |
//! | `frame` | outline of the work area |
//! | `grid` | lines every `size_mm` plus the outline |
//! | `corners` | a box in each corner |
//! | `bottom-test` | diagonal across the bottom eighth (Y travel limit) |
//!
//! The output is a `GrayImage` (black = burn) fed through the normal image
//! pipeline.

use image::{GrayImage, Luma};

use crate::device::DeviceSpec;
use crate::error::RenderError;

/// All available patterns, in display order.
pub const PATTERNS: &[&str] = &["center", "frame", "grid", "corners", "bottom-test"];

/// Feature size used when none is given
pub const DEFAULT_SIZE_MM: f32 = 10.0;

/// Trait for calibration patterns.
pub trait Pattern: Send + Sync {
    /// Pattern name (lowercase, e.g., "grid").
    fn name(&self) -> &'static str;

    /// True where the laser fires.
    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool;

    /// Default dimensions (width, height): the full work area.
    fn default_dimensions(&self) -> (u32, u32) {
        (DeviceSpec::K6.max_width, DeviceSpec::K6.max_height)
    }
}

/// Is (x, y) on the `thickness`-px outline of the rectangle?
#[inline]
fn on_outline(x: u32, y: u32, left: u32, top: u32, w: u32, h: u32, thickness: u32) -> bool {
    if x < left || y < top || x >= left + w || y >= top + h {
        return false;
    }
    let (dx, dy) = (x - left, y - top);
    dx < thickness || dy < thickness || dx >= w.saturating_sub(thickness) || dy >= h.saturating_sub(thickness)
}

/// Box with crosshair in the middle of the work area.
#[derive(Debug, Clone)]
pub struct Center {
    pub box_px: u32,
    pub cross_half_px: u32,
}

impl Center {
    pub fn new(size_mm: f32) -> Self {
        let spec = DeviceSpec::K6;
        Self {
            box_px: spec.mm_to_px(size_mm).max(4),
            cross_half_px: spec.mm_to_px(2.5),
        }
    }
}

impl Pattern for Center {
    fn name(&self) -> &'static str {
        "center"
    }

    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let size = self.box_px.min(width).min(height);
        let (left, top) = ((width - size) / 2, (height - size) / 2);
        let (cx, cy) = (width / 2, height / 2);
        let half = self.cross_half_px;

        let horizontal = y == cy && x + half >= cx && x <= cx + half;
        let vertical = x == cx && y + half >= cy && y <= cy + half;
        on_outline(x, y, left, top, size, size, 2) || horizontal || vertical
    }
}

/// Outline of the work area.
#[derive(Debug, Clone, Default)]
pub struct Frame;

impl Pattern for Frame {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        on_outline(x, y, 0, 0, width, height, 2)
    }
}

/// Square grid with a heavier outline.
#[derive(Debug, Clone)]
pub struct Grid {
    pub spacing_px: u32,
}

impl Grid {
    pub fn new(size_mm: f32) -> Self {
        Self {
            spacing_px: DeviceSpec::K6.mm_to_px(size_mm).max(2),
        }
    }
}

impl Pattern for Grid {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        x % self.spacing_px == 0 || y % self.spacing_px == 0 || on_outline(x, y, 0, 0, width, height, 2)
    }
}

/// A box in each corner plus a thin outline.
#[derive(Debug, Clone)]
pub struct Corners {
    pub box_px: u32,
}

impl Corners {
    pub fn new(size_mm: f32) -> Self {
        Self {
            box_px: DeviceSpec::K6.mm_to_px(size_mm).max(4),
        }
    }
}

impl Pattern for Corners {
    fn name(&self) -> &'static str {
        "corners"
    }

    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let b = self.box_px.min(width).min(height);
        let (right, bottom) = (width - b, height - b);
        [(0, 0), (right, 0), (0, bottom), (right, bottom)]
            .iter()
            .any(|&(left, top)| on_outline(x, y, left, top, b, b, 2))
            || on_outline(x, y, 0, 0, width, height, 1)
    }
}

/// Three-pixel diagonal from the left edge at 7/8 height to the bottom
/// right corner. Where it stops burning is where Y travel ends.
#[derive(Debug, Clone, Default)]
pub struct BottomTest;

impl Pattern for BottomTest {
    fn name(&self) -> &'static str {
        "bottom-test"
    }

    fn ink(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        if width < 2 || height < 2 {
            return false;
        }
        let start_y = (height - height / 8) as f32;
        let end_y = (height - 1) as f32;
        let t = x as f32 / (width - 1) as f32;
        let line_y = start_y + (end_y - start_y) * t;
        (y as f32 - line_y).abs() <= 1.0
    }
}

/// Get a pattern by name; `size_mm` sizes its features.
pub fn by_name(name: &str, size_mm: f32) -> Option<Box<dyn Pattern>> {
    match name.to_lowercase().as_str() {
        "center" => Some(Box::new(Center::new(size_mm))),
        "frame" => Some(Box::new(Frame)),
        "grid" => Some(Box::new(Grid::new(size_mm))),
        "corners" => Some(Box::new(Corners::new(size_mm))),
        "bottom-test" | "bottom" => Some(Box::new(BottomTest)),
        _ => None,
    }
}

/// List all available pattern names.
pub fn list_patterns() -> &'static [&'static str] {
    PATTERNS
}

/// Render a pattern at its default dimensions.
pub fn render(pattern: &dyn Pattern) -> GrayImage {
    let (width, height) = pattern.default_dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        if pattern.ink(x, y, width, height) {
            Luma([0])
        } else {
            Luma([255])
        }
    })
}

/// Look up and render a pattern.
pub fn render_named(name: &str, size_mm: f32) -> Result<GrayImage, RenderError> {
    let pattern = by_name(name, size_mm).ok_or_else(|| RenderError::UnknownPattern(name.to_string()))?;
    Ok(render(pattern.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black(img: &GrayImage, x: u32, y: u32) -> bool {
        img.get_pixel(x, y)[0] == 0
    }

    #[test]
    fn test_list_patterns() {
        let patterns = list_patterns();
        assert_eq!(patterns.len(), 5);
        for name in patterns {
            assert!(by_name(name, DEFAULT_SIZE_MM).is_some(), "{name}");
        }
    }

    #[test]
    fn test_by_name() {
        assert!(by_name("GRID", 5.0).is_some()); // Case insensitive
        assert!(by_name("bottom", 5.0).is_some()); // Alias
        assert!(by_name("ripple", 5.0).is_none());
        assert_eq!(
            render_named("nope", 5.0).unwrap_err(),
            RenderError::UnknownPattern("nope".into())
        );
    }

    #[test]
    fn test_patterns_fill_work_area() {
        let img = render_named("frame", DEFAULT_SIZE_MM).unwrap();
        assert_eq!(img.dimensions(), (1600, 1520));
        assert!(black(&img, 0, 0));
        assert!(black(&img, 1599, 1519));
        assert!(!black(&img, 800, 760));
    }

    #[test]
    fn test_center_crosshair() {
        let img = render_named("center", 10.0).unwrap();
        assert!(black(&img, 800, 760));
        // 10 mm box = 200 px, outline at 700..=899 horizontally
        assert!(black(&img, 700, 760));
        assert!(!black(&img, 690, 760));
        assert!(!black(&img, 0, 0));
    }

    #[test]
    fn test_grid_spacing() {
        let img = render_named("grid", 10.0).unwrap();
        assert!(black(&img, 200, 333));
        assert!(!black(&img, 201, 333));
    }

    #[test]
    fn test_corners() {
        let img = render_named("corners", 10.0).unwrap();
        assert!(black(&img, 199, 100));
        assert!(black(&img, 1400, 100));
        assert!(!black(&img, 800, 760));
    }

    #[test]
    fn test_bottom_test_stays_low() {
        let img = render_named("bottom-test", DEFAULT_SIZE_MM).unwrap();
        assert!(black(&img, 0, 1330));
        assert!(black(&img, 1599, 1519));
        let top_half_ink = (0..760).any(|y| (0..1600).any(|x| black(&img, x, y)));
        assert!(!top_half_ink);
    }
}
