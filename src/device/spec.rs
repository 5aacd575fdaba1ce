//! # Engraver Hardware Specification
//!
//! This module defines the physical characteristics of supported engravers.
//!
//! ## Supported Devices
//!
//! | Model | Work area (px) | Resolution | Work area (mm) |
//! |-------|----------------|------------|----------------|
//! | Wainlux K6 | 1600 × 1520 | 0.05 mm/px | 80 × 76 |
//!
//! ## Usage
//!
//! ```
//! use wainlux::device::DeviceSpec;
//!
//! let spec = DeviceSpec::K6;
//! println!("Work area: {}x{} px ({}x{} mm)",
//!          spec.max_width,
//!          spec.max_height,
//!          spec.work_width_mm(),
//!          spec.work_height_mm());
//! ```

use std::time::Duration;

/// # Device Specification
///
/// Defines the hardware characteristics of a laser engraver.
///
/// ## Geometry
///
/// - **max_width / max_height**: hard limits of the work area in device units
///   (pixels). The Y axis is shorter than X on the K6: 1520 px were measured,
///   not the 1600 px the vendor advertises.
/// - **center_x_bias**: horizontal correction added to the raster half-width
///   when centering. Discovered empirically on the reference unit.
///
/// ## Placement Rule
///
/// ```text
/// center_x = raster_width / 2 + center_x_bias
/// center_y = canvas_height / 2
///
/// For a 1600 px wide raster on the K6:
///   center_x = 800 + 67 = 867
///   center_y = 1520 / 2 = 760
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSpec {
    /// Device model name
    pub name: &'static str,

    /// Maximum raster width in device units
    pub max_width: u32,

    /// Maximum raster height in device units
    pub max_height: u32,

    /// Millimetres per device unit
    pub mm_per_px: f32,

    /// Horizontal centering correction in device units
    pub center_x_bias: u32,

    /// Serial baud rate (fixed by the firmware)
    pub baud: u32,

    /// Nominal laser power observed in captured traffic
    pub nominal_power: u16,

    /// Upper bound for the power parameter
    pub max_power: u16,

    /// Burn depth used when the caller does not specify one
    pub default_depth: u8,

    /// Mandatory pause after a motion command before the next command
    pub settle: Duration,
}

impl DeviceSpec {
    /// # Wainlux K6 Configuration
    ///
    /// Desktop blue-diode engraver driven over a CH340 USB serial bridge.
    ///
    /// | Property | Value |
    /// |----------|-------|
    /// | Work area | 80 × 76 mm |
    /// | Resolution | 0.05 mm/px |
    /// | Link | 115200 baud, 8N1 |
    /// | Power | 0–1000 (1000 nominal) |
    /// | Depth | 1–255 (100 default) |
    pub const K6: Self = Self {
        name: "Wainlux K6",
        max_width: 1600,
        max_height: 1520,
        mm_per_px: 0.05,
        center_x_bias: 67,
        baud: 115_200,
        nominal_power: 1000,
        max_power: 1000,
        default_depth: 100,
        settle: Duration::from_millis(100),
    };

    /// Work area width in millimetres
    #[inline]
    pub fn work_width_mm(&self) -> f32 {
        self.px_to_mm(self.max_width)
    }

    /// Work area height in millimetres
    #[inline]
    pub fn work_height_mm(&self) -> f32 {
        self.px_to_mm(self.max_height)
    }

    /// Convert millimetres to device units (rounded)
    #[inline]
    pub fn mm_to_px(&self, mm: f32) -> u32 {
        (mm / self.mm_per_px).round().max(0.0) as u32
    }

    /// Convert device units to millimetres
    #[inline]
    pub fn px_to_mm(&self, px: u32) -> f32 {
        px as f32 * self.mm_per_px
    }

    /// Horizontal center for a raster of the given width.
    #[inline]
    pub fn center_x(&self, raster_width: u32) -> u32 {
        raster_width / 2 + self.center_x_bias
    }

    /// Vertical center for a canvas of the given height.
    #[inline]
    pub fn center_y(&self, canvas_height: u32) -> u32 {
        canvas_height / 2
    }

    /// Clamp a depth request into the valid 1–255 range.
    #[inline]
    pub fn clamp_depth(&self, depth: Option<u8>) -> u8 {
        depth.unwrap_or(self.default_depth).max(1)
    }

    /// Clamp a power request into the valid range.
    #[inline]
    pub fn clamp_power(&self, power: Option<u16>) -> u16 {
        power.unwrap_or(self.nominal_power).min(self.max_power)
    }
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::K6
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k6_dimensions() {
        let spec = DeviceSpec::K6;
        assert_eq!(spec.max_width, 1600);
        assert_eq!(spec.max_height, 1520);
        assert_eq!(spec.baud, 115_200);
    }

    #[test]
    fn test_work_area_mm() {
        let spec = DeviceSpec::K6;
        assert!((spec.work_width_mm() - 80.0).abs() < 0.01);
        assert!((spec.work_height_mm() - 76.0).abs() < 0.01);
    }

    #[test]
    fn test_mm_px_conversion() {
        let spec = DeviceSpec::K6;
        assert_eq!(spec.mm_to_px(10.0), 200);
        assert_eq!(spec.mm_to_px(2.5), 50);
        assert!((spec.px_to_mm(200) - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_placement_rule() {
        let spec = DeviceSpec::K6;
        assert_eq!(spec.center_x(1600), 867);
        assert_eq!(spec.center_x(10), 72);
        assert_eq!(spec.center_y(1520), 760);
    }

    #[test]
    fn test_burn_parameter_defaults() {
        let spec = DeviceSpec::K6;
        assert_eq!(spec.clamp_depth(None), 100);
        assert_eq!(spec.clamp_depth(Some(0)), 1);
        assert_eq!(spec.clamp_depth(Some(255)), 255);
        assert_eq!(spec.clamp_power(None), 1000);
        assert_eq!(spec.clamp_power(Some(5000)), 1000);
        assert_eq!(spec.clamp_power(Some(500)), 500);
    }

    #[test]
    fn test_settle_is_100ms() {
        assert_eq!(DeviceSpec::K6.settle, Duration::from_millis(100));
    }
}
