//! # Image Pipeline
//!
//! Turns an arbitrary source image into a bounded, centered 1-bit raster
//! plus the burn parameters for one job.
//!
//! ## Steps
//!
//! 1. **Fit**: scale down (aspect preserved) to fit the canvas; images that
//!    already fit are left alone
//! 2. **Luminance**: laser-aware grayscale, alpha over white
//! 3. **Threshold**: strict binary mask at 128 (darker than the cutoff fires)
//! 4. **Pack**: MSB-first rows, zero-padded (rows packed in parallel)
//! 5. **Place**: `center_x = width / 2 + 67`, `center_y = canvas_height / 2`
//!
//! There is no per-pixel intensity; depth applies to the whole job.
//! Oversized images are never rejected, only zero-area or undecodable ones.
//!
//! ## Example
//!
//! ```
//! use image::{DynamicImage, GrayImage};
//! use wainlux::raster::{prepare, PrepareOptions};
//!
//! let img = DynamicImage::ImageLuma8(GrayImage::new(2000, 1000));
//! let raster = prepare(&img, &PrepareOptions::default()).unwrap();
//! assert!(raster.resized);
//! assert_eq!((raster.width, raster.height), (1600, 800));
//! ```

pub mod grayscale;
pub mod pack;
pub mod preview;

use image::imageops::FilterType;
use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;

use crate::device::DeviceSpec;
use crate::error::{BoundsError, WainluxError};

pub use grayscale::LaserColor;

/// Default luminance cutoff: pixels darker than this fire
pub const DEFAULT_THRESHOLD: u8 = 128;

/// Knobs for [`prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareOptions {
    /// Canvas width; clamped to the device limit
    pub max_width: u32,
    /// Canvas height; clamped to the device limit
    pub max_height: u32,
    pub threshold: u8,
    /// Burn the light parts instead of the dark ones
    pub invert: bool,
    pub laser_color: LaserColor,
    /// Burn depth (1-255); device default when `None`
    pub depth: Option<u8>,
    /// Laser power; nominal when `None`
    pub power: Option<u16>,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            max_width: DeviceSpec::K6.max_width,
            max_height: DeviceSpec::K6.max_height,
            threshold: DEFAULT_THRESHOLD,
            invert: false,
            laser_color: LaserColor::default(),
            depth: None,
            power: None,
        }
    }
}

/// Where the raster lands on the work area, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub center_x: u32,
    pub center_y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RasterStats {
    pub fire_pixels: u64,
    pub total_pixels: u64,
    pub burn_percentage: f32,
}

impl RasterStats {
    fn new(fire_pixels: u64, total_pixels: u64) -> Self {
        let burn_percentage = if total_pixels == 0 {
            0.0
        } else {
            fire_pixels as f32 * 100.0 / total_pixels as f32
        };
        Self {
            fire_pixels,
            total_pixels,
            burn_percentage,
        }
    }
}

/// Everything the job controller needs to burn one image.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterJobInput {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub resized: bool,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Packed rows, top to bottom
    pub rows: Vec<Vec<u8>>,
    pub placement: Placement,
    pub depth: u8,
    pub power: u16,
    pub stats: RasterStats,
}

impl RasterJobInput {
    #[inline]
    pub fn bytes_per_row(&self) -> usize {
        pack::bytes_per_row(self.width)
    }

    /// Raster payload size across all line frames.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    pub fn is_fire(&self, x: u32, y: u32) -> bool {
        self.rows
            .get(y as usize)
            .and_then(|row| row.get(x as usize / 8))
            .is_some_and(|b| b & (0x80 >> (x % 8)) != 0)
    }

    pub fn to_image(&self) -> image::GrayImage {
        preview::raster_to_image(self.width, &self.rows)
    }

    /// 1-bit preview as PNG bytes.
    pub fn to_png(&self) -> Result<Vec<u8>, WainluxError> {
        preview::encode_png(&self.to_image())
            .map_err(|e| WainluxError::Image(format!("Failed to encode PNG: {}", e)))
    }
}

/// Scaled size that fits `max_w`×`max_h` with aspect preserved.
/// Returns `(width, height, resized)`.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32, bool) {
    if width <= max_w && height <= max_h {
        return (width, height, false);
    }
    let scale = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * scale).floor() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).floor() as u32).clamp(1, max_h);
    (w, h, true)
}

/// Decode image bytes in any format the `image` crate understands.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, BoundsError> {
    image::load_from_memory(bytes).map_err(|e| BoundsError::Decode(e.to_string()))
}

/// Decode then [`prepare`].
pub fn prepare_bytes(bytes: &[u8], options: &PrepareOptions) -> Result<RasterJobInput, BoundsError> {
    prepare(&decode(bytes)?, options)
}

/// Run the pipeline on a decoded image.
pub fn prepare(
    source: &DynamicImage,
    options: &PrepareOptions,
) -> Result<RasterJobInput, BoundsError> {
    let spec = DeviceSpec::K6;
    let canvas_width = options.max_width.min(spec.max_width);
    let canvas_height = options.max_height.min(spec.max_height);
    if canvas_width == 0 || canvas_height == 0 {
        return Err(BoundsError::InvalidCanvas {
            width: options.max_width,
            height: options.max_height,
        });
    }

    let (source_width, source_height) = (source.width(), source.height());
    if source_width == 0 || source_height == 0 {
        return Err(BoundsError::ZeroArea {
            width: source_width,
            height: source_height,
        });
    }

    let (width, height, resized) =
        fit_within(source_width, source_height, canvas_width, canvas_height);
    let gray = if resized {
        log::debug!(
            "Resizing {}x{} -> {}x{}",
            source_width,
            source_height,
            width,
            height
        );
        let scaled = source.resize_exact(width, height, FilterType::Lanczos3);
        grayscale::to_luma(&scaled, options.laser_color)
    } else {
        grayscale::to_luma(source, options.laser_color)
    };

    let threshold = options.threshold;
    let invert = options.invert;
    let rows: Vec<Vec<u8>> = (0..height)
        .into_par_iter()
        .map(|y| {
            let fire: Vec<bool> = (0..width)
                .map(|x| (gray.get_pixel(x, y)[0] < threshold) != invert)
                .collect();
            pack::pack_row(&fire)
        })
        .collect();

    let fire_pixels = rows.iter().map(|r| pack::count_fire(r)).sum();
    let stats = RasterStats::new(fire_pixels, width as u64 * height as u64);

    let placement = Placement {
        center_x: spec.center_x(width),
        center_y: spec.center_y(canvas_height),
    };

    log::info!(
        "Prepared {}x{} raster ({:.1}% burn) at ({}, {})",
        width,
        height,
        stats.burn_percentage,
        placement.center_x,
        placement.center_y
    );

    Ok(RasterJobInput {
        width,
        height,
        source_width,
        source_height,
        resized,
        canvas_width,
        canvas_height,
        rows,
        placement,
        depth: spec.clamp_depth(options.depth),
        power: spec.clamp_power(options.power),
        stats,
    })
}

// ============================================================================
// TESTS
// ============================================================================
