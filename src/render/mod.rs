//! # Rendering Module
//!
//! Generators for images the engraver burns besides user artwork.
//!
//! ## Modules
//!
//! - [`patterns`]: calibration patterns (center, frame, grid, corners, bottom-test)
//! - [`qr`]: Wi-Fi QR cards sized for credit-card blanks
//!
//! ## Usage Example
//!
//! ```
//! use image::DynamicImage;
//! use wainlux::raster::{prepare, PrepareOptions};
//! use wainlux::render::patterns;
//!
//! let img = patterns::render_named("grid", 10.0).unwrap();
//! let raster = prepare(&DynamicImage::ImageLuma8(img), &PrepareOptions::default()).unwrap();
//! assert_eq!(raster.rows.len(), 1520);
//! ```

pub mod patterns;
pub mod qr;
