//! # Laser-Aware Grayscale
//!
//! A diode laser burns what absorbs its wavelength. When converting color
//! artwork to luminance, the channels the laser absorbs are weighted up so
//! they read darker and burn.
//!
//! | Laser | R | G | B |
//! |-------|---|---|---|
//! | Neutral (Rec.601) | 0.299 | 0.587 | 0.114 |
//! | Blue (450 nm) | 0.45 | 0.45 | 0.10 |
//! | Red (650 nm) | 0.10 | 0.45 | 0.45 |
//! | Green (532 nm) | 0.45 | 0.10 | 0.45 |
//!
//! Transparent pixels are composited onto white (no burn).

use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaserColor {
    #[default]
    Neutral,
    Blue,
    Red,
    Green,
}

impl LaserColor {
    /// Channel weights (r, g, b).
    pub fn weights(self) -> [f32; 3] {
        match self {
            LaserColor::Neutral => [0.299, 0.587, 0.114],
            LaserColor::Blue => [0.45, 0.45, 0.10],
            LaserColor::Red => [0.10, 0.45, 0.45],
            LaserColor::Green => [0.45, 0.10, 0.45],
        }
    }

    /// Luminance of one RGBA pixel over a white background.
    pub fn luma(self, [r, g, b, a]: [u8; 4]) -> u8 {
        let alpha = a as f32 / 255.0;
        let over_white = |c: u8| c as f32 * alpha + 255.0 * (1.0 - alpha);
        let [wr, wg, wb] = self.weights();
        let y = wr * over_white(r) + wg * over_white(g) + wb * over_white(b);
        y.round().clamp(0.0, 255.0) as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LaserColor::Neutral => "neutral",
            LaserColor::Blue => "blue",
            LaserColor::Red => "red",
            LaserColor::Green => "green",
        }
    }
}

impl fmt::Display for LaserColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LaserColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "neutral" => Ok(LaserColor::Neutral),
            "blue" => Ok(LaserColor::Blue),
            "red" => Ok(LaserColor::Red),
            "green" => Ok(LaserColor::Green),
            other => Err(format!(
                "unknown laser color '{other}' (expected neutral, blue, red or green)"
            )),
        }
    }
}

/// Convert any image to single-channel luminance for `color`.
pub fn to_luma(img: &DynamicImage, color: LaserColor) -> GrayImage {
    let rgba = img.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        Luma([color.luma(rgba.get_pixel(x, y).0)])
    })
}
