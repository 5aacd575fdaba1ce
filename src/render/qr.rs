//! # Wi-Fi QR Cards
//!
//! Renders a Wi-Fi join code sized for burning onto a credit-card blank.
//!
//! ## Card Geometry
//!
//! ```text
//! card stock  85.6 mm = 1712 px
//! burn area   75.0 mm × 54.0 mm = 1500 × 1080 px
//! offset      (1712 - 1500) / 2 = 106 px to the right
//! ```
//!
//! The QR uses error correction level H so a slightly charred module still
//! scans. Modules are scaled by an integer factor, so edges stay crisp
//! through the threshold step.

use std::fmt;
use std::str::FromStr;

use image::{GrayImage, Luma};
use qrcode::{EcLevel, QrCode};

use crate::error::RenderError;

pub const CARD_WIDTH: u32 = 1500;
pub const CARD_HEIGHT: u32 = 1080;
pub const CARD_STOCK_WIDTH: u32 = 1712;
pub const OFFSET_RIGHT: u32 = (CARD_STOCK_WIDTH - CARD_WIDTH) / 2;

/// 3 mm margin top and bottom
const MIN_MARGIN: u32 = 60;

/// Light modules around the code
const QUIET_ZONE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WifiSecurity {
    #[default]
    Wpa,
    Wep,
    Open,
}

impl WifiSecurity {
    pub fn as_str(self) -> &'static str {
        match self {
            WifiSecurity::Wpa => "WPA",
            WifiSecurity::Wep => "WEP",
            WifiSecurity::Open => "nopass",
        }
    }
}

impl fmt::Display for WifiSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WifiSecurity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "WPA" | "WPA2" | "WPA3" => Ok(WifiSecurity::Wpa),
            "WEP" => Ok(WifiSecurity::Wep),
            "" | "NONE" | "NOPASS" | "OPEN" => Ok(WifiSecurity::Open),
            other => Err(format!("unknown security '{other}' (expected WPA, WEP or none)")),
        }
    }
}

/// Credentials for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCard {
    pub ssid: String,
    pub password: String,
    pub security: WifiSecurity,
}

impl WifiCard {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            security: WifiSecurity::default(),
        }
    }

    pub fn with_security(mut self, security: WifiSecurity) -> Self {
        self.security = security;
        self
    }

    /// The `WIFI:` URI encoded in the code.
    ///
    /// ```
    /// use wainlux::render::qr::WifiCard;
    ///
    /// let card = WifiCard::new("home", "secret");
    /// assert_eq!(card.payload(), "WIFI:T:WPA;S:home;P:secret;H:false;;");
    /// ```
    pub fn payload(&self) -> String {
        format!(
            "WIFI:T:{};S:{};P:{};H:false;;",
            self.security,
            escape(&self.ssid),
            escape(&self.password)
        )
    }

    /// Render the card image: white background, black modules.
    pub fn render(&self) -> Result<GrayImage, RenderError> {
        if self.ssid.trim().is_empty() {
            return Err(RenderError::EmptySsid);
        }

        let code = QrCode::with_error_correction_level(self.payload(), EcLevel::H)
            .map_err(|e| RenderError::Qr(e.to_string()))?;

        let modules = code.width() as u32 + 2 * QUIET_ZONE;
        let available = (CARD_WIDTH - 40 - OFFSET_RIGHT).min(CARD_HEIGHT - 2 * MIN_MARGIN);
        let cell = available / modules;
        if cell == 0 {
            return Err(RenderError::QrTooLarge { available });
        }

        let size = cell * modules;
        let left = (CARD_WIDTH - size) / 2 + OFFSET_RIGHT;
        let top = (CARD_HEIGHT - size) / 2;
        let width = code.width();

        log::debug!(
            "QR {}x{} modules at {} px/module, origin ({}, {})",
            width,
            width,
            cell,
            left,
            top
        );

        Ok(GrayImage::from_fn(CARD_WIDTH, CARD_HEIGHT, |x, y| {
            if x < left || y < top || x >= left + size || y >= top + size {
                return Luma([255]);
            }
            let qx = ((x - left) / cell) as i64 - QUIET_ZONE as i64;
            let qy = ((y - top) / cell) as i64 - QUIET_ZONE as i64;
            let inside = (0..width as i64).contains(&qx) && (0..width as i64).contains(&qy);
            if inside && code[(qx as usize, qy as usize)] == qrcode::Color::Dark {
                Luma([0])
            } else {
                Luma([255])
            }
        }))
    }
}

/// Backslash-escape the characters the `WIFI:` grammar reserves.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ';' | ',' | ':' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Convenience wrapper over [`WifiCard::render`].
pub fn render_wifi_qr(
    ssid: &str,
    password: &str,
    security: WifiSecurity,
) -> Result<GrayImage, RenderError> {
    WifiCard::new(ssid, password)
        .with_security(security)
        .render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset() {
        assert_eq!(OFFSET_RIGHT, 106);
    }

    #[test]
    fn test_payload_escaping() {
        let card = WifiCard::new("my;net", r"pa:ss\word").with_security(WifiSecurity::Wep);
        assert_eq!(card.payload(), r"WIFI:T:WEP;S:my\;net;P:pa\:ss\\word;H:false;;");
    }

    #[test]
    fn test_security_parse() {
        assert_eq!("wpa2".parse::<WifiSecurity>(), Ok(WifiSecurity::Wpa));
        assert_eq!("none".parse::<WifiSecurity>(), Ok(WifiSecurity::Open));
        assert!("wpa9".parse::<WifiSecurity>().is_err());
    }

    #[test]
    fn test_empty_ssid_rejected() {
        assert_eq!(
            render_wifi_qr(" ", "x", WifiSecurity::Wpa).unwrap_err(),
            RenderError::EmptySsid
        );
    }

    #[test]
    fn test_card_layout() {
        let img = render_wifi_qr("workshop", "laser-k6", WifiSecurity::Wpa).unwrap();
        assert_eq!(img.dimensions(), (CARD_WIDTH, CARD_HEIGHT));

        let dark_columns: Vec<u32> = (0..CARD_WIDTH)
            .filter(|&x| (0..CARD_HEIGHT).any(|y| img.get_pixel(x, y)[0] == 0))
            .collect();
        let first = dark_columns[0];
        let last = dark_columns[dark_columns.len() - 1];
        // Shifted right of the card's own center
        assert!((first + last) / 2 > CARD_WIDTH / 2);
        assert!(last < CARD_WIDTH);
        // Top margin honored
        assert!((0..MIN_MARGIN).all(|y| (0..CARD_WIDTH).all(|x| img.get_pixel(x, y)[0] == 255)));
    }
}
