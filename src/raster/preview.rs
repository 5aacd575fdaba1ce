//! PNG previews of packed rasters: fire pixels black, everything else white.

use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma};

use crate::raster::pack::unpack_row;

/// Expand packed rows back into an 8-bit image.
pub fn raster_to_image(width: u32, rows: &[Vec<u8>]) -> GrayImage {
    let mut img = GrayImage::from_pixel(width, rows.len() as u32, Luma([255]));

    for (y, row) in rows.iter().enumerate() {
        for (x, fire) in unpack_row(row, width).into_iter().enumerate() {
            if fire {
                img.put_pixel(x as u32, y as u32, Luma([0]));
            }
        }
    }

    img
}

/// Encode an image as PNG in memory.
pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
