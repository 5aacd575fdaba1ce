//! # Row Packing
//!
//! One raster row becomes one line frame payload: 1 bit per pixel, most
//! significant bit first, a set bit meaning "fire". Rows whose width is not
//! a multiple of 8 are zero-padded on the right, so padding never burns.

/// Bytes needed for one packed row of `width` pixels.
#[inline]
pub fn bytes_per_row(width: u32) -> usize {
    (width as usize).div_ceil(8)
}

/// Pack a row of fire flags into bytes.
///
/// ## Example
///
/// ```
/// use wainlux::raster::pack::pack_row;
///
/// // 8 pixels pack into 1 byte
/// let row = vec![true, true, true, true, false, false, false, false];
/// assert_eq!(pack_row(&row), vec![0xF0]); // 11110000
///
/// // 10 pixels pack into 2 bytes (6 bits padding)
/// let row = vec![true; 10];
/// assert_eq!(pack_row(&row), vec![0xFF, 0xC0]); // 11111111 11000000
/// ```
pub fn pack_row(pixels: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; pixels.len().div_ceil(8)];

    for (i, &fire) in pixels.iter().enumerate() {
        if fire {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }

    bytes
}

/// Inverse of [`pack_row`]; padding bits past `width` are ignored.
pub fn unpack_row(bytes: &[u8], width: u32) -> Vec<bool> {
    (0..width as usize)
        .map(|x| {
            bytes
                .get(x / 8)
                .is_some_and(|b| b & (0x80 >> (x % 8)) != 0)
        })
        .collect()
}

/// Number of fire bits in a packed row.
#[inline]
pub fn count_fire(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}
