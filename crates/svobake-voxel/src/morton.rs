//! 3D Morton (Z-order) codes for 8-bit chunk-local coordinates.

#[inline]
fn spread(v: u8) -> u32 {
    let mut x = v as u32;
    x = (x | (x << 8)) & 0x0000_F00F;
    x = (x | (x << 4)) & 0x000C_30C3;
    x = (x | (x << 2)) & 0x0024_9249;
    x
}

#[inline]
fn compact(v: u32) -> u8 {
    let mut x = v & 0x0024_9249;
    x = (x | (x >> 2)) & 0x000C_30C3;
    x = (x | (x >> 4)) & 0x0000_F00F;
    x = (x | (x >> 8)) & 0x0000_00FF;
    x as u8
}

/// Interleaves bits as `...z1y1x1 z0y0x0`.
#[inline]
pub fn encode(x: u8, y: u8, z: u8) -> u32 {
    spread(x) | (spread(y) << 1) | (spread(z) << 2)
}

#[inline]
pub fn decode(code: u32) -> (u8, u8, u8) {
    (compact(code), compact(code >> 1), compact(code >> 2))
}
