//! Octahedral normal packing: a unit vector folded onto the octahedron and
//! stored as two 8-bit coordinates.
use svobake_geom::Vec3;

#[inline]
fn sign(v: f32) -> f32 {
    if v < 0.0 { -1.0 } else { 1.0 }
}

#[inline]
fn to_unorm8(v: f32) -> u16 {
    ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0).round() as u16
}

#[inline]
fn from_unorm8(v: u16) -> f32 {
    (v as f32 / 255.0) * 2.0 - 1.0
}

/// `None` for zero-length or non-finite input.
pub fn encode_normal(n: Vec3) -> Option<u16> {
    let l1 = n.x.abs() + n.y.abs() + n.z.abs();
    if !n.is_finite() || l1 <= f32::EPSILON {
        return None;
    }
    let (mut u, mut v) = (n.x / l1, n.y / l1);
    if n.z < 0.0 {
        let (fu, fv) = ((1.0 - v.abs()) * sign(u), (1.0 - u.abs()) * sign(v));
        u = fu;
        v = fv;
    }
    Some((to_unorm8(u) << 8) | to_unorm8(v))
}

pub fn decode_normal(packed: u16) -> Vec3 {
    let x = from_unorm8(packed >> 8);
    let y = from_unorm8(packed & 0xFF);
    let z = 1.0 - x.abs() - y.abs();
    let (x, y) = if z < 0.0 {
        ((1.0 - y.abs()) * sign(x), (1.0 - x.abs()) * sign(y))
    } else {
        (x, y)
    };
    Vec3::new(x, y, z).normalized()
}
