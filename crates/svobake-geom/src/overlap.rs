//! Exact triangle / axis-aligned box overlap via the separating axis theorem
//! (box face normals, triangle normal, and the nine edge cross products).

use crate::Vec3;

const AXES: [Vec3; 3] = [
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
];

/// Returns true if the triangle touches or crosses the box given by `center`
/// and `half` extents. Contact on a face counts as overlap.
pub fn tri_box_overlap(center: Vec3, half: Vec3, tri: &[Vec3; 3]) -> bool {
    let v0 = tri[0] - center;
    let v1 = tri[1] - center;
    let v2 = tri[2] - center;

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    for edge in [e0, e1, e2] {
        for axis in AXES {
            if separated_on(axis.cross(edge), v0, v1, v2, half) {
                return false;
            }
        }
    }

    // Box face normals reduce to an AABB test against the triangle bounds.
    let lo = v0.min(v1).min(v2);
    let hi = v0.max(v1).max(v2);
    if lo.x > half.x || hi.x < -half.x {
        return false;
    }
    if lo.y > half.y || hi.y < -half.y {
        return false;
    }
    if lo.z > half.z || hi.z < -half.z {
        return false;
    }

    plane_box_overlap(e0.cross(e1), v0, half)
}

#[inline]
fn separated_on(axis: Vec3, v0: Vec3, v1: Vec3, v2: Vec3, half: Vec3) -> bool {
    let p0 = axis.dot(v0);
    let p1 = axis.dot(v1);
    let p2 = axis.dot(v2);
    let r = half.x * axis.x.abs() + half.y * axis.y.abs() + half.z * axis.z.abs();
    p0.min(p1).min(p2) > r || p0.max(p1).max(p2) < -r
}

fn plane_box_overlap(normal: Vec3, vert: Vec3, half: Vec3) -> bool {
    let n = normal.to_array();
    let v = vert.to_array();
    let h = half.to_array();
    let mut vmin = [0.0f32; 3];
    let mut vmax = [0.0f32; 3];
    for q in 0..3 {
        if n[q] > 0.0 {
            vmin[q] = -h[q] - v[q];
            vmax[q] = h[q] - v[q];
        } else {
            vmin[q] = h[q] - v[q];
            vmax[q] = -h[q] - v[q];
        }
    }
    if normal.dot(Vec3::from_array(vmin)) > 0.0 {
        return false;
    }
    normal.dot(Vec3::from_array(vmax)) >= 0.0
}
