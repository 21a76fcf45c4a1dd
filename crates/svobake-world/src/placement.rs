use serde::{Deserialize, Serialize};
use svobake_geom::{Aabb, Vec3};

/// World placement of a source mesh: mesh-local positions are offset into
/// world space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub offset: [f32; 3],
}

impl Placement {
    #[inline]
    pub const fn at(x: f32, y: f32, z: f32) -> Self {
        Self { offset: [x, y, z] }
    }

    #[inline]
    pub fn offset(&self) -> Vec3 {
        Vec3::from_array(self.offset)
    }

    #[inline]
    pub fn apply(&self, p: Vec3) -> Vec3 {
        p + self.offset()
    }

    #[inline]
    pub fn apply_bounds(&self, b: &Aabb) -> Aabb {
        b.translated(self.offset())
    }
}
