use svobake_geom::{Aabb, Vec3};

use crate::{BoundsError, ChunkCoord, ChunkRange};

pub const REGIONS_X: u32 = 64;
pub const REGIONS_Y: u32 = 8;
pub const REGIONS_Z: u32 = 64;

/// Chunks along each axis of a region.
pub const REGION_CHUNKS: u32 = 32;
/// Voxels along each axis of a chunk.
pub const CHUNK_VOXELS: u32 = 256;

pub const CHUNK_SIZE_M: f32 = 16.0;
pub const REGION_SIZE_M: f32 = CHUNK_SIZE_M * REGION_CHUNKS as f32;
pub const VOXEL_SIZE_M: f32 = CHUNK_SIZE_M / CHUNK_VOXELS as f32;

pub const CHUNKS_X: u32 = REGIONS_X * REGION_CHUNKS;
pub const CHUNKS_Y: u32 = REGIONS_Y * REGION_CHUNKS;
pub const CHUNKS_Z: u32 = REGIONS_Z * REGION_CHUNKS;

pub const WORLD_SIZE_X_M: f32 = REGION_SIZE_M * REGIONS_X as f32;
pub const WORLD_SIZE_Y_M: f32 = REGION_SIZE_M * REGIONS_Y as f32;
pub const WORLD_SIZE_Z_M: f32 = REGION_SIZE_M * REGIONS_Z as f32;

/// The world: 32 km x 4 km (vertical) x 32 km anchored at the origin, y up.
///
/// Geometry is fixed, so `World` carries no state; it exists to give the grid
/// arithmetic one home.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct World;

impl World {
    #[inline]
    pub fn bounds() -> Aabb {
        Aabb::new(
            Vec3::ZERO,
            Vec3::new(WORLD_SIZE_X_M, WORLD_SIZE_Y_M, WORLD_SIZE_Z_M),
        )
    }

    /// Chunk whose half-open cell contains `p`, or `None` outside the world.
    pub fn chunk_of_point(p: Vec3) -> Option<ChunkCoord> {
        if !Self::bounds().contains_point(p) {
            return None;
        }
        // Chunk size is a power of two, so the division is exact.
        Some(ChunkCoord::new(
            (p.x / CHUNK_SIZE_M).floor() as i32,
            (p.y / CHUNK_SIZE_M).floor() as i32,
            (p.z / CHUNK_SIZE_M).floor() as i32,
        ))
    }

    #[inline]
    pub fn chunk_bounds(coord: ChunkCoord) -> Aabb {
        let min = Vec3::new(
            coord.cx as f32 * CHUNK_SIZE_M,
            coord.cy as f32 * CHUNK_SIZE_M,
            coord.cz as f32 * CHUNK_SIZE_M,
        );
        Aabb::new(min, min + Vec3::splat(CHUNK_SIZE_M))
    }

    /// Inclusive range of chunks touched by `bounds`, clipped to the world.
    pub fn chunks_overlapping(bounds: &Aabb) -> Result<ChunkRange, BoundsError> {
        let clipped = bounds
            .intersection(&Self::bounds())
            .ok_or(BoundsError { bounds: *bounds })?;
        let lo = |v: f32, n: u32| ((v / CHUNK_SIZE_M).floor() as i32).clamp(0, n as i32 - 1);
        Ok(ChunkRange {
            min: ChunkCoord::new(
                lo(clipped.min.x, CHUNKS_X),
                lo(clipped.min.y, CHUNKS_Y),
                lo(clipped.min.z, CHUNKS_Z),
            ),
            max: ChunkCoord::new(
                lo(clipped.max.x, CHUNKS_X),
                lo(clipped.max.y, CHUNKS_Y),
                lo(clipped.max.z, CHUNKS_Z),
            ),
        })
    }
}
