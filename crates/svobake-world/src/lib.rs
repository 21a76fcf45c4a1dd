//! Fixed World -> Region -> Chunk grid shared by every build stage.
#![forbid(unsafe_code)]

mod chunk_coord;
pub mod grid;
mod placement;

pub use chunk_coord::{ChunkCoord, ChunkKey, ChunkRange, RegionCoord};
pub use grid::World;
pub use placement::Placement;

use svobake_geom::Aabb;

/// Geometry that lies entirely outside the world extent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("mesh bounds {bounds:?} lie outside the world extent")]
pub struct BoundsError {
    pub bounds: Aabb,
}
