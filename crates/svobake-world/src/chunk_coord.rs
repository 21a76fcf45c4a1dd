use std::fmt;

use serde::{Deserialize, Serialize};
use svobake_geom::Vec3;

use crate::grid::{CHUNKS_X, CHUNKS_Y, CHUNKS_Z, REGION_CHUNKS, REGIONS_X, REGIONS_Z};
use crate::World;

/// Global chunk indices across the whole world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: i32,
    pub cy: i32,
    pub cz: i32,
}

impl ChunkCoord {
    #[inline]
    pub const fn new(cx: i32, cy: i32, cz: i32) -> Self {
        Self { cx, cy, cz }
    }

    #[inline]
    pub fn in_world(self) -> bool {
        self.cx >= 0
            && self.cy >= 0
            && self.cz >= 0
            && (self.cx as u32) < CHUNKS_X
            && (self.cy as u32) < CHUNKS_Y
            && (self.cz as u32) < CHUNKS_Z
    }

    #[inline]
    pub fn region(self) -> RegionCoord {
        let n = REGION_CHUNKS as i32;
        RegionCoord::new(self.cx / n, self.cy / n, self.cz / n)
    }

    /// Stable storage key; `None` for coordinates outside the world.
    pub fn key(self) -> Option<ChunkKey> {
        if !self.in_world() {
            return None;
        }
        let n = REGION_CHUNKS;
        let r = self.region();
        let (lx, ly, lz) = (
            self.cx as u32 % n,
            self.cy as u32 % n,
            self.cz as u32 % n,
        );
        Some(ChunkKey {
            region: r.id(),
            chunk: ((ly * n + lz) * n + lx) as u16,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionCoord {
    pub rx: i32,
    pub ry: i32,
    pub rz: i32,
}

impl RegionCoord {
    #[inline]
    pub const fn new(rx: i32, ry: i32, rz: i32) -> Self {
        Self { rx, ry, rz }
    }

    #[inline]
    pub fn id(self) -> u16 {
        ((self.ry as u32 * REGIONS_Z + self.rz as u32) * REGIONS_X + self.rx as u32) as u16
    }
}

/// `(region-id, local-chunk-id)` derived purely from world position, never
/// allocated, so independent runs agree on keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub region: u16,
    pub chunk: u16,
}

impl ChunkKey {
    #[inline]
    pub fn from_world_point(p: Vec3) -> Option<ChunkKey> {
        World::chunk_of_point(p).and_then(ChunkCoord::key)
    }

    pub fn coord(self) -> ChunkCoord {
        let n = REGION_CHUNKS;
        let region = self.region as u32;
        let rx = region % REGIONS_X;
        let rz = (region / REGIONS_X) % REGIONS_Z;
        let ry = region / (REGIONS_X * REGIONS_Z);
        let local = self.chunk as u32;
        let lx = local % n;
        let lz = (local / n) % n;
        let ly = local / (n * n);
        ChunkCoord::new(
            (rx * n + lx) as i32,
            (ry * n + ly) as i32,
            (rz * n + lz) as i32,
        )
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{:05}/c{:05}", self.region, self.chunk)
    }
}

/// Inclusive box of chunk coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub min: ChunkCoord,
    pub max: ChunkCoord,
}

impl ChunkRange {
    #[inline]
    pub fn contains(&self, c: ChunkCoord) -> bool {
        c.cx >= self.min.cx
            && c.cx <= self.max.cx
            && c.cy >= self.min.cy
            && c.cy <= self.max.cy
            && c.cz >= self.min.cz
            && c.cz <= self.max.cz
    }

    pub fn len(&self) -> usize {
        let span = |a: i32, b: i32| (b - a + 1).max(0) as usize;
        span(self.min.cx, self.max.cx) * span(self.min.cy, self.max.cy) * span(self.min.cz, self.max.cz)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        (self.min.cy..=self.max.cy).flat_map(move |cy| {
            (self.min.cz..=self.max.cz).flat_map(move |cz| {
                (self.min.cx..=self.max.cx).map(move |cx| ChunkCoord::new(cx, cy, cz))
            })
        })
    }
}
