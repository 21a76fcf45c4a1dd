//! Conservative triangle voxelization into a sparse per-chunk grid.
#![forbid(unsafe_code)]

pub mod morton;
mod normal;

use hashbrown::HashMap;
use svobake_geom::{Vec3, tri_box_overlap};
use svobake_io::{MeshRecord, TriError, read_mesh_file};
use svobake_partition::TriPartition;
use svobake_world::grid::{CHUNK_VOXELS, VOXEL_SIZE_M};
use svobake_world::{ChunkKey, World};

pub use normal::{decode_normal, encode_normal};

/// Per-voxel attributes. Either field may be absent when the source mesh
/// carried no such data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VoxelAttr {
    pub color: Option<[u8; 3]>,
    pub normal: Option<u16>,
}

impl VoxelAttr {
    /// Fields present in `incoming` replace the stored ones; absent fields
    /// leave them untouched.
    #[inline]
    pub fn overlay(&mut self, incoming: &VoxelAttr) {
        if incoming.color.is_some() {
            self.color = incoming.color;
        }
        if incoming.normal.is_some() {
            self.normal = incoming.normal;
        }
    }
}

/// Chunk-local voxel coordinate, each axis in `0..256`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl VoxelPos {
    #[inline]
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn morton(self) -> u32 {
        morton::encode(self.x, self.y, self.z)
    }

    #[inline]
    pub fn from_morton(code: u32) -> Self {
        let (x, y, z) = morton::decode(code);
        Self { x, y, z }
    }
}

/// Occupied voxels of one chunk, sorted by Morton code, one entry per
/// position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoxelGrid {
    key: ChunkKey,
    voxels: Vec<(VoxelPos, VoxelAttr)>,
}

impl VoxelGrid {
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            voxels: Vec::new(),
        }
    }

    /// Builds a grid from voxels in any order; a later duplicate position
    /// replaces an earlier one.
    pub fn from_voxels<I>(key: ChunkKey, voxels: I) -> Self
    where
        I: IntoIterator<Item = (VoxelPos, VoxelAttr)>,
    {
        let mut by_code: HashMap<u32, (VoxelPos, VoxelAttr)> = HashMap::new();
        for (pos, attr) in voxels {
            by_code.insert(pos.morton(), (pos, attr));
        }
        Self::from_map(key, by_code)
    }

    fn from_map(key: ChunkKey, map: HashMap<u32, (VoxelPos, VoxelAttr)>) -> Self {
        let mut voxels: Vec<_> = map.into_iter().collect();
        voxels.sort_unstable_by_key(|(code, _)| *code);
        Self {
            key,
            voxels: voxels.into_iter().map(|(_, v)| v).collect(),
        }
    }

    #[inline]
    pub fn key(&self) -> ChunkKey {
        self.key
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    #[inline]
    pub fn voxels(&self) -> &[(VoxelPos, VoxelAttr)] {
        &self.voxels
    }

    pub fn iter(&self) -> impl Iterator<Item = (VoxelPos, VoxelAttr)> + '_ {
        self.voxels.iter().copied()
    }

    pub fn get(&self, pos: VoxelPos) -> Option<&VoxelAttr> {
        let code = pos.morton();
        self.voxels
            .binary_search_by_key(&code, |(p, _)| p.morton())
            .ok()
            .map(|i| &self.voxels[i].1)
    }

    /// Approximate resident size in bytes.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.voxels.capacity() * std::mem::size_of::<(VoxelPos, VoxelAttr)>()
    }
}

#[inline]
fn quantize(c: [f32; 3]) -> [u8; 3] {
    c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}

#[inline]
fn nearest_vertex(p: Vec3, tri: &[Vec3; 3]) -> usize {
    let d = tri.map(|v| (v - p).length_sq());
    let mut best = 0;
    for k in 1..3 {
        if d[k] < d[best] {
            best = k;
        }
    }
    best
}

/// Voxelizes every triangle of `mesh` (world-space vertices) that touches
/// chunk `key`.
///
/// A voxel is occupied when its closed cube overlaps the triangle. It takes
/// the color of the triangle vertex nearest its center and the triangle's
/// normal; where triangles share a voxel the later one wins.
pub fn voxelize(key: ChunkKey, mesh: &MeshRecord) -> VoxelGrid {
    let origin = World::chunk_bounds(key.coord()).min;
    let scale = 1.0 / VOXEL_SIZE_M;
    let last = CHUNK_VOXELS as i32 - 1;
    let half = Vec3::splat(0.5);
    let mut hits: HashMap<u32, (VoxelPos, VoxelAttr)> = HashMap::new();
    let mut skipped = 0usize;

    for t in mesh.triangles.iter() {
        let tri = t.vertices.map(|i| (mesh.vertex(i) - origin) * scale);
        if !tri.iter().all(|v| v.is_finite()) {
            skipped += 1;
            continue;
        }
        let lo = tri[0].min(tri[1]).min(tri[2]).floor();
        let hi = tri[0].max(tri[1]).max(tri[2]).floor();
        if hi.x < 0.0
            || hi.y < 0.0
            || hi.z < 0.0
            || lo.x > last as f32
            || lo.y > last as f32
            || lo.z > last as f32
        {
            continue;
        }
        let span = |a: f32, b: f32| ((a as i32).clamp(0, last), (b as i32).clamp(0, last));
        let (x0, x1) = span(lo.x, hi.x);
        let (y0, y1) = span(lo.y, hi.y);
        let (z0, z1) = span(lo.z, hi.z);

        let colors = t.colors.map(|c| c.map(|i| quantize(mesh.colors[i as usize])));
        let normal = t
            .normal
            .and_then(|i| encode_normal(Vec3::from_array(mesh.normals[i as usize])));

        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let center = Vec3::new(x as f32 + 0.5, y as f32 + 0.5, z as f32 + 0.5);
                    if !tri_box_overlap(center, half, &tri) {
                        continue;
                    }
                    let pos = VoxelPos::new(x as u8, y as u8, z as u8);
                    let attr = VoxelAttr {
                        color: colors.map(|c| c[nearest_vertex(center, &tri)]),
                        normal,
                    };
                    hits.insert(pos.morton(), (pos, attr));
                }
            }
        }
    }

    if skipped > 0 {
        log::warn!(target: "voxel", "{key}: skipped {skipped} triangles with non-finite vertices");
    }
    let grid = VoxelGrid::from_map(key, hits);
    log::debug!(
        target: "voxel",
        "voxelized {key}: {} triangles -> {} voxels",
        mesh.triangles.len(),
        grid.len()
    );
    grid
}

/// Loads a partition file and voxelizes it for its chunk.
pub fn voxelize_partition(part: &TriPartition) -> Result<VoxelGrid, TriError> {
    let mesh = read_mesh_file(&part.path)?;
    Ok(voxelize(part.key, &mesh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use svobake_io::{Triangle, TriangleLayout};
    use svobake_world::ChunkCoord;

    fn key0() -> ChunkKey {
        ChunkCoord::new(0, 0, 0).key().unwrap()
    }

    fn colored(tris: &[([[f32; 3]; 3], [[f32; 3]; 3])]) -> MeshRecord {
        let mut m = MeshRecord::new(TriangleLayout::Colored);
        for (v, c) in tris {
            let base = m.vertices.len() as u32;
            m.vertices.extend_from_slice(v);
            m.colors.extend_from_slice(c);
            m.triangles.push(Triangle {
                vertices: [base, base + 1, base + 2],
                colors: Some([base, base + 1, base + 2]),
                normal: None,
            });
        }
        m.fit_bounds();
        m
    }

    const RED: [f32; 3] = [1.0, 0.0, 0.0];
    const GREEN: [f32; 3] = [0.0, 1.0, 0.0];
    const BLUE: [f32; 3] = [0.0, 0.0, 1.0];

    // Horizontal right triangle in the middle of voxel layer y = 16, corners
    // kept off voxel faces.
    fn flat_triangle() -> [[f32; 3]; 3] {
        let v = |x: f32, z: f32| [x * VOXEL_SIZE_M, 16.5 * VOXEL_SIZE_M, z * VOXEL_SIZE_M];
        [v(16.25, 16.25), v(31.75, 16.25), v(16.25, 31.75)]
    }

    #[test]
    fn flat_triangle_fills_one_layer() {
        let grid = voxelize(key0(), &colored(&[(flat_triangle(), [RED; 3])]));
        assert!(!grid.is_empty());
        assert!(grid.iter().all(|(p, _)| p.y == 16));
        assert!(grid.iter().all(|(p, _)| (16..32).contains(&p.x) && (16..32).contains(&p.z)));
        assert!(grid.get(VoxelPos::new(16, 16, 16)).is_some());
        assert!(grid.get(VoxelPos::new(31, 16, 16)).is_some());
        assert!(grid.get(VoxelPos::new(16, 16, 31)).is_some());
        assert!(grid.get(VoxelPos::new(31, 16, 31)).is_none());
        let attr = grid.get(VoxelPos::new(16, 16, 16)).unwrap();
        assert_eq!(attr.color, Some([255, 0, 0]));
        assert_eq!(attr.normal, None);
    }

    #[test]
    fn output_is_morton_sorted() {
        let grid = voxelize(key0(), &colored(&[(flat_triangle(), [RED; 3])]));
        let codes: Vec<u32> = grid.iter().map(|(p, _)| p.morton()).collect();
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn color_comes_from_nearest_vertex() {
        let grid = voxelize(key0(), &colored(&[(flat_triangle(), [RED, GREEN, BLUE])]));
        assert_eq!(grid.get(VoxelPos::new(16, 16, 16)).unwrap().color, Some([255, 0, 0]));
        assert_eq!(grid.get(VoxelPos::new(31, 16, 16)).unwrap().color, Some([0, 255, 0]));
        assert_eq!(grid.get(VoxelPos::new(16, 16, 31)).unwrap().color, Some([0, 0, 255]));
    }

    #[test]
    fn later_triangle_wins_shared_voxels() {
        let grid = voxelize(
            key0(),
            &colored(&[(flat_triangle(), [RED; 3]), (flat_triangle(), [BLUE; 3])]),
        );
        assert!(grid.iter().all(|(_, a)| a.color == Some([0, 0, 255])));
    }

    #[test]
    fn normals_are_packed() {
        let mut m = MeshRecord::new(TriangleLayout::Normal);
        m.vertices.extend_from_slice(&flat_triangle());
        m.normals.push([0.0, 1.0, 0.0]);
        m.triangles.push(Triangle {
            vertices: [0, 1, 2],
            colors: None,
            normal: Some(0),
        });
        m.fit_bounds();
        let grid = voxelize(key0(), &m);
        let packed = grid.get(VoxelPos::new(16, 16, 16)).unwrap().normal.unwrap();
        assert!((decode_normal(packed) - Vec3::new(0.0, 1.0, 0.0)).length() < 0.02);
    }

    #[test]
    fn geometry_clipped_to_chunk() {
        // Spans x in [15, 17] m; only the part inside chunk 0 is kept.
        let y = 16.5 * VOXEL_SIZE_M;
        let tri = [[15.0, y, 1.0], [17.0, y, 1.0], [15.0, y, 3.0]];
        let grid = voxelize(key0(), &colored(&[(tri, [RED; 3])]));
        assert!(!grid.is_empty());
        assert!(grid.iter().any(|(p, _)| p.x == 255));

        let far = [[100.0, y, 1.0], [101.0, y, 1.0], [100.0, y, 2.0]];
        assert!(voxelize(key0(), &colored(&[(far, [RED; 3])])).is_empty());
    }

    #[test]
    fn overlay_keeps_missing_fields() {
        let mut a = VoxelAttr {
            color: Some([1, 2, 3]),
            normal: Some(7),
        };
        a.overlay(&VoxelAttr {
            color: None,
            normal: Some(9),
        });
        assert_eq!(a.color, Some([1, 2, 3]));
        assert_eq!(a.normal, Some(9));
    }

    #[test]
    fn from_voxels_dedups_last_wins() {
        let p = VoxelPos::new(1, 2, 3);
        let a = VoxelAttr {
            color: Some([1, 1, 1]),
            normal: None,
        };
        let b = VoxelAttr {
            color: Some([2, 2, 2]),
            normal: None,
        };
        let grid = VoxelGrid::from_voxels(key0(), [(p, a), (VoxelPos::new(0, 0, 0), a), (p, b)]);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.get(p), Some(&b));
        assert_eq!(grid.voxels()[0].0, VoxelPos::new(0, 0, 0));
    }
}
