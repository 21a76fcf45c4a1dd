use hashbrown::HashMap;
use svobake_io::{MeshRecord, Triangle, TriangleLayout};
use svobake_world::Placement;

/// Resident arrays of the source stream that triangle indices point into.
pub(crate) struct SourceArrays<'a> {
    pub vertices: &'a [[f32; 3]],
    pub colors: &'a [[f32; 3]],
    pub normals: &'a [[f32; 3]],
}

/// Triangles assigned to one chunk since its last flush, re-indexed into
/// compact local arrays.
pub(crate) struct ChunkBuffer {
    mesh: MeshRecord,
    vertex_map: HashMap<u32, u32>,
    color_map: HashMap<u32, u32>,
    normal_map: HashMap<u32, u32>,
}

fn remap(
    map: &mut HashMap<u32, u32>,
    out: &mut Vec<[f32; 3]>,
    src: &[[f32; 3]],
    index: u32,
    transform: impl Fn([f32; 3]) -> [f32; 3],
) -> u32 {
    *map.entry(index).or_insert_with(|| {
        out.push(transform(src[index as usize]));
        (out.len() - 1) as u32
    })
}

impl ChunkBuffer {
    pub fn new(layout: TriangleLayout) -> Self {
        Self {
            mesh: MeshRecord::new(layout),
            vertex_map: HashMap::new(),
            color_map: HashMap::new(),
            normal_map: HashMap::new(),
        }
    }

    /// Appends `t`, moving its vertices into world space.
    pub fn push(&mut self, t: &Triangle, src: &SourceArrays<'_>, placement: &Placement) {
        let offset = placement.offset;
        let to_world = |v: [f32; 3]| [v[0] + offset[0], v[1] + offset[1], v[2] + offset[2]];
        let mesh = &mut self.mesh;
        let vertices = t
            .vertices
            .map(|i| remap(&mut self.vertex_map, &mut mesh.vertices, src.vertices, i, to_world));
        let colors = t
            .colors
            .map(|c| c.map(|i| remap(&mut self.color_map, &mut mesh.colors, src.colors, i, |v| v)));
        let normal = t
            .normal
            .map(|i| remap(&mut self.normal_map, &mut mesh.normals, src.normals, i, |v| v));
        mesh.triangles.push(Triangle {
            vertices,
            colors,
            normal,
        });
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.mesh.triangles.len()
    }

    /// Encoded size of the buffer if flushed now.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.mesh.byte_size()
    }

    pub fn into_mesh(self) -> MeshRecord {
        let mut mesh = self.mesh;
        mesh.fit_bounds();
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_vertices_are_stored_once() {
        let vertices = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        let src = SourceArrays {
            vertices: &vertices,
            colors: &[],
            normals: &[],
        };
        let placement = Placement::at(10.0, 0.0, 0.0);
        let mut buf = ChunkBuffer::new(TriangleLayout::Plain);
        for v in [[0, 1, 2], [1, 3, 2]] {
            buf.push(
                &Triangle {
                    vertices: v,
                    ..Default::default()
                },
                &src,
                &placement,
            );
        }
        assert_eq!(buf.triangle_count(), 2);
        let mesh = buf.into_mesh();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.vertices[0], [10.0, 0.0, 0.0]);
        assert_eq!(mesh.triangles.get(1).unwrap().vertices, [1, 3, 2]);
        assert!(mesh.validate().is_ok());
    }
}
