//! `.tri`: a little-endian triangle stream suited to direct loading.
//!
//! ```text
//! header  [4]  ".tri"
//!         [4]  version 0x0001_0000
//!         [4]  features: vertices 0x1, normals 0x2, colors 0x4, triangles 0x1_0000
//!         [24] bounds { f32 min[3]; f32 max[3] }
//!         [4]  vertex count
//!         [4]  triangle count
//!         [4]  normal count (0 if absent)
//!         [4]  color count  (0 if absent)
//! body    vertices  { f32 p[3] }
//!         triangles { u32 v[3] } | { u32 v[3], c[3] } | { u32 v[3], n } | { u32 v[3], c[3], n }
//!         colors    { f32 rgb[3] }
//!         normals   { f32 n[3] }
//! ```

use svobake_geom::{Aabb, Vec3};

pub const TRI_MAGIC: [u8; 4] = *b".tri";
pub const TRI_VERSION: u32 = 0x0001_0000;
pub const HEADER_LEN: usize = 52;

pub mod features {
    pub const VERTICES: u32 = 0x0000_0001;
    pub const NORMALS: u32 = 0x0000_0002;
    pub const COLORS: u32 = 0x0000_0004;
    pub const TRIANGLES: u32 = 0x0001_0000;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("bad mesh stream magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported mesh stream version {0:#010x}")]
    BadVersion(u32),
    #[error("invalid feature combination {0:#010x}")]
    InvalidFeatures(u32),
    #[error("{array} count {count} disagrees with the feature bits")]
    CountMismatch { array: &'static str, count: u32 },
    #[error("header bounding box has min > max")]
    InvalidBounds,
    #[error("truncated mesh stream: need {needed} bytes, have {available}")]
    Truncated { needed: u64, available: u64 },
    #[error("{0} trailing bytes after mesh data")]
    TrailingBytes(u64),
    #[error("triangle {triangle} references {array} {index}, only {len} present")]
    IndexOutOfRange {
        triangle: u64,
        array: &'static str,
        index: u32,
        len: u32,
    },
}

/// The four triangle record shapes, selected by the colors/normals feature
/// bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriangleLayout {
    Plain,
    Colored,
    Normal,
    ColoredNormal,
}

impl TriangleLayout {
    pub const ALL: [TriangleLayout; 4] = [
        TriangleLayout::Plain,
        TriangleLayout::Colored,
        TriangleLayout::Normal,
        TriangleLayout::ColoredNormal,
    ];

    pub fn from_features(bits: u32) -> Result<Self, FormatError> {
        use features::*;
        const BASE: u32 = VERTICES | TRIANGLES;
        match bits {
            b if b == BASE => Ok(TriangleLayout::Plain),
            b if b == BASE | COLORS => Ok(TriangleLayout::Colored),
            b if b == BASE | NORMALS => Ok(TriangleLayout::Normal),
            b if b == BASE | COLORS | NORMALS => Ok(TriangleLayout::ColoredNormal),
            other => Err(FormatError::InvalidFeatures(other)),
        }
    }

    pub fn features(self) -> u32 {
        use features::*;
        let base = VERTICES | TRIANGLES;
        match self {
            TriangleLayout::Plain => base,
            TriangleLayout::Colored => base | COLORS,
            TriangleLayout::Normal => base | NORMALS,
            TriangleLayout::ColoredNormal => base | COLORS | NORMALS,
        }
    }

    #[inline]
    pub fn has_colors(self) -> bool {
        matches!(self, TriangleLayout::Colored | TriangleLayout::ColoredNormal)
    }

    #[inline]
    pub fn has_normals(self) -> bool {
        matches!(self, TriangleLayout::Normal | TriangleLayout::ColoredNormal)
    }

    /// Bytes per triangle record.
    #[inline]
    pub fn record_size(self) -> usize {
        let mut words = 3;
        if self.has_colors() {
            words += 3;
        }
        if self.has_normals() {
            words += 1;
        }
        words * 4
    }
}

/// One triangle with whichever attribute indices its layout carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Triangle {
    pub vertices: [u32; 3],
    pub colors: Option<[u32; 3]>,
    pub normal: Option<u32>,
}

impl Triangle {
    pub fn write_record(&self, layout: TriangleLayout, out: &mut Vec<u8>) {
        for v in self.vertices {
            out.extend_from_slice(&v.to_le_bytes());
        }
        if layout.has_colors() {
            for c in self.colors.unwrap_or_default() {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        if layout.has_normals() {
            out.extend_from_slice(&self.normal.unwrap_or_default().to_le_bytes());
        }
    }

    /// Decodes one record; `bytes` must be exactly `layout.record_size()` long.
    pub fn read_record(layout: TriangleLayout, bytes: &[u8]) -> Triangle {
        let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);
        let vertices = [word(0), word(1), word(2)];
        let colors = layout.has_colors().then(|| [word(3), word(4), word(5)]);
        let normal = layout
            .has_normals()
            .then(|| if layout.has_colors() { word(6) } else { word(3) });
        Triangle {
            vertices,
            colors,
            normal,
        }
    }

    pub(crate) fn check_indices(
        &self,
        triangle: u64,
        vertex_count: u32,
        color_count: u32,
        normal_count: u32,
    ) -> Result<(), FormatError> {
        let check = |array: &'static str, index: u32, len: u32| {
            if index < len {
                Ok(())
            } else {
                Err(FormatError::IndexOutOfRange {
                    triangle,
                    array,
                    index,
                    len,
                })
            }
        };
        for v in self.vertices {
            check("vertex", v, vertex_count)?;
        }
        if let Some(cs) = self.colors {
            for c in cs {
                check("color", c, color_count)?;
            }
        }
        if let Some(n) = self.normal {
            check("normal", n, normal_count)?;
        }
        Ok(())
    }
}

/// Triangle array stored in the shape the feature bits select.
#[derive(Clone, Debug, PartialEq)]
pub enum TriangleRecords {
    Plain(Vec<[u32; 3]>),
    Colored(Vec<([u32; 3], [u32; 3])>),
    Normal(Vec<([u32; 3], u32)>),
    ColoredNormal(Vec<([u32; 3], [u32; 3], u32)>),
}

impl TriangleRecords {
    pub fn new(layout: TriangleLayout) -> Self {
        match layout {
            TriangleLayout::Plain => TriangleRecords::Plain(Vec::new()),
            TriangleLayout::Colored => TriangleRecords::Colored(Vec::new()),
            TriangleLayout::Normal => TriangleRecords::Normal(Vec::new()),
            TriangleLayout::ColoredNormal => TriangleRecords::ColoredNormal(Vec::new()),
        }
    }

    pub fn layout(&self) -> TriangleLayout {
        match self {
            TriangleRecords::Plain(_) => TriangleLayout::Plain,
            TriangleRecords::Colored(_) => TriangleLayout::Colored,
            TriangleRecords::Normal(_) => TriangleLayout::Normal,
            TriangleRecords::ColoredNormal(_) => TriangleLayout::ColoredNormal,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TriangleRecords::Plain(v) => v.len(),
            TriangleRecords::Colored(v) => v.len(),
            TriangleRecords::Normal(v) => v.len(),
            TriangleRecords::ColoredNormal(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `t`; attributes the layout does not carry are dropped and
    /// missing ones default to index 0.
    pub fn push(&mut self, t: Triangle) {
        match self {
            TriangleRecords::Plain(v) => v.push(t.vertices),
            TriangleRecords::Colored(v) => v.push((t.vertices, t.colors.unwrap_or_default())),
            TriangleRecords::Normal(v) => v.push((t.vertices, t.normal.unwrap_or_default())),
            TriangleRecords::ColoredNormal(v) => v.push((
                t.vertices,
                t.colors.unwrap_or_default(),
                t.normal.unwrap_or_default(),
            )),
        }
    }

    pub fn get(&self, i: usize) -> Option<Triangle> {
        let t = match self {
            TriangleRecords::Plain(v) => Triangle {
                vertices: *v.get(i)?,
                ..Triangle::default()
            },
            TriangleRecords::Colored(v) => {
                let (vs, cs) = *v.get(i)?;
                Triangle {
                    vertices: vs,
                    colors: Some(cs),
                    normal: None,
                }
            }
            TriangleRecords::Normal(v) => {
                let (vs, n) = *v.get(i)?;
                Triangle {
                    vertices: vs,
                    colors: None,
                    normal: Some(n),
                }
            }
            TriangleRecords::ColoredNormal(v) => {
                let (vs, cs, n) = *v.get(i)?;
                Triangle {
                    vertices: vs,
                    colors: Some(cs),
                    normal: Some(n),
                }
            }
        };
        Some(t)
    }

    pub fn iter(&self) -> impl Iterator<Item = Triangle> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// Parsed fixed-size header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriHeader {
    pub layout: TriangleLayout,
    pub bounds: Aabb,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub normal_count: u32,
    pub color_count: u32,
}

impl TriHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_LEN {
            return Err(FormatError::Truncated {
                needed: HEADER_LEN as u64,
                available: bytes.len() as u64,
            });
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != TRI_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = word(4);
        if version != TRI_VERSION {
            return Err(FormatError::BadVersion(version));
        }
        let layout = TriangleLayout::from_features(word(8))?;
        let f = |i: usize| f32::from_bits(word(12 + i * 4));
        let bounds = Aabb::new(Vec3::new(f(0), f(1), f(2)), Vec3::new(f(3), f(4), f(5)));
        if !bounds.is_valid() {
            return Err(FormatError::InvalidBounds);
        }
        let header = TriHeader {
            layout,
            bounds,
            vertex_count: word(36),
            triangle_count: word(40),
            normal_count: word(44),
            color_count: word(48),
        };
        header.check_counts()?;
        Ok(header)
    }

    fn check_counts(&self) -> Result<(), FormatError> {
        let expect = |array: &'static str, present: bool, count: u32| {
            if present == (count > 0) {
                Ok(())
            } else {
                Err(FormatError::CountMismatch { array, count })
            }
        };
        expect("vertex", true, self.vertex_count)?;
        expect("triangle", true, self.triangle_count)?;
        expect("color", self.layout.has_colors(), self.color_count)?;
        expect("normal", self.layout.has_normals(), self.normal_count)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&TRI_MAGIC);
        out.extend_from_slice(&TRI_VERSION.to_le_bytes());
        out.extend_from_slice(&self.layout.features().to_le_bytes());
        for v in self.bounds.min.to_array().into_iter().chain(self.bounds.max.to_array()) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for count in [
            self.vertex_count,
            self.triangle_count,
            self.normal_count,
            self.color_count,
        ] {
            out.extend_from_slice(&count.to_le_bytes());
        }
    }

    /// Byte offset of the triangle array.
    #[inline]
    pub fn triangles_offset(&self) -> u64 {
        HEADER_LEN as u64 + self.vertex_count as u64 * 12
    }

    /// Byte offset of the color array (normals follow it).
    #[inline]
    pub fn colors_offset(&self) -> u64 {
        self.triangles_offset() + self.triangle_count as u64 * self.layout.record_size() as u64
    }

    #[inline]
    pub fn normals_offset(&self) -> u64 {
        self.colors_offset() + self.color_count as u64 * 12
    }

    /// Total encoded size.
    #[inline]
    pub fn stream_len(&self) -> u64 {
        self.normals_offset() + self.normal_count as u64 * 12
    }
}

/// A decoded mesh stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshRecord {
    pub bounds: Aabb,
    pub vertices: Vec<[f32; 3]>,
    pub triangles: TriangleRecords,
    pub colors: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
}

impl MeshRecord {
    pub fn new(layout: TriangleLayout) -> Self {
        MeshRecord {
            bounds: Aabb::default(),
            vertices: Vec::new(),
            triangles: TriangleRecords::new(layout),
            colors: Vec::new(),
            normals: Vec::new(),
        }
    }

    #[inline]
    pub fn layout(&self) -> TriangleLayout {
        self.triangles.layout()
    }

    pub fn header(&self) -> TriHeader {
        TriHeader {
            layout: self.layout(),
            bounds: self.bounds,
            vertex_count: self.vertices.len() as u32,
            triangle_count: self.triangles.len() as u32,
            normal_count: self.normals.len() as u32,
            color_count: self.colors.len() as u32,
        }
    }

    /// Recomputes `bounds` from the vertex array.
    pub fn fit_bounds(&mut self) {
        if let Some(b) = Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(*v))) {
            self.bounds = b;
        }
    }

    #[inline]
    pub fn vertex(&self, i: u32) -> Vec3 {
        Vec3::from_array(self.vertices[i as usize])
    }

    /// Checks the record would decode: counts agree with the layout and every
    /// index is in range.
    pub fn validate(&self) -> Result<(), FormatError> {
        let header = self.header();
        if !header.bounds.is_valid() {
            return Err(FormatError::InvalidBounds);
        }
        header.check_counts()?;
        for (i, t) in self.triangles.iter().enumerate() {
            t.check_indices(
                i as u64,
                header.vertex_count,
                header.color_count,
                header.normal_count,
            )?;
        }
        Ok(())
    }

    /// Approximate resident size in bytes.
    pub fn byte_size(&self) -> usize {
        self.header().stream_len() as usize
    }
}

pub fn encode(mesh: &MeshRecord) -> Vec<u8> {
    let header = mesh.header();
    let layout = header.layout;
    let mut out = Vec::with_capacity(header.stream_len() as usize);
    header.write(&mut out);
    write_vec3s(&mesh.vertices, &mut out);
    for t in mesh.triangles.iter() {
        t.write_record(layout, &mut out);
    }
    write_vec3s(&mesh.colors, &mut out);
    write_vec3s(&mesh.normals, &mut out);
    out
}

pub fn decode(bytes: &[u8]) -> Result<MeshRecord, FormatError> {
    let header = TriHeader::parse(bytes)?;
    let total = header.stream_len();
    let available = bytes.len() as u64;
    if available < total {
        return Err(FormatError::Truncated {
            needed: total,
            available,
        });
    }
    if available > total {
        return Err(FormatError::TrailingBytes(available - total));
    }

    let layout = header.layout;
    let vertices = read_vec3s(bytes, HEADER_LEN, header.vertex_count);
    let mut triangles = TriangleRecords::new(layout);
    let record = layout.record_size();
    let tri_start = header.triangles_offset() as usize;
    for i in 0..header.triangle_count as usize {
        let at = tri_start + i * record;
        let t = Triangle::read_record(layout, &bytes[at..at + record]);
        t.check_indices(
            i as u64,
            header.vertex_count,
            header.color_count,
            header.normal_count,
        )?;
        triangles.push(t);
    }
    let colors = read_vec3s(bytes, header.colors_offset() as usize, header.color_count);
    let normals = read_vec3s(bytes, header.normals_offset() as usize, header.normal_count);

    Ok(MeshRecord {
        bounds: header.bounds,
        vertices,
        triangles,
        colors,
        normals,
    })
}

pub(crate) fn write_vec3s(values: &[[f32; 3]], out: &mut Vec<u8>) {
    for v in values {
        for c in v {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
}

pub(crate) fn read_vec3s(bytes: &[u8], offset: usize, count: u32) -> Vec<[f32; 3]> {
    bytes[offset..offset + count as usize * 12]
        .chunks_exact(12)
        .map(|c| {
            let f = |i: usize| f32::from_le_bytes([c[i], c[i + 1], c[i + 2], c[i + 3]]);
            [f(0), f(4), f(8)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(layout: TriangleLayout) -> MeshRecord {
        let mut m = MeshRecord::new(layout);
        m.vertices = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        if layout.has_colors() {
            m.colors = vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        }
        if layout.has_normals() {
            m.normals = vec![[0.0, 1.0, 0.0]];
        }
        let colors = layout.has_colors().then_some([0, 1, 1]);
        let normal = layout.has_normals().then_some(0);
        m.triangles.push(Triangle {
            vertices: [0, 1, 2],
            colors,
            normal,
        });
        m.triangles.push(Triangle {
            vertices: [0, 2, 3],
            colors,
            normal,
        });
        m.fit_bounds();
        m
    }

    #[test]
    fn header_is_52_bytes_and_layout_sizes() {
        let bytes = encode(&quad(TriangleLayout::Plain));
        assert_eq!(&bytes[0..4], b".tri");
        assert_eq!(bytes.len(), HEADER_LEN + 4 * 12 + 2 * 12);
        assert_eq!(TriangleLayout::Plain.record_size(), 12);
        assert_eq!(TriangleLayout::Colored.record_size(), 24);
        assert_eq!(TriangleLayout::Normal.record_size(), 16);
        assert_eq!(TriangleLayout::ColoredNormal.record_size(), 28);
    }

    #[test]
    fn every_layout_roundtrips() {
        for layout in TriangleLayout::ALL {
            let m = quad(layout);
            m.validate().unwrap();
            let bytes = encode(&m);
            let back = decode(&bytes).unwrap();
            assert_eq!(back, m);
            assert_eq!(encode(&back), bytes);
        }
    }

    #[test]
    fn rejects_altered_magic_and_version() {
        let bytes = encode(&quad(TriangleLayout::Colored));
        let mut bad = bytes.clone();
        bad[0] = b'x';
        assert!(matches!(decode(&bad), Err(FormatError::BadMagic(_))));
        let mut bad = bytes.clone();
        bad[4..8].copy_from_slice(&0x0002_0000u32.to_le_bytes());
        assert!(matches!(decode(&bad), Err(FormatError::BadVersion(0x0002_0000))));
    }

    #[test]
    fn rejects_invalid_feature_bits() {
        let mut bytes = encode(&quad(TriangleLayout::Plain));
        // colors without triangles
        bytes[8..12].copy_from_slice(&(features::VERTICES | features::COLORS).to_le_bytes());
        assert!(matches!(decode(&bytes), Err(FormatError::InvalidFeatures(_))));
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        let bytes = encode(&quad(TriangleLayout::Normal));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(FormatError::Truncated { .. })
        ));
        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(decode(&long), Err(FormatError::TrailingBytes(1))));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut m = quad(TriangleLayout::Plain);
        m.triangles.push(Triangle {
            vertices: [0, 1, 9],
            ..Triangle::default()
        });
        assert!(m.validate().is_err());
        let err = decode(&encode(&m)).unwrap_err();
        assert!(matches!(
            err,
            FormatError::IndexOutOfRange { triangle: 2, index: 9, .. }
        ));
    }

    #[test]
    fn rejects_color_count_without_color_feature() {
        let mut m = quad(TriangleLayout::Plain);
        m.colors.push([1.0, 1.0, 1.0]);
        assert!(matches!(
            decode(&encode(&m)),
            Err(FormatError::CountMismatch { array: "color", .. })
        ));
    }
}
