//! PLY import: converts `ascii`, `binary_little_endian` and
//! `binary_big_endian` polygon files into a [`MeshRecord`].
//!
//! Only the `vertex` (position, optional normal and color) and `face`
//! elements are used; any other element is parsed and skipped.

use std::path::Path;

use svobake_geom::Vec3;

use crate::tri::{FormatError, MeshRecord, Triangle, TriangleLayout};

#[derive(Debug, thiserror::Error)]
pub enum PlyError {
    #[error("ply io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ply header: {0}")]
    Header(String),
    #[error("unsupported ply property type '{0}'")]
    UnsupportedType(String),
    #[error("ply data ended early")]
    Truncated,
    #[error("bad ply value '{0}'")]
    BadValue(String),
    #[error("ply vertex element lacks property '{0}'")]
    MissingProperty(&'static str),
    #[error("ply file has no faces")]
    NoFaces,
    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Ascii,
    BinaryLe,
    BinaryBe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Result<Self, PlyError> {
        Ok(match name {
            "int8" | "char" => Scalar::I8,
            "uint8" | "uchar" => Scalar::U8,
            "int16" | "short" => Scalar::I16,
            "uint16" | "ushort" => Scalar::U16,
            "int32" | "int" => Scalar::I32,
            "uint32" | "uint" => Scalar::U32,
            "float32" | "float" => Scalar::F32,
            "float64" | "double" => Scalar::F64,
            other => return Err(PlyError::UnsupportedType(other.to_string())),
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }
}

#[derive(Clone, Debug)]
enum Property {
    Scalar { name: String, ty: Scalar },
    List { name: String, count: Scalar, item: Scalar },
}

impl Property {
    fn name(&self) -> &str {
        match self {
            Property::Scalar { name, .. } | Property::List { name, .. } => name,
        }
    }
}

#[derive(Clone, Debug)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
    body_offset: usize,
}

fn next_line<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    if *pos >= bytes.len() {
        return None;
    }
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos] != b'\n' {
        *pos += 1;
    }
    let line = &bytes[start..*pos];
    *pos += 1;
    std::str::from_utf8(line).ok().map(|s| s.trim_end_matches('\r'))
}

fn parse_header(bytes: &[u8]) -> Result<Header, PlyError> {
    let mut pos = 0usize;
    if next_line(bytes, &mut pos).map(str::trim) != Some("ply") {
        return Err(PlyError::Header("missing 'ply' signature".into()));
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    loop {
        let line = next_line(bytes, &mut pos)
            .ok_or_else(|| PlyError::Header("missing end_header".into()))?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            None | Some("comment") | Some("obj_info") => continue,
            Some("format") => {
                encoding = Some(match tokens.next() {
                    Some("ascii") => Encoding::Ascii,
                    Some("binary_little_endian") => Encoding::BinaryLe,
                    Some("binary_big_endian") => Encoding::BinaryBe,
                    other => {
                        return Err(PlyError::Header(format!("unknown format {other:?}")));
                    }
                });
            }
            Some("element") => {
                let name = tokens
                    .next()
                    .ok_or_else(|| PlyError::Header("element without name".into()))?;
                let count = tokens
                    .next()
                    .and_then(|c| c.parse::<usize>().ok())
                    .ok_or_else(|| PlyError::Header(format!("element {name} without count")))?;
                elements.push(Element {
                    name: name.to_string(),
                    count,
                    properties: Vec::new(),
                });
            }
            Some("property") => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| PlyError::Header("property before element".into()))?;
                let ty = tokens
                    .next()
                    .ok_or_else(|| PlyError::Header("property without type".into()))?;
                let prop = if ty == "list" {
                    let count = Scalar::parse(tokens.next().unwrap_or_default())?;
                    let item = Scalar::parse(tokens.next().unwrap_or_default())?;
                    let name = tokens.next().unwrap_or_default().to_string();
                    Property::List { name, count, item }
                } else {
                    let ty = Scalar::parse(ty)?;
                    let name = tokens.next().unwrap_or_default().to_string();
                    Property::Scalar { name, ty }
                };
                element.properties.push(prop);
            }
            Some("end_header") => break,
            Some(other) => {
                return Err(PlyError::Header(format!("unexpected keyword '{other}'")));
            }
        }
    }

    let encoding = encoding.ok_or_else(|| PlyError::Header("missing format line".into()))?;
    Ok(Header {
        encoding,
        elements,
        body_offset: pos.min(bytes.len()),
    })
}

/// Source of typed values from the PLY body.
trait Values {
    fn next(&mut self, ty: Scalar) -> Result<f64, PlyError>;
}

struct AsciiValues<'a> {
    tokens: std::str::SplitWhitespace<'a>,
}

impl Values for AsciiValues<'_> {
    fn next(&mut self, _ty: Scalar) -> Result<f64, PlyError> {
        let token = self.tokens.next().ok_or(PlyError::Truncated)?;
        token
            .parse::<f64>()
            .map_err(|_| PlyError::BadValue(token.to_string()))
    }
}

struct BinaryValues<'a> {
    bytes: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl Values for BinaryValues<'_> {
    fn next(&mut self, ty: Scalar) -> Result<f64, PlyError> {
        let n = ty.size();
        let raw = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(PlyError::Truncated)?;
        self.pos += n;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(raw);
        if self.big_endian {
            buf[..n].reverse();
        }
        Ok(match ty {
            Scalar::I8 => buf[0] as i8 as f64,
            Scalar::U8 => buf[0] as f64,
            Scalar::I16 => i16::from_le_bytes([buf[0], buf[1]]) as f64,
            Scalar::U16 => u16::from_le_bytes([buf[0], buf[1]]) as f64,
            Scalar::I32 => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            Scalar::U32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            Scalar::F32 => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            Scalar::F64 => f64::from_le_bytes(buf),
        })
    }
}

struct VertexSlots {
    pos: [usize; 3],
    normal: Option<[usize; 3]>,
    color: Option<([usize; 3], f64)>,
}

fn vertex_slots(element: &Element) -> Result<VertexSlots, PlyError> {
    let find = |name: &str| element.properties.iter().position(|p| p.name() == name);
    let need = |name: &'static str| find(name).ok_or(PlyError::MissingProperty(name));
    let pos = [need("x")?, need("y")?, need("z")?];
    let normal = match (find("nx"), find("ny"), find("nz")) {
        (Some(a), Some(b), Some(c)) => Some([a, b, c]),
        _ => None,
    };
    let color = match (find("red"), find("green"), find("blue")) {
        (Some(r), Some(g), Some(b)) => {
            let scale = match &element.properties[r] {
                Property::Scalar { ty: Scalar::F32 | Scalar::F64, .. } => 1.0,
                _ => 255.0,
            };
            Some(([r, g, b], scale))
        }
        _ => None,
    };
    Ok(VertexSlots { pos, normal, color })
}

pub fn read_ply(path: impl AsRef<Path>) -> Result<MeshRecord, PlyError> {
    let bytes = std::fs::read(path.as_ref())?;
    parse_ply(&bytes)
}

pub fn parse_ply(bytes: &[u8]) -> Result<MeshRecord, PlyError> {
    let header = parse_header(bytes)?;
    let body = &bytes[header.body_offset..];
    let mut values: Box<dyn Values + '_> = match header.encoding {
        Encoding::Ascii => {
            let text = std::str::from_utf8(body).map_err(|e| PlyError::BadValue(e.to_string()))?;
            Box::new(AsciiValues {
                tokens: text.split_whitespace(),
            })
        }
        Encoding::BinaryLe | Encoding::BinaryBe => Box::new(BinaryValues {
            bytes: body,
            pos: 0,
            big_endian: header.encoding == Encoding::BinaryBe,
        }),
    };

    let mut positions: Vec<[f32; 3]> = Vec::new();
    let mut vertex_normals: Vec<Vec3> = Vec::new();
    let mut vertex_colors: Vec<[f32; 3]> = Vec::new();
    let mut faces: Vec<[u32; 3]> = Vec::new();
    let mut has_normals = false;
    let mut has_colors = false;

    let mut row: Vec<f64> = Vec::new();
    let mut list: Vec<u32> = Vec::new();
    for element in &header.elements {
        let slots = if element.name == "vertex" {
            Some(vertex_slots(element)?)
        } else {
            None
        };
        if let Some(s) = &slots {
            has_normals = s.normal.is_some();
            has_colors = s.color.is_some();
        }
        for _ in 0..element.count {
            row.clear();
            for prop in &element.properties {
                match prop {
                    Property::Scalar { ty, .. } => row.push(values.next(*ty)?),
                    Property::List { name, count, item } => {
                        let n = values.next(*count)? as usize;
                        list.clear();
                        for _ in 0..n {
                            list.push(values.next(*item)? as u32);
                        }
                        let is_face_list = element.name == "face"
                            && (name == "vertex_indices" || name == "vertex_index");
                        if is_face_list && list.len() >= 3 {
                            for k in 1..list.len() - 1 {
                                faces.push([list[0], list[k], list[k + 1]]);
                            }
                        }
                        row.push(0.0);
                    }
                }
            }
            if let Some(s) = &slots {
                positions.push(s.pos.map(|i| row[i] as f32));
                if let Some(n) = s.normal {
                    vertex_normals.push(Vec3::from_array(n.map(|i| row[i] as f32)));
                }
                if let Some((c, scale)) = s.color {
                    vertex_colors.push(c.map(|i| (row[i] / scale) as f32));
                }
            }
        }
    }

    if faces.is_empty() {
        return Err(PlyError::NoFaces);
    }

    let layout = match (has_colors, has_normals) {
        (false, false) => TriangleLayout::Plain,
        (true, false) => TriangleLayout::Colored,
        (false, true) => TriangleLayout::Normal,
        (true, true) => TriangleLayout::ColoredNormal,
    };
    let mut mesh = MeshRecord::new(layout);
    mesh.vertices = positions;
    if has_colors {
        mesh.colors = vertex_colors;
    }
    for (i, f) in faces.iter().enumerate() {
        let normal = if has_normals {
            let avg = f
                .iter()
                .filter_map(|&v| vertex_normals.get(v as usize).copied())
                .fold(Vec3::ZERO, |a, n| a + n);
            mesh.normals.push(avg.normalized().to_array());
            Some(i as u32)
        } else {
            None
        };
        mesh.triangles.push(Triangle {
            vertices: *f,
            colors: has_colors.then_some(*f),
            normal,
        });
    }
    mesh.fit_bounds();
    mesh.validate()?;
    log::info!(
        target: "ply",
        "imported ply: {} vertices, {} triangles ({:?})",
        mesh.vertices.len(),
        mesh.triangles.len(),
        layout
    );
    Ok(mesh)
}
