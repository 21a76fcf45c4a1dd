use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::TriError;
use crate::tri::{
    FormatError, HEADER_LEN, MeshRecord, TriHeader, Triangle, decode, encode, read_vec3s,
};

/// Incremental reader over a `.tri` stream.
///
/// Vertex, color and normal arrays are loaded up front; triangle records are
/// pulled in batches so a large mesh never has its triangle array resident.
pub struct TriReader<R> {
    inner: R,
    header: TriHeader,
    vertices: Vec<[f32; 3]>,
    colors: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    next_triangle: u32,
    scratch: Vec<u8>,
}

impl TriReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TriError> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> TriReader<R> {
    pub fn new(mut inner: R) -> Result<Self, TriError> {
        let available = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        if available < HEADER_LEN as u64 {
            return Err(FormatError::Truncated {
                needed: HEADER_LEN as u64,
                available,
            }
            .into());
        }
        let mut head = [0u8; HEADER_LEN];
        inner.read_exact(&mut head)?;
        let header = TriHeader::parse(&head)?;
        let total = header.stream_len();
        if available < total {
            return Err(FormatError::Truncated {
                needed: total,
                available,
            }
            .into());
        }
        if available > total {
            return Err(FormatError::TrailingBytes(available - total).into());
        }

        let vertices = read_array(&mut inner, HEADER_LEN as u64, header.vertex_count)?;
        let colors = read_array(&mut inner, header.colors_offset(), header.color_count)?;
        let normals = read_array(&mut inner, header.normals_offset(), header.normal_count)?;
        inner.seek(SeekFrom::Start(header.triangles_offset()))?;

        log::debug!(
            target: "tri",
            "opened mesh stream: {:?} layout, {} vertices, {} triangles",
            header.layout,
            header.vertex_count,
            header.triangle_count
        );

        Ok(Self {
            inner,
            header,
            vertices,
            colors,
            normals,
            next_triangle: 0,
            scratch: Vec::new(),
        })
    }

    #[inline]
    pub fn header(&self) -> &TriHeader {
        &self.header
    }

    #[inline]
    pub fn vertices(&self) -> &[[f32; 3]] {
        &self.vertices
    }

    #[inline]
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    #[inline]
    pub fn normals(&self) -> &[[f32; 3]] {
        &self.normals
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.header.triangle_count - self.next_triangle
    }

    /// Replaces `out` with up to `max` triangles; returns how many were read
    /// (0 once the stream is exhausted). Indices are validated.
    pub fn next_batch(&mut self, max: usize, out: &mut Vec<Triangle>) -> Result<usize, TriError> {
        out.clear();
        let n = (self.remaining() as usize).min(max);
        if n == 0 {
            return Ok(0);
        }
        let record = self.header.layout.record_size();
        self.scratch.resize(n * record, 0);
        self.inner.read_exact(&mut self.scratch)?;
        let h = &self.header;
        for (i, bytes) in self.scratch.chunks_exact(record).enumerate() {
            let t = Triangle::read_record(h.layout, bytes);
            t.check_indices(
                self.next_triangle as u64 + i as u64,
                h.vertex_count,
                h.color_count,
                h.normal_count,
            )?;
            out.push(t);
        }
        self.next_triangle += n as u32;
        Ok(n)
    }
}

fn read_array<R: Read + Seek>(inner: &mut R, offset: u64, count: u32) -> Result<Vec<[f32; 3]>, TriError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    inner.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; count as usize * 12];
    inner.read_exact(&mut bytes)?;
    Ok(read_vec3s(&bytes, 0, count))
}

pub fn read_mesh_file(path: impl AsRef<Path>) -> Result<MeshRecord, TriError> {
    let bytes = std::fs::read(path.as_ref())?;
    Ok(decode(&bytes)?)
}

pub fn write_mesh_file(path: impl AsRef<Path>, mesh: &MeshRecord) -> Result<(), TriError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&encode(mesh))?;
    writer.flush()?;
    Ok(())
}
