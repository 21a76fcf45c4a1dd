//! World partitioner: splits a source mesh stream into per-chunk `.tri`
//! partitions by triangle centroid.
#![forbid(unsafe_code)]

mod buffer;

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use svobake_geom::Vec3;
use svobake_io::{TriError, TriReader, Triangle, write_mesh_file};
use svobake_world::{BoundsError, ChunkKey, Placement, World};

use crate::buffer::{ChunkBuffer, SourceArrays};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Directory receiving partition files.
    pub scratch_dir: PathBuf,
    /// A chunk buffer is flushed once its encoded size reaches this.
    pub flush_bytes: usize,
    /// Upper bound on bytes held across all chunk buffers.
    pub resident_budget: usize,
    /// Triangles pulled from the source per read.
    pub batch_triangles: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("svobake-scratch"),
            flush_bytes: 16 << 20,
            resident_budget: 256 << 20,
            batch_triangles: 64 * 1024,
        }
    }
}

/// Triangles of one chunk written to a transient `.tri` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriPartition {
    pub key: ChunkKey,
    /// Flush index within `key`. Parts of one chunk hold triangles in
    /// source order, so they must be merged in ascending `seq`.
    pub seq: u32,
    pub path: PathBuf,
    pub triangles: u32,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub triangles_read: u64,
    pub triangles_assigned: u64,
    /// Centroid outside the world (or not finite).
    pub triangles_discarded: u64,
    pub partitions_written: u32,
    pub candidate_chunks: usize,
    pub chunks_touched: usize,
    /// The sink asked to stop before the scan finished.
    pub stopped: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Tri(#[from] TriError),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("partition io: {0}")]
    Io(#[from] std::io::Error),
}

/// Scratch file path for the `seq`-th flush of `key`.
pub fn partition_path(dir: &Path, key: ChunkKey, seq: u32) -> PathBuf {
    dir.join(format!("r{:05}_c{:05}_{seq:04}.tri", key.region, key.chunk))
}

#[inline]
fn centroid(v: [[f32; 3]; 3]) -> Vec3 {
    (Vec3::from_array(v[0]) + Vec3::from_array(v[1]) + Vec3::from_array(v[2])) / 3.0
}

struct Flusher<'a, F> {
    dir: &'a Path,
    seq: HashMap<ChunkKey, u32>,
    sink: F,
    written: u32,
}

impl<F> Flusher<'_, F>
where
    F: FnMut(TriPartition) -> ControlFlow<()>,
{
    fn flush(&mut self, key: ChunkKey, buffer: ChunkBuffer) -> Result<ControlFlow<()>, PartitionError> {
        let triangles = buffer.triangle_count() as u32;
        let mesh = buffer.into_mesh();
        let next = self.seq.entry(key).or_insert(0);
        let seq = *next;
        *next += 1;
        let path = partition_path(self.dir, key, seq);
        write_mesh_file(&path, &mesh)?;
        let bytes = mesh.byte_size() as u64;
        self.written += 1;
        log::debug!(
            target: "partition",
            "flushed {key}: {triangles} triangles, {bytes} bytes -> {}",
            path.display()
        );
        Ok((self.sink)(TriPartition {
            key,
            seq,
            path,
            triangles,
            bytes,
        }))
    }
}

/// Streams `source`, assigns every triangle to the chunk containing its
/// world-space centroid, and hands each flushed partition to `sink` as soon
/// as it is on disk.
///
/// Fails with [`PartitionError::Bounds`] before writing anything when the
/// placed mesh bounds miss the world. Returning `ControlFlow::Break` from
/// `sink` ends the scan; unflushed buffers are dropped.
pub fn partition<F>(
    source: &Path,
    placement: &Placement,
    config: &PartitionConfig,
    sink: F,
) -> Result<PartitionStats, PartitionError>
where
    F: FnMut(TriPartition) -> ControlFlow<()>,
{
    let mut reader = TriReader::open(source)?;
    let header = *reader.header();
    let world_bounds = placement.apply_bounds(&header.bounds);
    let range = World::chunks_overlapping(&world_bounds)?;
    log::info!(
        target: "partition",
        "partitioning {} ({} triangles, {:?}) over {} candidate chunks",
        source.display(),
        header.triangle_count,
        header.layout,
        range.len()
    );

    std::fs::create_dir_all(&config.scratch_dir)?;
    let mut stats = PartitionStats {
        candidate_chunks: range.len(),
        ..Default::default()
    };
    let mut flusher = Flusher {
        dir: &config.scratch_dir,
        seq: HashMap::new(),
        sink,
        written: 0,
    };
    let mut buffers: HashMap<ChunkKey, ChunkBuffer> = HashMap::new();
    let mut resident = 0usize;
    let mut touched = hashbrown::HashSet::new();
    let mut batch: Vec<Triangle> = Vec::new();
    let batch_len = config.batch_triangles.max(1);

    'scan: loop {
        if reader.next_batch(batch_len, &mut batch)? == 0 {
            break;
        }
        let src = SourceArrays {
            vertices: reader.vertices(),
            colors: reader.colors(),
            normals: reader.normals(),
        };
        for t in &batch {
            stats.triangles_read += 1;
            let c = placement.apply(centroid(t.vertices.map(|i| src.vertices[i as usize])));
            let Some(key) = c.is_finite().then(|| ChunkKey::from_world_point(c)).flatten() else {
                stats.triangles_discarded += 1;
                continue;
            };
            stats.triangles_assigned += 1;
            touched.insert(key);

            // A fresh buffer's header bytes are resident too.
            let fresh = !buffers.contains_key(&key);
            let buf = buffers
                .entry(key)
                .or_insert_with(|| ChunkBuffer::new(header.layout));
            let before = if fresh { 0 } else { buf.bytes() };
            buf.push(t, &src, placement);
            let after = buf.bytes();
            resident = resident + after - before;

            if after >= config.flush_bytes {
                if let Some(full) = buffers.remove(&key) {
                    resident -= full.bytes();
                    if flusher.flush(key, full)?.is_break() {
                        stats.stopped = true;
                        break 'scan;
                    }
                }
            }
            while resident > config.resident_budget {
                let Some(largest) = buffers
                    .iter()
                    .max_by_key(|(k, b)| (b.bytes(), std::cmp::Reverse(**k)))
                    .map(|(k, _)| *k)
                else {
                    break;
                };
                let Some(spilled) = buffers.remove(&largest) else {
                    break;
                };
                resident -= spilled.bytes();
                log::debug!(target: "partition", "resident budget exceeded, spilling {largest}");
                if flusher.flush(largest, spilled)?.is_break() {
                    stats.stopped = true;
                    break 'scan;
                }
            }
        }
    }

    if !stats.stopped {
        let mut rest: Vec<_> = buffers.drain().collect();
        rest.sort_by_key(|(k, _)| *k);
        for (key, buf) in rest {
            if flusher.flush(key, buf)?.is_break() {
                stats.stopped = true;
                break;
            }
        }
    }

    stats.partitions_written = flusher.written;
    stats.chunks_touched = touched.len();
    log::info!(
        target: "partition",
        "partitioned {} triangles into {} parts across {} chunks ({} discarded)",
        stats.triangles_assigned,
        stats.partitions_written,
        stats.chunks_touched,
        stats.triangles_discarded
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use svobake_io::{MeshRecord, TriangleLayout, read_mesh_file};
    use svobake_world::ChunkCoord;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "svobake-partition-{tag}-{}-{n}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn mesh_of(tris: &[[[f32; 3]; 3]]) -> MeshRecord {
        let mut m = MeshRecord::new(TriangleLayout::Plain);
        for t in tris {
            let base = m.vertices.len() as u32;
            m.vertices.extend_from_slice(t);
            m.triangles.push(Triangle {
                vertices: [base, base + 1, base + 2],
                ..Default::default()
            });
        }
        m.fit_bounds();
        m
    }

    fn run(
        dir: &Path,
        mesh: &MeshRecord,
        placement: Placement,
        config: PartitionConfig,
    ) -> (Result<PartitionStats, PartitionError>, Vec<TriPartition>) {
        let source = dir.join("source.tri");
        write_mesh_file(&source, mesh).unwrap();
        let mut parts = Vec::new();
        let stats = partition(&source, &placement, &config, |p| {
            parts.push(p);
            ControlFlow::Continue(())
        });
        (stats, parts)
    }

    fn config(dir: &Path) -> PartitionConfig {
        PartitionConfig {
            scratch_dir: dir.join("scratch"),
            ..Default::default()
        }
    }

    #[test]
    fn adjacent_chunks_get_each_triangle_once() {
        let dir = temp_dir("adjacent");
        let mesh = mesh_of(&[
            // Wholly inside chunk (0,0,0).
            [[1.0, 1.0, 1.0], [2.0, 1.0, 1.0], [1.0, 2.0, 1.0]],
            // Straddles x = 16, centroid at 15.0: chunk (0,0,0).
            [[14.0, 1.0, 1.0], [17.0, 1.0, 1.0], [14.0, 2.0, 1.0]],
            // Centroid exactly on the face x = 16: upper chunk.
            [[15.0, 1.0, 1.0], [17.0, 1.0, 1.0], [16.0, 2.0, 1.0]],
            // Wholly inside chunk (1,0,0).
            [[20.0, 1.0, 1.0], [21.0, 1.0, 1.0], [20.0, 2.0, 1.0]],
        ]);
        let (stats, parts) = run(&dir, &mesh, Placement::default(), config(&dir));
        let stats = stats.unwrap();
        assert_eq!(stats.triangles_read, 4);
        assert_eq!(stats.triangles_assigned, 4);
        assert_eq!(stats.partitions_written, 2);
        assert_eq!(parts.len(), 2);

        let k0 = ChunkCoord::new(0, 0, 0).key().unwrap();
        let k1 = ChunkCoord::new(1, 0, 0).key().unwrap();
        let by_key = |k: ChunkKey| parts.iter().find(|p| p.key == k).unwrap();
        assert_eq!(by_key(k0).triangles, 2);
        assert_eq!(by_key(k1).triangles, 2);

        let upper = read_mesh_file(&by_key(k1).path).unwrap();
        assert_eq!(upper.triangles.len(), 2);
        assert_eq!(upper.vertices.len(), 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn placement_moves_vertices_into_world_space() {
        let dir = temp_dir("placement");
        let mesh = mesh_of(&[[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]]);
        let (stats, parts) = run(&dir, &mesh, Placement::at(32.0, 16.0, 48.0), config(&dir));
        assert_eq!(stats.unwrap().triangles_assigned, 1);
        assert_eq!(parts[0].key, ChunkCoord::new(2, 1, 3).key().unwrap());
        let out = read_mesh_file(&parts[0].path).unwrap();
        assert_eq!(out.vertices[1], [33.0, 16.0, 48.0]);
        assert_eq!(out.bounds.min, Vec3::new(32.0, 16.0, 48.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mesh_outside_world_is_bounds_error() {
        let dir = temp_dir("outside");
        let mesh = mesh_of(&[[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]]);
        let (stats, parts) = run(&dir, &mesh, Placement::at(-100.0, 0.0, 0.0), config(&dir));
        assert!(matches!(stats, Err(PartitionError::Bounds(_))));
        assert!(parts.is_empty());
        assert!(!dir.join("scratch").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn centroids_outside_world_are_discarded() {
        let dir = temp_dir("discard");
        let mesh = mesh_of(&[
            [[1.0, 1.0, 1.0], [2.0, 1.0, 1.0], [1.0, 2.0, 1.0]],
            [[-5.0, 1.0, 1.0], [-4.0, 1.0, 1.0], [-5.0, 2.0, 1.0]],
        ]);
        let (stats, parts) = run(&dir, &mesh, Placement::default(), config(&dir));
        let stats = stats.unwrap();
        assert_eq!(stats.triangles_discarded, 1);
        assert_eq!(stats.triangles_assigned, 1);
        assert_eq!(parts.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flush_threshold_splits_one_chunk_into_parts() {
        let dir = temp_dir("threshold");
        let tris: Vec<_> = (0..10)
            .map(|i| {
                let x = i as f32;
                [[x, 1.0, 1.0], [x + 0.5, 1.0, 1.0], [x, 1.5, 1.0]]
            })
            .collect();
        let mesh = mesh_of(&tris);
        let cfg = PartitionConfig {
            // Header plus three triangles' worth of vertices and records.
            flush_bytes: 52 + 3 * (36 + 12),
            ..config(&dir)
        };
        let (stats, parts) = run(&dir, &mesh, Placement::default(), cfg);
        let stats = stats.unwrap();
        assert_eq!(stats.partitions_written as usize, parts.len());
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.key == parts[0].key));
        let total: u32 = parts.iter().map(|p| p.triangles).sum();
        assert_eq!(total, 10);
        let mut paths: Vec<_> = parts.iter().map(|p| p.path.clone()).collect();
        paths.dedup();
        assert_eq!(paths.len(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tiny_threshold_flushes_every_triangle() {
        let dir = temp_dir("tiny");
        let tris: Vec<_> = (0..5)
            .map(|i| {
                let x = 1.0 + i as f32;
                [[x, 1.0, 1.0], [x + 0.5, 1.0, 1.0], [x, 1.5, 1.0]]
            })
            .collect();
        let cfg = PartitionConfig {
            flush_bytes: 1,
            resident_budget: 1 << 20,
            ..config(&dir)
        };
        let (stats, parts) = run(&dir, &mesh_of(&tris), Placement::default(), cfg);
        let stats = stats.unwrap();
        assert_eq!(stats.partitions_written, 5);
        assert!(parts.iter().all(|p| p.triangles == 1));
        let seqs: Vec<u32> = parts.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        let first = read_mesh_file(&parts[0].path).unwrap();
        assert_eq!(first.vertices[0], [1.0, 1.0, 1.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn resident_budget_spills_buffers() {
        let dir = temp_dir("budget");
        let tris: Vec<_> = (0..8)
            .map(|i| {
                let x = i as f32 * 16.0 + 1.0;
                [[x, 1.0, 1.0], [x + 1.0, 1.0, 1.0], [x, 2.0, 1.0]]
            })
            .collect();
        let mesh = mesh_of(&tris);
        let cfg = PartitionConfig {
            resident_budget: 200,
            ..config(&dir)
        };
        let (stats, parts) = run(&dir, &mesh, Placement::default(), cfg);
        let stats = stats.unwrap();
        assert_eq!(stats.chunks_touched, 8);
        assert_eq!(parts.len(), 8);
        let total: u32 = parts.iter().map(|p| p.triangles).sum();
        assert_eq!(total, 8);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn break_from_sink_stops_scan() {
        let dir = temp_dir("break");
        let tris: Vec<_> = (0..4)
            .map(|i| {
                let x = i as f32 * 16.0 + 1.0;
                [[x, 1.0, 1.0], [x + 1.0, 1.0, 1.0], [x, 2.0, 1.0]]
            })
            .collect();
        let source = dir.join("source.tri");
        write_mesh_file(&source, &mesh_of(&tris)).unwrap();
        let mut seen = 0;
        let stats = partition(&source, &Placement::default(), &config(&dir), |_| {
            seen += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert!(stats.stopped);
        assert_eq!(seen, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
