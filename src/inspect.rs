use std::error::Error;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use hashbrown::{HashMap, HashSet};
use svobake_io::TriHeader;
use svobake_io::tri::HEADER_LEN;
use svobake_svo::{ChunkStore, RetryPolicy, SvoTree, decode, peek_key};
use svobake_world::ChunkKey;

/// What a persisted chunk holds, leaf by leaf.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SvoSummary {
    pub nodes: usize,
    pub voxels: u64,
    pub solid_leaves: u64,
    /// Solid leaf count by edge length in voxels.
    pub leaf_sizes: HashMap<u32, u64>,
    pub distinct_colors: usize,
    pub with_normals: u64,
}

pub fn summarize(tree: &SvoTree) -> SvoSummary {
    let mut s = SvoSummary {
        nodes: tree.node_count(),
        voxels: tree.voxel_count(),
        ..Default::default()
    };
    let mut colors = HashSet::new();
    tree.for_each_solid(|_, size, attr| {
        s.solid_leaves += 1;
        *s.leaf_sizes.entry(size).or_insert(0) += 1;
        if let Some(c) = attr.color {
            colors.insert(c);
        }
        if attr.normal.is_some() {
            s.with_normals += 1;
        }
    });
    s.distinct_colors = colors.len();
    s
}

fn print_tri(path: &Path, head: &[u8]) -> Result<(), Box<dyn Error>> {
    let h = TriHeader::parse(head)?;
    println!("{}: mesh stream", path.display());
    println!("  layout     {:?}", h.layout);
    println!("  vertices   {}", h.vertex_count);
    println!("  triangles  {}", h.triangle_count);
    println!("  colors     {}", h.color_count);
    println!("  normals    {}", h.normal_count);
    println!(
        "  bounds     {:?} .. {:?}",
        h.bounds.min.to_array(),
        h.bounds.max.to_array()
    );
    println!("  size       {} bytes", h.stream_len());
    Ok(())
}

fn print_svo(path: &Path) -> Result<(), Box<dyn Error>> {
    let bytes = std::fs::read(path)?;
    let key = peek_key(&bytes)?;
    let tree = decode(key, &bytes)?;
    let s = summarize(&tree);
    let c = key.coord();
    println!("{}: chunk {key} at ({}, {}, {})", path.display(), c.cx, c.cy, c.cz);
    println!("  nodes      {}", s.nodes);
    println!("  voxels     {}", s.voxels);
    println!("  leaves     {}", s.solid_leaves);
    let mut sizes: Vec<_> = s.leaf_sizes.iter().collect();
    sizes.sort();
    for (size, n) in sizes {
        println!("    {size:>3}^3  {n}");
    }
    println!("  colors     {} distinct", s.distinct_colors);
    println!("  normals    {} leaves", s.with_normals);
    Ok(())
}

fn print_store(root: &Path) -> Result<(), Box<dyn Error>> {
    let store = ChunkStore::open(root, RetryPolicy::none())?;
    let keys = store.persisted_chunks()?;
    let mut per_region: HashMap<u16, Vec<ChunkKey>> = HashMap::new();
    let mut total = 0u64;
    for &k in &keys {
        total += std::fs::metadata(store.chunk_path(k))?.len();
        per_region.entry(k.region).or_default().push(k);
    }
    println!(
        "{}: {} chunks in {} regions, {total} bytes",
        root.display(),
        keys.len(),
        per_region.len()
    );
    let mut regions: Vec<_> = per_region.into_iter().collect();
    regions.sort_by_key(|(r, _)| *r);
    for (region, chunks) in regions {
        println!("  r{region:05}  {} chunks", chunks.len());
    }
    Ok(())
}

pub fn run(path: &Path) -> Result<(), Box<dyn Error>> {
    if path.is_dir() {
        return print_store(path);
    }
    let mut head = Vec::with_capacity(HEADER_LEN);
    File::open(path)?
        .take(HEADER_LEN as u64)
        .read_to_end(&mut head)?;
    match head.get(..4) {
        Some(m) if m == svobake_io::TRI_MAGIC => print_tri(path, &head),
        Some(m) if m == svobake_svo::SVO_MAGIC => print_svo(path),
        _ => Err(format!("{}: not a .tri or .svo file", path.display()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svobake_voxel::{VoxelAttr, VoxelPos};

    #[test]
    fn summary_counts_collapsed_leaves() {
        let mut t = SvoTree::new();
        let red = VoxelAttr {
            color: Some([200, 0, 0]),
            normal: None,
        };
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    t.insert(VoxelPos::new(x, y, z), red);
                }
            }
        }
        t.insert(
            VoxelPos::new(9, 9, 9),
            VoxelAttr {
                color: Some([0, 0, 200]),
                normal: Some(0x8080),
            },
        );
        t.compact();
        let s = summarize(&t);
        assert_eq!(s.voxels, 9);
        assert_eq!(s.solid_leaves, 2);
        assert_eq!(s.leaf_sizes.get(&2), Some(&1));
        assert_eq!(s.leaf_sizes.get(&1), Some(&1));
        assert_eq!(s.distinct_colors, 2);
        assert_eq!(s.with_normals, 1);
    }

    #[test]
    fn empty_tree_summary() {
        let s = summarize(&SvoTree::new());
        assert_eq!(s.voxels, 0);
        assert_eq!(s.solid_leaves, 0);
        assert!(s.leaf_sizes.is_empty());
    }
}
