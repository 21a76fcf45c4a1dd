use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use proptest::prelude::*;
use svobake_svo::{ChunkStore, RetryPolicy, SvoTree, decode, encode};
use svobake_voxel::{VoxelAttr, VoxelGrid, VoxelPos};
use svobake_world::ChunkKey;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("svobake-prop-merge-{}-{n}", std::process::id()))
}

const KEY: ChunkKey = ChunkKey {
    region: 12,
    chunk: 345,
};

// Attributes are a function of position, so grids never disagree about a
// shared voxel.
fn attr_at(p: VoxelPos) -> VoxelAttr {
    VoxelAttr {
        color: Some([p.x, p.y ^ 0x5A, p.z]),
        normal: (p.x % 3 == 0).then_some(u16::from(p.y) << 8 | u16::from(p.z)),
    }
}

fn arb_grid() -> impl Strategy<Value = VoxelGrid> {
    // Clustered near the origin so subtrees fill up and collapse.
    let pos = (0u8..6, 0u8..6, 0u8..6, any::<bool>()).prop_map(|(x, y, z, far)| {
        if far {
            VoxelPos::new(x + 200, y, z + 100)
        } else {
            VoxelPos::new(x, y, z)
        }
    });
    prop::collection::vec(pos, 0..120)
        .prop_map(|ps| VoxelGrid::from_voxels(KEY, ps.into_iter().map(|p| (p, attr_at(p)))))
}

fn merged(grids: &[&VoxelGrid]) -> SvoTree {
    let mut t = SvoTree::new();
    for g in grids {
        t.merge_grid(g);
    }
    t.compact();
    t
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merge_is_commutative(a in arb_grid(), b in arb_grid()) {
        let ab = merged(&[&a, &b]);
        let ba = merged(&[&b, &a]);
        prop_assert_eq!(encode(KEY, &ab), encode(KEY, &ba));
    }

    #[test]
    fn merge_is_idempotent(a in arb_grid()) {
        let once = merged(&[&a]);
        let twice = merged(&[&a, &a]);
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.voxel_count(), a.len() as u64);
    }

    #[test]
    fn merge_only_adds_occupancy(a in arb_grid(), b in arb_grid()) {
        let t = merged(&[&a, &b]);
        for (p, attr) in a.iter().chain(b.iter()) {
            prop_assert_eq!(t.get(p), Some(attr));
        }
        let bytes = encode(KEY, &t);
        prop_assert_eq!(decode(KEY, &bytes).unwrap(), t);
    }

    // Persisted merges in either order leave byte-identical files.
    #[test]
    fn store_merges_commute(a in arb_grid(), b in arb_grid()) {
        let (r1, r2) = (temp_root(), temp_root());
        let s1 = ChunkStore::open(&r1, RetryPolicy::none()).unwrap();
        let s2 = ChunkStore::open(&r2, RetryPolicy::none()).unwrap();
        s1.merge(KEY, &a).unwrap();
        s1.merge(KEY, &b).unwrap();
        s2.merge(KEY, &b).unwrap();
        s2.merge(KEY, &a).unwrap();
        let read = |s: &ChunkStore| std::fs::read(s.chunk_path(KEY)).ok();
        prop_assert_eq!(read(&s1), read(&s2));
        let _ = std::fs::remove_dir_all(&r1);
        let _ = std::fs::remove_dir_all(&r2);
    }
}
