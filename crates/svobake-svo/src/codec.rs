//! On-disk chunk octree format.
//!
//! ```text
//! header  (24 bytes, little-endian)
//!   magic        b"SVOC"
//!   version      u32
//!   region       u16
//!   chunk        u16
//!   node_count   u32
//!   payload_len  u32
//!   payload_crc  u32   CRC-32 of the payload
//! payload  node_count nodes in arena order, root first
//!   tag u8: 0 empty | 1 solid | 2 branch
//!   solid:  flags u8 (bit 0 color, bit 1 normal), rgb [u8; 3], normal u16
//!   branch: 8 x u32 child index
//! footer  b"END!"
//! ```
use svobake_voxel::VoxelAttr;
use svobake_world::ChunkKey;

use crate::tree::{MAX_DEPTH, NodeId, SvoNode, SvoTree};

pub const SVO_MAGIC: [u8; 4] = *b"SVOC";
pub const SVO_VERSION: u32 = 1;
pub const SVO_FOOTER: [u8; 4] = *b"END!";
pub const SVO_HEADER_LEN: usize = 24;

const TAG_EMPTY: u8 = 0;
const TAG_SOLID: u8 = 1;
const TAG_BRANCH: u8 = 2;
const FLAG_COLOR: u8 = 1;
const FLAG_NORMAL: u8 = 2;

/// A persisted chunk whose bytes cannot be trusted. Recovered by treating the
/// chunk as empty.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptChunkError {
    #[error("file is {0} bytes, shorter than header and footer")]
    TooShort(usize),
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported version {0}")]
    BadVersion(u32),
    #[error("file belongs to {found}, expected {expected}")]
    KeyMismatch { expected: ChunkKey, found: ChunkKey },
    #[error("length {actual} does not match header ({expected})")]
    Length { expected: usize, actual: usize },
    #[error("payload checksum {actual:#010x} does not match header {expected:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("missing footer")]
    BadFooter,
    #[error("node {node}: {reason}")]
    BadNode { node: u32, reason: &'static str },
    #[error("payload holds {actual} nodes, header says {expected}")]
    NodeCount { expected: u32, actual: u32 },
    #[error("node {0} is reachable twice")]
    SharedNode(u32),
    #[error("branch {0} below voxel depth")]
    TooDeep(u32),
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn write_node(node: &SvoNode, out: &mut Vec<u8>) {
    match node {
        SvoNode::Empty => out.push(TAG_EMPTY),
        SvoNode::Solid(attr) => {
            let mut flags = 0;
            if attr.color.is_some() {
                flags |= FLAG_COLOR;
            }
            if attr.normal.is_some() {
                flags |= FLAG_NORMAL;
            }
            out.push(TAG_SOLID);
            out.push(flags);
            out.extend_from_slice(&attr.color.unwrap_or_default());
            out.extend_from_slice(&attr.normal.unwrap_or_default().to_le_bytes());
        }
        SvoNode::Branch(children) => {
            out.push(TAG_BRANCH);
            for c in children {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
    }
}

/// Serializes `tree` for `key`. The tree is written as-is; callers compact
/// first so the bytes are canonical.
pub fn encode(key: ChunkKey, tree: &SvoTree) -> Vec<u8> {
    debug_assert_eq!(tree.root(), 0);
    let mut payload = Vec::with_capacity(tree.node_count() * 8);
    for node in tree.nodes() {
        write_node(node, &mut payload);
    }
    let mut out = Vec::with_capacity(SVO_HEADER_LEN + payload.len() + SVO_FOOTER.len());
    out.extend_from_slice(&SVO_MAGIC);
    out.extend_from_slice(&SVO_VERSION.to_le_bytes());
    out.extend_from_slice(&key.region.to_le_bytes());
    out.extend_from_slice(&key.chunk.to_le_bytes());
    out.extend_from_slice(&(tree.node_count() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&SVO_FOOTER);
    out
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, node: u32) -> Result<&'a [u8], CorruptChunkError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(CorruptChunkError::BadNode {
                node,
                reason: "truncated",
            })?;
        self.pos += n;
        Ok(s)
    }
}

fn read_node(cur: &mut Cursor<'_>, node: u32, count: u32) -> Result<SvoNode, CorruptChunkError> {
    let bad = |reason| CorruptChunkError::BadNode { node, reason };
    match cur.take(1, node)?[0] {
        TAG_EMPTY => Ok(SvoNode::Empty),
        TAG_SOLID => {
            let b = cur.take(6, node)?;
            let flags = b[0];
            if flags & !(FLAG_COLOR | FLAG_NORMAL) != 0 {
                return Err(bad("unknown flags"));
            }
            let rgb = [b[1], b[2], b[3]];
            let normal = u16::from_le_bytes([b[4], b[5]]);
            let color = (flags & FLAG_COLOR != 0).then_some(rgb);
            let normal = (flags & FLAG_NORMAL != 0).then_some(normal);
            if (color.is_none() && rgb != [0; 3]) || (normal.is_none() && b[4..6] != [0, 0]) {
                return Err(bad("data in absent field"));
            }
            Ok(SvoNode::Solid(VoxelAttr { color, normal }))
        }
        TAG_BRANCH => {
            let b = cur.take(32, node)?;
            let mut children = [0 as NodeId; 8];
            for (i, c) in children.iter_mut().enumerate() {
                *c = u32::from_le_bytes([b[i * 4], b[i * 4 + 1], b[i * 4 + 2], b[i * 4 + 3]]);
                if *c == 0 || *c >= count {
                    return Err(bad("child index out of range"));
                }
            }
            Ok(SvoNode::Branch(children))
        }
        _ => Err(bad("unknown tag")),
    }
}

/// Every node reachable exactly once from the root, and no branch deeper
/// than the voxel level.
fn check_tree(nodes: &[SvoNode]) -> Result<(), CorruptChunkError> {
    let mut seen = vec![false; nodes.len()];
    let mut stack: Vec<(NodeId, u32)> = vec![(0, 0)];
    seen[0] = true;
    while let Some((id, depth)) = stack.pop() {
        if let SvoNode::Branch(children) = nodes[id as usize] {
            if depth >= MAX_DEPTH {
                return Err(CorruptChunkError::TooDeep(id));
            }
            for c in children {
                if std::mem::replace(&mut seen[c as usize], true) {
                    return Err(CorruptChunkError::SharedNode(c));
                }
                stack.push((c, depth + 1));
            }
        }
    }
    Ok(())
}

/// Chunk key recorded in a file's header, checking only magic and length.
pub fn peek_key(bytes: &[u8]) -> Result<ChunkKey, CorruptChunkError> {
    if bytes.len() < SVO_HEADER_LEN {
        return Err(CorruptChunkError::TooShort(bytes.len()));
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != SVO_MAGIC {
        return Err(CorruptChunkError::BadMagic(magic));
    }
    Ok(ChunkKey {
        region: u16::from_le_bytes([bytes[8], bytes[9]]),
        chunk: u16::from_le_bytes([bytes[10], bytes[11]]),
    })
}

pub fn decode(key: ChunkKey, bytes: &[u8]) -> Result<SvoTree, CorruptChunkError> {
    let min = SVO_HEADER_LEN + SVO_FOOTER.len();
    if bytes.len() < min {
        return Err(CorruptChunkError::TooShort(bytes.len()));
    }
    let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    let half = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != SVO_MAGIC {
        return Err(CorruptChunkError::BadMagic(magic));
    }
    let version = word(4);
    if version != SVO_VERSION {
        return Err(CorruptChunkError::BadVersion(version));
    }
    let found = ChunkKey {
        region: half(8),
        chunk: half(10),
    };
    if found != key {
        return Err(CorruptChunkError::KeyMismatch {
            expected: key,
            found,
        });
    }
    let node_count = word(12);
    let payload_len = word(16) as usize;
    let expected = min + payload_len;
    if bytes.len() != expected {
        return Err(CorruptChunkError::Length {
            expected,
            actual: bytes.len(),
        });
    }
    let payload = &bytes[SVO_HEADER_LEN..SVO_HEADER_LEN + payload_len];
    let (stored, actual) = (word(20), crc32(payload));
    if stored != actual {
        return Err(CorruptChunkError::Checksum {
            expected: stored,
            actual,
        });
    }
    if bytes[SVO_HEADER_LEN + payload_len..] != SVO_FOOTER {
        return Err(CorruptChunkError::BadFooter);
    }
    if node_count == 0 {
        return Err(CorruptChunkError::NodeCount {
            expected: 0,
            actual: 0,
        });
    }

    let mut cur = Cursor {
        bytes: payload,
        pos: 0,
    };
    // Smallest node is one byte, which bounds the allocation.
    let mut nodes = Vec::with_capacity((node_count as usize).min(payload_len));
    for i in 0..node_count {
        if cur.pos >= payload.len() {
            return Err(CorruptChunkError::NodeCount {
                expected: node_count,
                actual: i,
            });
        }
        nodes.push(read_node(&mut cur, i, node_count)?);
    }
    if cur.pos != payload.len() {
        return Err(CorruptChunkError::BadNode {
            node: node_count,
            reason: "trailing payload bytes",
        });
    }
    check_tree(&nodes)?;
    Ok(SvoTree::from_arena(nodes, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use svobake_voxel::VoxelPos;

    fn key() -> ChunkKey {
        ChunkKey {
            region: 7,
            chunk: 1234,
        }
    }

    fn sample() -> SvoTree {
        let mut t = SvoTree::new();
        t.insert(
            VoxelPos::new(10, 20, 30),
            VoxelAttr {
                color: Some([1, 2, 3]),
                normal: Some(0xBEEF),
            },
        );
        t.insert(VoxelPos::new(200, 0, 5), VoxelAttr::default());
        t.compact();
        t
    }

    #[test]
    fn decode_inverts_encode() {
        let t = sample();
        let bytes = encode(key(), &t);
        assert_eq!(&bytes[..4], b"SVOC");
        assert_eq!(&bytes[bytes.len() - 4..], b"END!");
        assert_eq!(decode(key(), &bytes).unwrap(), t);
    }

    #[test]
    fn empty_tree_is_one_node() {
        let bytes = encode(key(), &SvoTree::new());
        assert_eq!(bytes.len(), SVO_HEADER_LEN + 1 + 4);
        assert!(decode(key(), &bytes).unwrap().is_empty());
    }

    #[test]
    fn flipped_payload_bit_fails_checksum() {
        let mut bytes = encode(key(), &sample());
        bytes[SVO_HEADER_LEN + 3] ^= 0x40;
        assert!(matches!(
            decode(key(), &bytes),
            Err(CorruptChunkError::Checksum { .. })
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let bytes = encode(key(), &sample());
        let other = ChunkKey {
            region: 7,
            chunk: 1235,
        };
        assert!(matches!(
            decode(other, &bytes),
            Err(CorruptChunkError::KeyMismatch { .. })
        ));
        assert_eq!(peek_key(&bytes), Ok(key()));
    }

    #[test]
    fn truncation_rejected() {
        let bytes = encode(key(), &sample());
        for cut in [1, 4, 10, bytes.len() - 8] {
            assert!(decode(key(), &bytes[..bytes.len() - cut]).is_err());
        }
    }

    /// Re-seals a hand-built payload so only structural checks can fail.
    fn seal(nodes: &[SvoNode]) -> Vec<u8> {
        encode(key(), &SvoTree::from_arena(nodes.to_vec(), 0))
    }

    #[test]
    fn cycle_is_rejected() {
        let mut kids = [2; 8];
        kids[0] = 1;
        let nodes = [
            SvoNode::Branch(kids),
            SvoNode::Branch([1; 8]),
            SvoNode::Empty,
        ];
        assert!(decode(key(), &seal(&nodes)).is_err());
    }

    #[test]
    fn root_reference_is_rejected() {
        let nodes = [SvoNode::Branch([0; 8])];
        assert!(matches!(
            decode(key(), &seal(&nodes)),
            Err(CorruptChunkError::BadNode { .. })
        ));
    }

    #[test]
    fn branch_below_voxel_level_rejected() {
        // Nine nested branches, each the first child of the one above; the
        // deepest sits where only voxel leaves are allowed.
        let mut arena = vec![SvoNode::Empty; 1 + 9 * 8];
        for level in 0..9u32 {
            let me = if level == 0 { 0 } else { 1 + (level - 1) * 8 };
            let first = 1 + level * 8;
            arena[me as usize] = SvoNode::Branch(std::array::from_fn(|i| first + i as u32));
        }
        assert!(matches!(
            decode(key(), &seal(&arena)),
            Err(CorruptChunkError::TooDeep(_))
        ));
    }
}
