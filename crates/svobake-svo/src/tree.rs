use svobake_voxel::{VoxelAttr, VoxelGrid, VoxelPos};

pub type NodeId = u32;

/// Levels below the root; a leaf at depth 8 is a single voxel.
pub const MAX_DEPTH: u32 = 8;
const ROOT_SIZE: u32 = 1 << MAX_DEPTH;

/// Arena node. A leaf (`Empty` or `Solid`) covers its whole cube uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SvoNode {
    Empty,
    Solid(VoxelAttr),
    /// Children in octant order: bit 0 = +x, bit 1 = +y, bit 2 = +z.
    Branch([NodeId; 8]),
}

impl SvoNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        !matches!(self, SvoNode::Branch(_))
    }
}

#[inline]
fn octant(pos: VoxelPos, shift: u32) -> usize {
    let bit = |v: u8| ((v as u32 >> shift) & 1) as usize;
    bit(pos.x) | (bit(pos.y) << 1) | (bit(pos.z) << 2)
}

/// Sparse voxel octree for one chunk, stored as an index arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SvoTree {
    nodes: Vec<SvoNode>,
    root: NodeId,
}

impl Default for SvoTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SvoTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![SvoNode::Empty],
            root: 0,
        }
    }

    /// Wraps an arena read from disk. The caller has checked that `nodes`
    /// forms a tree rooted at `root`.
    pub(crate) fn from_arena(nodes: Vec<SvoNode>, root: NodeId) -> Self {
        Self { nodes, root }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn nodes(&self) -> &[SvoNode] {
        &self.nodes
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.nodes[self.root as usize], SvoNode::Empty)
    }

    /// Marks `pos` occupied. Fields present in `attr` replace any stored
    /// ones; occupancy is never removed.
    pub fn insert(&mut self, pos: VoxelPos, attr: VoxelAttr) {
        let mut id = self.root as usize;
        let mut size = ROOT_SIZE;
        while size > 1 {
            let node = self.nodes[id];
            let children = match node {
                SvoNode::Branch(children) => children,
                leaf => {
                    let first = self.nodes.len() as NodeId;
                    self.nodes.extend(std::iter::repeat_n(leaf, 8));
                    let children = std::array::from_fn(|i| first + i as NodeId);
                    self.nodes[id] = SvoNode::Branch(children);
                    children
                }
            };
            size >>= 1;
            id = children[octant(pos, size.trailing_zeros())] as usize;
        }
        match &mut self.nodes[id] {
            SvoNode::Solid(stored) => stored.overlay(&attr),
            node => *node = SvoNode::Solid(attr),
        }
    }

    /// Inserts every voxel of `grid`.
    pub fn merge_grid(&mut self, grid: &VoxelGrid) {
        for (pos, attr) in grid.iter() {
            self.insert(pos, attr);
        }
    }

    pub fn get(&self, pos: VoxelPos) -> Option<VoxelAttr> {
        let mut id = self.root as usize;
        let mut size = ROOT_SIZE;
        loop {
            match self.nodes[id] {
                SvoNode::Empty => return None,
                SvoNode::Solid(attr) => return Some(attr),
                SvoNode::Branch(children) => {
                    size >>= 1;
                    id = children[octant(pos, size.trailing_zeros())] as usize;
                }
            }
        }
    }

    /// Number of occupied voxels.
    pub fn voxel_count(&self) -> u64 {
        fn count(nodes: &[SvoNode], id: NodeId, size: u64) -> u64 {
            match nodes[id as usize] {
                SvoNode::Empty => 0,
                SvoNode::Solid(_) => size * size * size,
                SvoNode::Branch(children) => children
                    .iter()
                    .map(|&c| count(nodes, c, size / 2))
                    .sum(),
            }
        }
        count(&self.nodes, self.root, ROOT_SIZE as u64)
    }

    /// Rebuilds the arena in canonical form: branches whose eight children
    /// are identical leaves collapse into that leaf, unreachable nodes are
    /// dropped, the root sits at index 0 and every other node follows its
    /// own subtree in octant order.
    ///
    /// Two trees holding the same voxels compact to identical arenas.
    pub fn compact(&mut self) {
        fn canon(nodes: &[SvoNode], id: NodeId, out: &mut Vec<SvoNode>) -> SvoNode {
            let SvoNode::Branch(children) = nodes[id as usize] else {
                return nodes[id as usize];
            };
            let kids = children.map(|c| canon(nodes, c, out));
            if kids[0].is_leaf() && kids.iter().all(|k| *k == kids[0]) {
                return kids[0];
            }
            SvoNode::Branch(kids.map(|k| {
                out.push(k);
                (out.len() - 1) as NodeId
            }))
        }

        let mut out = vec![SvoNode::Empty];
        let root = canon(&self.nodes, self.root, &mut out);
        out[0] = root;
        self.nodes = out;
        self.root = 0;
    }

    /// Calls `f` with the voxel-space origin, edge length and attributes of
    /// every solid leaf.
    pub fn for_each_solid(&self, mut f: impl FnMut(VoxelPos, u32, VoxelAttr)) {
        let mut stack = vec![(self.root, [0u32; 3], ROOT_SIZE)];
        while let Some((id, o, size)) = stack.pop() {
            match self.nodes[id as usize] {
                SvoNode::Empty => {}
                SvoNode::Solid(attr) => {
                    f(VoxelPos::new(o[0] as u8, o[1] as u8, o[2] as u8), size, attr)
                }
                SvoNode::Branch(children) => {
                    let h = size / 2;
                    for (i, &c) in children.iter().enumerate().rev() {
                        let i = i as u32;
                        let child_origin = [
                            o[0] + (i & 1) * h,
                            o[1] + ((i >> 1) & 1) * h,
                            o[2] + ((i >> 2) & 1) * h,
                        ];
                        stack.push((c, child_origin, h));
                    }
                }
            }
        }
    }
}
