//! Chunk octree: arena tree, on-disk format, and the persisted store that
//! merges voxel grids into it.
#![forbid(unsafe_code)]

pub mod codec;
mod store;
mod tree;

pub use codec::{CorruptChunkError, SVO_MAGIC, SVO_VERSION, decode, encode, peek_key};
pub use store::{ChunkStore, MergeOutcome, RetryPolicy, StoreError};
pub use tree::{MAX_DEPTH, NodeId, SvoNode, SvoTree};
