//! Mesh stream (`.tri`) codec, streaming reader, and PLY import.
#![forbid(unsafe_code)]

pub mod ply;
mod stream;
pub mod tri;

pub use stream::{TriReader, read_mesh_file, write_mesh_file};
pub use tri::{
    FormatError, MeshRecord, TRI_MAGIC, TRI_VERSION, Triangle, TriangleLayout, TriangleRecords,
    TriHeader, decode, encode, features,
};

/// Failure reading or writing a mesh stream.
#[derive(Debug, thiserror::Error)]
pub enum TriError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("mesh stream io: {0}")]
    Io(#[from] std::io::Error),
}
