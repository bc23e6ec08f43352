//! GPU-side geometry streams
//!
//! - [`target`]: one descriptor per target triangle, with its tile range
//! - [`tile`]: the tile mesh, uploaded verbatim
//! - [`output`]: append buffers the tiling kernel writes into, with counters

pub mod output;
pub mod target;
pub mod tile;

pub use output::{
    GeneratedGeometry, GpuMeshStream, OutputVertex, StreamHeader, StreamPhase, STREAM_HEADER_SIZE,
};
pub use target::{TargetGeometryStream, TargetMesh, TargetTriangle, TileSpan, UV_PER_TILE};
pub use tile::{TileGeometryStreams, TileMesh, TileVertex};

use crate::backend::BackendError;
use crate::loader::LoadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("tile budget exceeds 32 bits at target triangle {triangle}")]
    TileBudgetOverflow { triangle: usize },
    #[error("{what} holds {count} elements, more than 32-bit addressing allows")]
    TooLarge { what: &'static str, count: usize },
}
