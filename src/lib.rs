//! Surface Tiler - GPU procedural tiling of meshes
//!
//! A small tile mesh is stamped across every triangle of a coarse target
//! mesh by one compute dispatch. Each target triangle owns the UV cells its
//! bounding box covers; the kernel maps the tile into every cell and appends
//! the surviving triangles to a preallocated output stream whose counters
//! are read back afterwards.
//!
//! This crate supports two backends:
//! - **wgpu**: headless GPU device
//! - **Software**: host-memory buffers with a CPU version of the kernel, for
//!   machines without a GPU and for tests
//!
//! # Features
//! - OBJ loading with per-material parts and vertex deduplication
//! - Target, tile and output geometry streams
//! - Precompiled kernel variants for clipping, normal mode and thread group size
//! - Overflow accounting on the output stream
//! - CSV statistics for thread group size sweeps
//! - Offscreen top-down preview of generated geometry

pub mod backend;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod preview;
pub mod resources;
pub mod session;
pub mod shader;
pub mod stats;
pub mod streams;

pub use dispatch::{DispatchConfig, NormalMode, ThreadGroupSize, TileDispatcher};
pub use error::{TilerError, TilerResult};
pub use loader::{LoadOptions, MaterialMode, MeshLoader};
pub use preview::{PreviewPipeline, PreviewTarget, PreviewView};
pub use session::{Backend, CapacityPolicy, FrameConfig, FrameReport, MeshSource, SessionConfig, TilingSession};
pub use streams::{GpuMeshStream, TargetMesh, TileMesh};

// Re-export backends for direct access
pub use backend::software::SoftwareBackend;
pub use backend::wgpu_backend::WgpuBackend;

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu backend - headless GPU device
    #[default]
    Wgpu,
    /// Software backend - CPU kernels, no GPU required
    Software,
}
