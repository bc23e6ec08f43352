//! Tile generation dispatch
//!
//! Sizes and issues the compute pass that stamps the tile mesh onto every
//! target triangle. Work is one invocation per (target triangle, tile
//! triangle) pair, dispatched one-dimensionally:
//!
//! ```text
//! total_work = target_triangles * (tile_indices / 3)
//! workgroups = ceil(total_work / thread_group_size)
//! ```
//!
//! The kernel variant is looked up in a [`ShaderVariantTable`] built once per
//! device; nothing is chosen at dispatch time beyond the table index.

pub mod kernel;
pub mod variants;

pub use kernel::{TileStampKernel, TILE_ENTRY_POINT, TILE_GENERATION_SHADER};
pub use variants::{ShaderVariantTable, VariantKey};

use crate::backend::{BackendError, GraphicsBackend};
use crate::streams::{GpuMeshStream, TargetGeometryStream, TileGeometryStreams};
use std::fmt;
use thiserror::Error;

/// Storage binding points shared with the kernel source
pub mod bindings {
    pub const TARGET: u32 = 0;
    pub const TILE_VERTICES: u32 = 1;
    pub const TILE_INDICES: u32 = 2;
    pub const OUTPUT_VERTICES: u32 = 3;
    pub const OUTPUT_INDICES: u32 = 4;
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unsupported thread group size {0} (expected 64, 128, 256 or 512)")]
    UnsupportedThreadGroupSize(u32),
    #[error("no compiled kernel for variant [{0}]")]
    MissingVariant(VariantKey),
    #[error("{workgroups} workgroups exceed the device limit of {limit} per dimension")]
    TooManyWorkgroups { workgroups: u64, limit: u32 },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Workgroup width, baked into each kernel variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadGroupSize {
    #[default]
    X64,
    X128,
    X256,
    X512,
}

impl ThreadGroupSize {
    pub const ALL: [Self; 4] = [Self::X64, Self::X128, Self::X256, Self::X512];

    pub fn as_u32(self) -> u32 {
        match self {
            Self::X64 => 64,
            Self::X128 => 128,
            Self::X256 => 256,
            Self::X512 => 512,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::X64 => 0,
            Self::X128 => 1,
            Self::X256 => 2,
            Self::X512 => 3,
        }
    }
}

impl TryFrom<u32> for ThreadGroupSize {
    type Error = DispatchError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|size| size.as_u32() == value)
            .ok_or(DispatchError::UnsupportedThreadGroupSize(value))
    }
}

impl fmt::Display for ThreadGroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// How generated vertices are shaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NormalMode {
    /// Face normal of the target triangle
    #[default]
    Flat,
    /// Target vertex normals blended by barycentric weight
    Interpolated,
}

impl NormalMode {
    pub const ALL: [Self; 2] = [Self::Flat, Self::Interpolated];
}

impl fmt::Display for NormalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Interpolated => write!(f, "interpolated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchConfig {
    pub clipping: bool,
    pub normal_mode: NormalMode,
    pub thread_group_size: ThreadGroupSize,
}

/// Work and grid size of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSize {
    pub total_work: u64,
    pub workgroups: u64,
}

pub fn dispatch_size(target_triangles: u32, tile_indices: u32, group_size: ThreadGroupSize) -> DispatchSize {
    let total_work = u64::from(target_triangles) * u64::from(tile_indices / 3);
    let workgroups = total_work.div_ceil(u64::from(group_size.as_u32()));
    DispatchSize {
        total_work,
        workgroups,
    }
}

/// Issues tile generation passes
#[derive(Debug)]
pub struct TileDispatcher {
    variants: ShaderVariantTable,
}

impl TileDispatcher {
    /// Compile every kernel variant for `backend`
    pub fn new(backend: &mut dyn GraphicsBackend) -> Self {
        Self {
            variants: ShaderVariantTable::build(backend),
        }
    }

    pub fn with_variants(variants: ShaderVariantTable) -> Self {
        Self { variants }
    }

    pub fn variants(&self) -> &ShaderVariantTable {
        &self.variants
    }

    /// Stamp `tile` onto every triangle of `target`, appending into `output`.
    ///
    /// The output stream should have been reset first. Returns once the work
    /// is submitted; read the result with [`GpuMeshStream::generated_count`].
    pub fn dispatch(
        &self,
        backend: &mut dyn GraphicsBackend,
        config: &DispatchConfig,
        target: &TargetGeometryStream,
        tile: &TileGeometryStreams,
        output: &mut GpuMeshStream,
    ) -> Result<DispatchSize, DispatchError> {
        let key = VariantKey::from(config);
        let pipeline = self.variants.get(key).ok_or(DispatchError::MissingVariant(key))?;

        let size = dispatch_size(target.triangle_count(), tile.index_count(), config.thread_group_size);
        let limit = backend.limits().max_workgroups_per_dimension;
        if size.workgroups > u64::from(limit) {
            return Err(DispatchError::TooManyWorkgroups {
                workgroups: size.workgroups,
                limit,
            });
        }
        if size.total_work == 0 {
            log::debug!("Nothing to generate: empty target or tile");
            return Ok(size);
        }

        log::debug!(
            "Dispatching {} invocations in {} workgroups [{}]",
            size.total_work,
            size.workgroups,
            key
        );

        backend.begin_compute_pass(Some("Tile Generation"));
        backend.set_compute_pipeline(pipeline);
        target.bind(backend, bindings::TARGET);
        tile.bind(backend, bindings::TILE_VERTICES, bindings::TILE_INDICES);
        output.bind(backend, bindings::OUTPUT_VERTICES, bindings::OUTPUT_INDICES);
        backend.dispatch_compute(size.workgroups as u32, 1, 1);
        backend.unbind_storage_buffer(bindings::OUTPUT_VERTICES);
        backend.unbind_storage_buffer(bindings::OUTPUT_INDICES);
        backend.end_compute_pass();
        backend.submit();

        output.mark_dispatched();
        Ok(size)
    }
}
