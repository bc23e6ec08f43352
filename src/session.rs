//! Tiling session
//!
//! Owns everything one generation loop needs: the target and tile streams,
//! the output stream and the dispatcher with its kernel variants. Each call
//! to [`TilingSession::generate`] runs reset, dispatch and readback in that
//! order with the [`FrameConfig`] it is given.

use crate::backend::software::SoftwareBackend;
use crate::backend::traits::*;
use crate::backend::wgpu_backend::WgpuBackend;
use crate::dispatch::{DispatchConfig, DispatchSize, TileDispatcher, TileStampKernel};
use crate::error::{TilerError, TilerResult};
use crate::loader::MeshPartData;
use crate::resources;
use crate::streams::{GeneratedGeometry, GpuMeshStream, OutputVertex, TargetMesh, TileMesh, STREAM_HEADER_SIZE};
use crate::BackendType;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Backend wrapper so callers can pick a device at runtime
pub enum Backend {
    Wgpu(WgpuBackend),
    Software(SoftwareBackend),
}

impl Backend {
    /// Create a backend. The software backend comes with the tiling kernel registered.
    pub fn new(backend_type: BackendType) -> BackendResult<Self> {
        match backend_type {
            BackendType::Wgpu => Ok(Backend::Wgpu(WgpuBackend::new_headless()?)),
            BackendType::Software => {
                let mut backend = SoftwareBackend::new();
                TileStampKernel::register(&mut backend);
                Ok(Backend::Software(backend))
            }
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn GraphicsBackend {
        match self {
            Backend::Wgpu(b) => b,
            Backend::Software(b) => b,
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Wgpu(_) => BackendType::Wgpu,
            Backend::Software(_) => BackendType::Software,
        }
    }

    pub fn as_software(&self) -> Option<&SoftwareBackend> {
        match self {
            Backend::Software(b) => Some(b),
            _ => None,
        }
    }
}

/// Where a target or tile mesh comes from
#[derive(Debug, Clone)]
pub enum MeshSource {
    File(PathBuf),
    Data(MeshPartData),
}

/// Output stream sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    /// Room for every tile triangle in every cell the target owns
    #[default]
    WorstCase,
    Fixed { max_vertices: u32, max_indices: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: MeshSource,
    pub tile: MeshSource,
    pub capacity: CapacityPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: MeshSource::Data(resources::plane(4.0, 4.0, 4, 4.0)),
            tile: MeshSource::Data(resources::pyramid_tile(0.25)),
            capacity: CapacityPolicy::WorstCase,
        }
    }
}

/// Settings for one generation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameConfig {
    pub dispatch: DispatchConfig,
}

/// Outcome of one generation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub config: DispatchConfig,
    pub size: DispatchSize,
    pub generated: GeneratedGeometry,
    pub elapsed: Duration,
}

/// Output capacity needed to hold every tile triangle the target can request
pub fn worst_case_capacity(target: &TargetMesh, tile: &TileMesh) -> u64 {
    u64::from(target.total_tiles()) * u64::from(tile.num_triangles()) * 3
}

pub struct TilingSession {
    target: TargetMesh,
    tile: TileMesh,
    output: GpuMeshStream,
    dispatcher: TileDispatcher,
}

impl TilingSession {
    pub fn new(backend: &mut dyn GraphicsBackend, config: &SessionConfig) -> TilerResult<Self> {
        let target = match &config.target {
            MeshSource::File(path) => TargetMesh::load(backend, path)?,
            MeshSource::Data(part) => TargetMesh::from_part(backend, part)?,
        };
        let tile = match &config.tile {
            MeshSource::File(path) => TileMesh::load(backend, path),
            MeshSource::Data(part) => TileMesh::from_part(backend, part),
        };
        let tile = match tile {
            Ok(tile) => tile,
            Err(err) => {
                target.destroy(backend);
                return Err(err.into());
            }
        };

        let output = Self::capacity(backend, config.capacity, &target, &tile).and_then(|(max_vertices, max_indices)| {
            log::info!(
                "Target: {} triangles, {} tiles; tile: {} triangles; output capacity {} vertices, {} indices",
                target.num_triangles(),
                target.total_tiles(),
                tile.num_triangles(),
                max_vertices,
                max_indices
            );
            Ok(GpuMeshStream::allocate(backend, max_vertices, max_indices)?)
        });
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                target.destroy(backend);
                tile.destroy(backend);
                return Err(err);
            }
        };
        let dispatcher = TileDispatcher::new(backend);

        Ok(Self {
            target,
            tile,
            output,
            dispatcher,
        })
    }

    fn capacity(
        backend: &dyn GraphicsBackend,
        policy: CapacityPolicy,
        target: &TargetMesh,
        tile: &TileMesh,
    ) -> TilerResult<(u32, u32)> {
        let (vertices, indices) = match policy {
            CapacityPolicy::WorstCase => {
                let elements = worst_case_capacity(target, tile);
                (elements, elements)
            }
            CapacityPolicy::Fixed {
                max_vertices,
                max_indices,
            } => (u64::from(max_vertices), u64::from(max_indices)),
        };

        let max_binding = backend.limits().max_storage_buffer_binding_size;
        let vertex_limit = (max_binding.saturating_sub(STREAM_HEADER_SIZE)
            / std::mem::size_of::<OutputVertex>() as u64)
            .min(u64::from(u32::MAX));
        let index_limit = (max_binding.saturating_sub(STREAM_HEADER_SIZE) / 4).min(u64::from(u32::MAX));

        if vertices > vertex_limit {
            return Err(TilerError::Capacity {
                what: "output vertex",
                requested: vertices,
                limit: vertex_limit,
            });
        }
        if indices > index_limit {
            return Err(TilerError::Capacity {
                what: "output index",
                requested: indices,
                limit: index_limit,
            });
        }
        Ok((vertices as u32, indices as u32))
    }

    /// Reset the output stream, run one dispatch and read back what it produced
    pub fn generate(&mut self, backend: &mut dyn GraphicsBackend, frame: &FrameConfig) -> TilerResult<FrameReport> {
        let start = Instant::now();

        self.output.reset(backend);
        let size = self.dispatcher.dispatch(
            backend,
            &frame.dispatch,
            self.target.stream(),
            self.tile.streams(),
            &mut self.output,
        )?;
        let generated = self.output.generated(backend)?;

        let report = FrameReport {
            config: frame.dispatch,
            size,
            generated,
            elapsed: start.elapsed(),
        };
        log::debug!(
            "Generated {} triangles in {:.3} ms",
            generated.triangles(),
            report.elapsed.as_secs_f64() * 1000.0
        );
        Ok(report)
    }

    /// Draw the first `count` generated indices inside the caller's render pass
    pub fn draw(&self, backend: &mut dyn GraphicsBackend, count: u32) {
        self.output.draw(backend, count);
    }

    pub fn target(&self) -> &TargetMesh {
        &self.target
    }

    pub fn tile(&self) -> &TileMesh {
        &self.tile
    }

    pub fn output(&self) -> &GpuMeshStream {
        &self.output
    }

    pub fn dispatcher(&self) -> &TileDispatcher {
        &self.dispatcher
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        self.target.destroy(backend);
        self.tile.destroy(backend);
        self.output.destroy(backend);
    }
}
