//! Tile mesh streams
//!
//! The tile is uploaded as-is: one storage buffer of vertices and one of
//! triangle-list indices. Tile space is the unit cell: `x` and `z` in
//! `[0, 1]` map across a UV cell and `y` is height above the surface.

use super::StreamError;
use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, StorageAccess, Vertex,
};
use crate::loader::{LoadOptions, LoadReport, MeshLoader, MeshPartData};
use bytemuck::{Pod, Zeroable};
use std::path::Path;

/// Tile vertex as read by the kernel (WGSL `TileVertex`, 32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TileVertex {
    pub position: [f32; 3],
    pub _padding0: f32,
    pub normal: [f32; 3],
    pub _padding1: f32,
}

impl From<&Vertex> for TileVertex {
    fn from(v: &Vertex) -> Self {
        Self {
            position: v.position.to_array(),
            _padding0: 0.0,
            normal: v.normal.to_array(),
            _padding1: 0.0,
        }
    }
}

/// Vertex and index storage buffers of the tile mesh
#[derive(Debug)]
pub struct TileGeometryStreams {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    vertex_count: u32,
    index_count: u32,
}

impl TileGeometryStreams {
    pub fn from_part(backend: &mut dyn GraphicsBackend, part: &MeshPartData) -> Result<Self, StreamError> {
        let too_large = |what: &'static str, count: usize| StreamError::TooLarge { what, count };
        let vertex_count =
            u32::try_from(part.vertices.len()).map_err(|_| too_large("tile vertices", part.vertices.len()))?;
        let index_count =
            u32::try_from(part.indices.len()).map_err(|_| too_large("tile indices", part.indices.len()))?;

        let mut vertices: Vec<TileVertex> = part.vertices.iter().map(TileVertex::from).collect();
        if vertices.is_empty() {
            vertices.push(TileVertex::zeroed());
        }
        let indices: &[u32] = if part.indices.is_empty() { &[0] } else { &part.indices };

        let vertex_data: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Tile Vertices".into()),
                size: vertex_data.len() as u64,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            },
            vertex_data,
        )?;

        let index_data: &[u8] = bytemuck::cast_slice(indices);
        let index_buffer = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Tile Indices".into()),
                size: index_data.len() as u64,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            },
            index_data,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_buffer(vertex_buffer);
                return Err(err.into());
            }
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
        })
    }

    /// Bind vertices and indices to two storage binding points
    pub fn bind(&self, backend: &mut dyn GraphicsBackend, vertex_binding: u32, index_binding: u32) {
        backend.bind_storage_buffer(vertex_binding, self.vertex_buffer, StorageAccess::ReadOnly);
        backend.bind_storage_buffer(index_binding, self.index_buffer, StorageAccess::ReadOnly);
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}

/// The tile mesh stamped onto target triangles
#[derive(Debug)]
pub struct TileMesh {
    streams: TileGeometryStreams,
    report: LoadReport,
}

impl TileMesh {
    /// Load a single-part mesh and upload it
    pub fn load(backend: &mut dyn GraphicsBackend, path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let mesh = MeshLoader::new(LoadOptions::geometry_only()).load(path)?;
        let report = mesh.report;
        let part = mesh.into_single_part()?;
        Ok(Self {
            streams: TileGeometryStreams::from_part(backend, &part)?,
            report,
        })
    }

    pub fn from_part(backend: &mut dyn GraphicsBackend, part: &MeshPartData) -> Result<Self, StreamError> {
        Ok(Self {
            streams: TileGeometryStreams::from_part(backend, part)?,
            report: LoadReport::default(),
        })
    }

    pub fn num_vertices(&self) -> u32 {
        self.streams.vertex_count()
    }

    pub fn num_indices(&self) -> u32 {
        self.streams.index_count()
    }

    /// Triangles stamped per tile cell
    pub fn num_triangles(&self) -> u32 {
        self.streams.index_count() / 3
    }

    pub fn bind_geometry_streams(
        &self,
        backend: &mut dyn GraphicsBackend,
        vertex_binding: u32,
        index_binding: u32,
    ) {
        self.streams.bind(backend, vertex_binding, index_binding);
    }

    pub fn streams(&self) -> &TileGeometryStreams {
        &self.streams
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        self.streams.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SoftwareBackend, SoftwareCommand};
    use glam::{Vec2, Vec3};

    fn blade() -> MeshPartData {
        MeshPartData {
            vertices: vec![
                Vertex::new(Vec3::new(0.2, 0.0, 0.5), Vec3::X, Vec2::ZERO),
                Vertex::new(Vec3::new(0.8, 0.0, 0.5), Vec3::X, Vec2::ZERO),
                Vertex::new(Vec3::new(0.5, 1.0, 0.5), Vec3::X, Vec2::ZERO),
            ],
            indices: vec![0, 1, 2],
            ..Default::default()
        }
    }

    #[test]
    fn test_uploads_verbatim() {
        let mut backend = SoftwareBackend::new();
        let tile = TileMesh::from_part(&mut backend, &blade()).unwrap();
        assert_eq!((tile.num_vertices(), tile.num_indices(), tile.num_triangles()), (3, 3, 1));

        let bytes = backend.read_buffer(tile.streams().vertex_buffer(), 32, 32).unwrap();
        let second: TileVertex = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(second.position, [0.8, 0.0, 0.5]);
        assert_eq!(second.normal, [1.0, 0.0, 0.0]);

        let bytes = backend.read_buffer(tile.streams().index_buffer(), 0, 12).unwrap();
        let indices: Vec<u32> = bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_bind_uses_requested_slots() {
        let mut backend = SoftwareBackend::new();
        let tile = TileMesh::from_part(&mut backend, &blade()).unwrap();
        tile.bind_geometry_streams(&mut backend, 1, 2);

        assert_eq!(backend.bound_storage(1), Some(tile.streams().vertex_buffer()));
        assert_eq!(backend.bound_storage(2), Some(tile.streams().index_buffer()));
        assert!(backend
            .commands()
            .iter()
            .all(|c| !matches!(c, SoftwareCommand::BindStorage { access: StorageAccess::ReadWrite, .. })));
    }

    #[test]
    fn test_failed_index_upload_releases_vertices() {
        let mut backend = SoftwareBackend::new().with_buffer_budget(1);
        let result = TileMesh::from_part(&mut backend, &blade());
        assert!(matches!(result, Err(StreamError::Backend(_))));
        assert_eq!(backend.buffer_count(), 0);
    }

    #[test]
    fn test_vertex_layout_size() {
        assert_eq!(std::mem::size_of::<TileVertex>(), 32);
    }
}
