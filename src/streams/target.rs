//! Target surface descriptors
//!
//! Every target triangle becomes a [`TargetTriangle`] record: its corner
//! positions, a flat normal, per-vertex normals, a UV → barycentric map and
//! the range of tile cells it covers. Cells are `UV_PER_TILE` wide and
//! aligned to multiples of it; a triangle owns every cell its UV bounding
//! box overlaps, and ranges are assigned back to back in triangle order.

use super::StreamError;
use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, StorageAccess, Vertex,
};
use crate::loader::{LoadOptions, LoadReport, MeshLoader, MeshPartData};
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Vec2, Vec3};
use std::path::Path;

/// UV extent of one tile cell
pub const UV_PER_TILE: f32 = 1.0;

/// Per-triangle record read by the tiling kernel.
///
/// Layout matches `TargetTriangle` in the WGSL kernel (std430 rules, 176 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TargetTriangle {
    pub p0: [f32; 3],
    pub tile_base: u32,
    pub p1: [f32; 3],
    pub tile_count: u32,
    pub p2: [f32; 3],
    pub tile_columns: u32,
    pub normal: [f32; 3],
    pub _padding0: u32,
    /// Per-vertex normals, w unused
    pub vertex_normals: [[f32; 4]; 3],
    /// Rows of the UV to barycentric map: `bary[i] = dot(rows[i].xyz, (u, v, 1))`
    pub uv_to_bary: [[f32; 4]; 3],
    /// UV of the lower corner of the first tile cell
    pub tile_origin: [f32; 2],
    pub _padding1: [f32; 2],
}

/// Tile cells overlapped by a triangle's UV bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSpan {
    pub origin: Vec2,
    pub columns: u32,
    pub rows: u32,
}

impl TileSpan {
    pub fn from_uvs(uvs: &[Vec2; 3]) -> Self {
        let min = uvs[0].min(uvs[1]).min(uvs[2]);
        let max = uvs[0].max(uvs[1]).max(uvs[2]);
        if !(min.is_finite() && max.is_finite()) {
            return Self {
                origin: Vec2::ZERO,
                columns: 1,
                rows: 1,
            };
        }

        let lo = (min / UV_PER_TILE).floor();
        let hi = (max / UV_PER_TILE).ceil();
        // Degenerate boxes on a cell boundary still get one cell
        Self {
            origin: lo * UV_PER_TILE,
            columns: ((hi.x - lo.x) as u32).max(1),
            rows: ((hi.y - lo.y) as u32).max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.columns.saturating_mul(self.rows)
    }
}

/// Inverse of the matrix with columns `(u_i, v_i, 1)`.
///
/// Triangles with collapsed UVs map every UV to the centroid.
fn uv_to_barycentric(uvs: &[Vec2; 3]) -> Mat3 {
    let basis = Mat3::from_cols(uvs[0].extend(1.0), uvs[1].extend(1.0), uvs[2].extend(1.0));
    let det = basis.determinant();
    if !det.is_finite() || det.abs() <= 1e-12 {
        return Mat3::from_cols(Vec3::ZERO, Vec3::ZERO, Vec3::splat(1.0 / 3.0));
    }
    basis.inverse()
}

impl TargetTriangle {
    pub fn new(corners: [&Vertex; 3], tile_base: u32, span: TileSpan) -> Self {
        let [a, b, c] = corners;
        let uvs = [a.uv, b.uv, c.uv];
        let to_bary = uv_to_barycentric(&uvs);
        let normal = (b.position - a.position)
            .cross(c.position - a.position)
            .normalize_or_zero();

        Self {
            p0: a.position.to_array(),
            tile_base,
            p1: b.position.to_array(),
            tile_count: span.count(),
            p2: c.position.to_array(),
            tile_columns: span.columns,
            normal: normal.to_array(),
            _padding0: 0,
            vertex_normals: [
                a.normal.extend(0.0).to_array(),
                b.normal.extend(0.0).to_array(),
                c.normal.extend(0.0).to_array(),
            ],
            uv_to_bary: [
                to_bary.row(0).extend(0.0).to_array(),
                to_bary.row(1).extend(0.0).to_array(),
                to_bary.row(2).extend(0.0).to_array(),
            ],
            tile_origin: span.origin.to_array(),
            _padding1: [0.0; 2],
        }
    }

    /// Barycentric coordinates of a UV point
    pub fn barycentric(&self, uv: Vec2) -> Vec3 {
        let p = uv.extend(1.0);
        let row = |i: usize| Vec3::from_slice(&self.uv_to_bary[i][..3]);
        Vec3::new(row(0).dot(p), row(1).dot(p), row(2).dot(p))
    }

    pub fn corners(&self) -> [Vec3; 3] {
        [
            Vec3::from_array(self.p0),
            Vec3::from_array(self.p1),
            Vec3::from_array(self.p2),
        ]
    }

    /// Range of tile slots owned by this triangle
    pub fn tile_range(&self) -> std::ops::Range<u32> {
        self.tile_base..self.tile_base + self.tile_count
    }
}

/// Build descriptors for every triangle of `part`; returns them with the total tile count
pub fn build_target_triangles(part: &MeshPartData) -> Result<(Vec<TargetTriangle>, u32), StreamError> {
    let mut triangles = Vec::with_capacity(part.triangle_count());
    let mut next_base: u32 = 0;

    for t in 0..part.triangle_count() {
        let corners = part.triangle(t);
        let span = TileSpan::from_uvs(&[corners[0].uv, corners[1].uv, corners[2].uv]);
        let triangle = TargetTriangle::new(corners, next_base, span);
        next_base = next_base
            .checked_add(triangle.tile_count)
            .ok_or(StreamError::TileBudgetOverflow { triangle: t })?;
        triangles.push(triangle);
    }

    Ok((triangles, next_base))
}

/// Target descriptors resident in a storage buffer
#[derive(Debug)]
pub struct TargetGeometryStream {
    buffer: BufferHandle,
    triangle_count: u32,
    total_tiles: u32,
}

impl TargetGeometryStream {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        triangles: &[TargetTriangle],
        total_tiles: u32,
    ) -> Result<Self, StreamError> {
        let triangle_count = u32::try_from(triangles.len()).map_err(|_| StreamError::TooLarge {
            what: "target mesh",
            count: triangles.len(),
        })?;

        // Zero-sized storage bindings are invalid; keep one blank record
        let blank = [TargetTriangle::zeroed()];
        let records = if triangles.is_empty() { &blank[..] } else { triangles };
        let data: &[u8] = bytemuck::cast_slice(records);

        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("Target Triangles".into()),
                size: data.len() as u64,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            },
            data,
        )?;

        Ok(Self {
            buffer,
            triangle_count,
            total_tiles,
        })
    }

    pub fn from_part(backend: &mut dyn GraphicsBackend, part: &MeshPartData) -> Result<Self, StreamError> {
        let (triangles, total_tiles) = build_target_triangles(part)?;
        log::debug!(
            "Target stream: {} triangles, {} tiles",
            triangles.len(),
            total_tiles
        );
        Self::new(backend, &triangles, total_tiles)
    }

    pub fn bind(&self, backend: &mut dyn GraphicsBackend, binding: u32) {
        backend.bind_storage_buffer(binding, self.buffer, StorageAccess::ReadOnly);
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn total_tiles(&self) -> u32 {
        self.total_tiles
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// A target surface loaded from disk
#[derive(Debug)]
pub struct TargetMesh {
    stream: TargetGeometryStream,
    report: LoadReport,
}

impl TargetMesh {
    /// Load a single-part mesh and upload its descriptors
    pub fn load(backend: &mut dyn GraphicsBackend, path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let mesh = MeshLoader::new(LoadOptions::geometry_only()).load(path)?;
        let report = mesh.report;
        let part = mesh.into_single_part()?;
        Ok(Self {
            stream: TargetGeometryStream::from_part(backend, &part)?,
            report,
        })
    }

    pub fn from_part(backend: &mut dyn GraphicsBackend, part: &MeshPartData) -> Result<Self, StreamError> {
        Ok(Self {
            stream: TargetGeometryStream::from_part(backend, part)?,
            report: LoadReport::default(),
        })
    }

    pub fn num_triangles(&self) -> u32 {
        self.stream.triangle_count()
    }

    pub fn total_tiles(&self) -> u32 {
        self.stream.total_tiles()
    }

    pub fn stream(&self) -> &TargetGeometryStream {
        &self.stream
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        self.stream.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    fn vertex(p: [f32; 3], uv: [f32; 2]) -> Vertex {
        Vertex::new(Vec3::from_array(p), Vec3::Z, Vec2::from_array(uv))
    }

    fn part(vertices: Vec<Vertex>, indices: Vec<u32>) -> MeshPartData {
        MeshPartData {
            vertices,
            indices,
            ..Default::default()
        }
    }

    #[test]
    fn test_layout_size() {
        assert_eq!(std::mem::size_of::<TargetTriangle>(), 176);
        assert_eq!(std::mem::size_of::<TargetTriangle>() % 16, 0);
    }

    #[test]
    fn test_span_counts_overlapped_cells() {
        let span = TileSpan::from_uvs(&[Vec2::new(0.0, 0.0), Vec2::new(2.0, 0.0), Vec2::new(0.0, 1.0)]);
        assert_eq!((span.columns, span.rows, span.count()), (2, 1, 2));

        let span = TileSpan::from_uvs(&[Vec2::new(-0.5, 0.2), Vec2::new(0.5, 0.2), Vec2::new(0.0, 1.7)]);
        assert_eq!(span.origin, Vec2::new(-1.0, 0.0));
        assert_eq!((span.columns, span.rows), (2, 2));
    }

    #[test]
    fn test_degenerate_span_is_one_cell() {
        let point = [Vec2::new(3.0, 3.0); 3];
        assert_eq!(TileSpan::from_uvs(&point).count(), 1);

        let nan = [Vec2::new(f32::NAN, 0.0), Vec2::ZERO, Vec2::ONE];
        assert_eq!(TileSpan::from_uvs(&nan).count(), 1);
    }

    #[test]
    fn test_barycentric_map_hits_corners() {
        let a = vertex([0.0, 0.0, 0.0], [0.0, 0.0]);
        let b = vertex([4.0, 0.0, 0.0], [2.0, 0.0]);
        let c = vertex([0.0, 4.0, 0.0], [0.0, 2.0]);
        let span = TileSpan::from_uvs(&[a.uv, b.uv, c.uv]);
        let tri = TargetTriangle::new([&a, &b, &c], 0, span);

        assert!(tri.barycentric(a.uv).abs_diff_eq(Vec3::X, 1e-5));
        assert!(tri.barycentric(b.uv).abs_diff_eq(Vec3::Y, 1e-5));
        assert!(tri.barycentric(c.uv).abs_diff_eq(Vec3::Z, 1e-5));
        let centroid = tri.barycentric(Vec2::new(2.0 / 3.0, 2.0 / 3.0));
        assert!(centroid.abs_diff_eq(Vec3::splat(1.0 / 3.0), 1e-5));
        assert_eq!(tri.normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_collapsed_uvs_map_to_centroid() {
        let a = vertex([0.0, 0.0, 0.0], [0.5, 0.5]);
        let b = vertex([1.0, 0.0, 0.0], [0.5, 0.5]);
        let c = vertex([0.0, 1.0, 0.0], [0.5, 0.5]);
        let tri = TargetTriangle::new([&a, &b, &c], 0, TileSpan::from_uvs(&[a.uv; 3]));
        assert!(tri.barycentric(Vec2::new(7.0, -2.0)).abs_diff_eq(Vec3::splat(1.0 / 3.0), 1e-6));
        assert_eq!(tri.tile_count, 1);
    }

    #[test]
    fn test_tile_ranges_are_contiguous() {
        let vertices = vec![
            vertex([0.0, 0.0, 0.0], [0.0, 0.0]),
            vertex([1.0, 0.0, 0.0], [3.0, 0.0]),
            vertex([0.0, 1.0, 0.0], [0.0, 2.0]),
            vertex([1.0, 1.0, 0.0], [0.2, 0.2]),
        ];
        let (triangles, total) = build_target_triangles(&part(vertices, vec![0, 1, 2, 3, 3, 3, 1, 2, 3])).unwrap();

        assert_eq!(triangles.len(), 3);
        assert_eq!(triangles[0].tile_range(), 0..6);
        for pair in triangles.windows(2) {
            assert_eq!(pair[1].tile_base, pair[0].tile_base + pair[0].tile_count);
        }
        assert_eq!(total, triangles.iter().map(|t| t.tile_count).sum::<u32>());
        // degenerate triangle in the middle still owns one cell
        assert_eq!(triangles[1].tile_count, 1);
    }

    #[test]
    fn test_stream_uploads_descriptors() {
        let mut backend = SoftwareBackend::new();
        let vertices = vec![
            vertex([0.0, 0.0, 0.0], [0.0, 0.0]),
            vertex([1.0, 0.0, 0.0], [1.0, 0.0]),
            vertex([0.0, 1.0, 0.0], [0.0, 1.0]),
        ];
        let target = TargetMesh::from_part(&mut backend, &part(vertices, vec![0, 1, 2])).unwrap();
        assert_eq!(target.num_triangles(), 1);
        assert_eq!(target.total_tiles(), 1);

        let bytes = backend
            .read_buffer(target.stream().buffer(), 0, std::mem::size_of::<TargetTriangle>() as u64)
            .unwrap();
        let uploaded: TargetTriangle = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(uploaded.p1, [1.0, 0.0, 0.0]);
        assert_eq!(uploaded.tile_range(), 0..1);
    }

    #[test]
    fn test_empty_target_keeps_a_bindable_buffer() {
        let mut backend = SoftwareBackend::new();
        let target = TargetMesh::from_part(&mut backend, &MeshPartData::default()).unwrap();
        assert_eq!(target.num_triangles(), 0);
        assert_eq!(
            backend.buffer_contents(target.stream().buffer()).map(<[u8]>::len),
            Some(std::mem::size_of::<TargetTriangle>())
        );
        target.destroy(&mut backend);
        assert_eq!(backend.buffer_count(), 0);
    }
}
