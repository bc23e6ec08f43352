//! Renderable meshes and procedural mesh data

use crate::backend::types::Vertex;
use crate::backend::{
    BackendError, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
};
use crate::loader::{LoadError, LoadOptions, LoadReport, LoadedMesh, MeshLoader, MeshPartData};
use glam::{Vec2, Vec3};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One material's geometry, resident on the device
#[derive(Debug)]
pub struct MeshPart {
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
    element_count: u32,
    material: Option<String>,
    diffuse_texture: Option<PathBuf>,
}

impl MeshPart {
    fn upload(backend: &mut dyn GraphicsBackend, data: &MeshPartData) -> Result<Self, BackendError> {
        let element_count = u32::try_from(data.indices.len()).map_err(|_| {
            BackendError::BufferCreationFailed(format!(
                "{} indices exceed 32-bit draw range",
                data.indices.len()
            ))
        })?;

        let mut part = Self {
            vertex_buffer: None,
            index_buffer: None,
            element_count,
            material: data.material.clone(),
            diffuse_texture: data.diffuse_texture.clone(),
        };
        // Empty parts keep their slot but own no buffers
        if data.is_empty() {
            return Ok(part);
        }

        let vertex_data: &[u8] = bytemuck::cast_slice(&data.vertices);
        part.vertex_buffer = Some(backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("Mesh Vertices ({})", part.label())),
                size: vertex_data.len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            vertex_data,
        )?);

        let index_data: &[u8] = bytemuck::cast_slice(&data.indices);
        part.index_buffer = Some(backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("Mesh Indices ({})", part.label())),
                size: index_data.len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            index_data,
        )?);

        Ok(part)
    }

    fn label(&self) -> &str {
        self.material.as_deref().unwrap_or("no material")
    }

    /// Record an indexed draw of the whole part. Empty parts draw nothing.
    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        let (Some(vertex_buffer), Some(index_buffer)) = (self.vertex_buffer, self.index_buffer) else {
            return;
        };
        if self.element_count == 0 {
            return;
        }
        backend.set_vertex_buffer(0, vertex_buffer, 0);
        backend.set_index_buffer(index_buffer, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..self.element_count, 0, 0..1);
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn material(&self) -> Option<&str> {
        self.material.as_deref()
    }

    /// Diffuse texture for the external texture loader, relative paths already resolved
    pub fn diffuse_texture(&self) -> Option<&Path> {
        self.diffuse_texture.as_deref()
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.vertex_buffer {
            backend.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.index_buffer {
            backend.destroy_buffer(buffer);
        }
    }
}

/// A drawable mesh: part 0 holds faces without a material, then one part per material
#[derive(Debug)]
pub struct Mesh {
    parts: Vec<MeshPart>,
    report: LoadReport,
}

impl Mesh {
    /// Load with materials honored
    pub fn load(backend: &mut dyn GraphicsBackend, path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let loaded = MeshLoader::new(LoadOptions::default()).load(path)?;
        Ok(Self::from_loaded(backend, loaded)?)
    }

    pub fn from_loaded(backend: &mut dyn GraphicsBackend, loaded: LoadedMesh) -> Result<Self, BackendError> {
        let mut parts = Vec::with_capacity(loaded.parts.len());
        for data in &loaded.parts {
            match MeshPart::upload(backend, data) {
                Ok(part) => parts.push(part),
                Err(err) => {
                    for part in parts {
                        part.destroy(backend);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            parts,
            report: loaded.report,
        })
    }

    /// Draw every non-empty part. The caller sets a pipeline using [`Vertex::layout`].
    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        for part in &self.parts {
            part.draw(backend);
        }
    }

    pub fn parts(&self) -> &[MeshPart] {
        &self.parts
    }

    pub fn total_elements(&self) -> u64 {
        self.parts.iter().map(|p| u64::from(p.element_count)).sum()
    }

    pub fn texture_paths(&self) -> impl Iterator<Item = &Path> {
        self.parts.iter().filter_map(MeshPart::diffuse_texture)
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for part in self.parts {
            part.destroy(backend);
        }
    }
}

/// Flat grid in the XZ plane, facing +Y, with UVs running `0..uv_scale` across it
pub fn plane(width: f32, depth: f32, subdivisions: u32, uv_scale: f32) -> MeshPartData {
    let subdivisions = subdivisions.max(1);
    let half_width = width / 2.0;
    let half_depth = depth / 2.0;
    let step = 1.0 / subdivisions as f32;

    let mut part = MeshPartData::default();
    for z in 0..=subdivisions {
        for x in 0..=subdivisions {
            let (fx, fz) = (x as f32 * step, z as f32 * step);
            part.vertices.push(Vertex::new(
                Vec3::new(-half_width + fx * width, 0.0, -half_depth + fz * depth),
                Vec3::Y,
                Vec2::new(fx, fz) * uv_scale,
            ));
        }
    }

    for z in 0..subdivisions {
        for x in 0..subdivisions {
            let current = z * (subdivisions + 1) + x;
            let next = current + subdivisions + 1;
            part.indices
                .extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
        }
    }
    part
}

/// Square pyramid filling one tile cell: base on `y = 0`, apex at `height`
pub fn pyramid_tile(height: f32) -> MeshPartData {
    let apex = Vec3::new(0.5, height, 0.5);
    let base = [
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, 1.0),
        Vec3::new(1.0, 0.0, 1.0),
        Vec3::new(1.0, 0.0, 0.0),
    ];

    let mut part = MeshPartData::default();
    for i in 0..4 {
        let (a, b) = (base[i], base[(i + 1) % 4]);
        let normal = (b - a).cross(apex - a).normalize_or_zero();
        let first = part.vertices.len() as u32;
        for p in [a, b, apex] {
            part.vertices.push(Vertex::new(p, normal, Vec2::new(p.x, p.z)));
        }
        part.indices.extend_from_slice(&[first, first + 1, first + 2]);
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ColorAttachment, LoadOp, RenderPassDescriptor, SoftwareBackend, StoreOp, TextureDescriptor,
    };

    const TWO_MATERIALS: &str = "\
mtllib colors.mtl
v 0 0 0
v 1 0 0
v 0 0 1
v 1 0 1
usemtl red
f 1 3 2
usemtl blue
f 2 3 4
f 1 3 2
";

    #[test]
    fn test_plane_faces_up() {
        let part = plane(2.0, 2.0, 2, 4.0);
        assert_eq!(part.vertices.len(), 9);
        assert_eq!(part.triangle_count(), 8);
        assert_eq!(part.vertices[8].uv, Vec2::new(4.0, 4.0));

        let [a, b, c] = part.triangle(0);
        let n = (b.position - a.position).cross(c.position - a.position);
        assert!(n.y > 0.0);
    }

    #[test]
    fn test_pyramid_normals_point_outward() {
        let part = pyramid_tile(1.0);
        assert_eq!(part.triangle_count(), 4);
        for v in &part.vertices {
            let outward = Vec3::new(v.position.x - 0.5, 0.0, v.position.z - 0.5);
            if outward.length_squared() > 0.0 {
                assert!(v.normal.dot(outward) > 0.0);
            }
            assert!(v.normal.y > 0.0);
        }
    }

    #[test]
    fn test_material_parts_draw_and_skip_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("quads.obj"), TWO_MATERIALS).unwrap();
        std::fs::write(
            dir.path().join("colors.mtl"),
            "newmtl red\nmap_Kd red.png\nnewmtl blue\n",
        )
        .unwrap();

        let mut backend = SoftwareBackend::new();
        let mesh = Mesh::load(&mut backend, dir.path().join("quads.obj")).unwrap();

        // Unmaterialed bucket plus red and blue
        assert_eq!(mesh.parts().len(), 3);
        assert!(mesh.parts()[0].is_empty());
        assert_eq!(mesh.parts()[1].material(), Some("red"));
        assert_eq!(mesh.total_elements(), 9);
        let textures: Vec<&Path> = mesh.texture_paths().collect();
        assert_eq!(textures, vec![dir.path().join("red.png").as_path()]);

        let texture = backend.create_texture(&TextureDescriptor::default()).unwrap();
        let view = backend.create_texture_view(texture).unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment {
                view,
                load_op: LoadOp::Clear([0.0; 4]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        mesh.draw(&mut backend);
        backend.end_render_pass();

        let counts: Vec<u32> = backend.draw_calls().iter().map(|d| d.indices.end).collect();
        assert_eq!(counts, vec![3, 6]);
        assert!(backend.failures().is_empty());

        mesh.destroy(&mut backend);
        assert_eq!(backend.buffer_count(), 0);
    }
}
