//! Triangulated mesh loading
//!
//! Reads OBJ files into per-material parts of deduplicated vertices and
//! 32-bit triangle indices. Part 0 collects faces without a known material;
//! part `i + 1` collects faces of library material `i`. With
//! [`MaterialMode::Ignore`] every face lands in part 0.

pub mod obj;

use crate::backend::Vertex;
use glam::{Vec2, Vec3};
use obj::{IndexTriple, ObjData, ObjMaterial};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: {kind} index {index} out of range ({count} defined)")]
    IndexOutOfRange {
        line: usize,
        kind: &'static str,
        index: i64,
        count: usize,
    },
    #[error("part {part} needs more than {limit} vertices; 32-bit indices exhausted")]
    IndexOverflow { part: usize, limit: u32 },
    #[error("mesh has {parts} parts with geometry, exactly one is required")]
    MultipleParts { parts: usize },
}

/// Whether `usemtl` statements split the mesh into parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialMode {
    #[default]
    Honor,
    Ignore,
}

/// Loader configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub materials: MaterialMode,
    /// Number of distinct vertices a part may hold; the full 32-bit range by default
    pub index_limit: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            materials: MaterialMode::Honor,
            index_limit: u32::MAX,
        }
    }
}

impl LoadOptions {
    /// Options for meshes consumed as raw geometry (target and tile meshes)
    pub fn geometry_only() -> Self {
        Self {
            materials: MaterialMode::Ignore,
            ..Self::default()
        }
    }
}

/// One material part: deduplicated vertices and triangle-list indices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshPartData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material: Option<String>,
    /// Diffuse texture, resolved against the mesh file's directory. Never opened here.
    pub diffuse_texture: Option<PathBuf>,
}

impl MeshPartData {
    pub fn element_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Corner positions of triangle `t`
    pub fn triangle(&self, t: usize) -> [&Vertex; 3] {
        let i = &self.indices[t * 3..t * 3 + 3];
        [
            &self.vertices[i[0] as usize],
            &self.vertices[i[1] as usize],
            &self.vertices[i[2] as usize],
        ]
    }
}

/// Recoverable issues encountered while loading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Faces that were not triangles
    pub skipped_faces: usize,
    /// Corners without a normal index
    pub missing_normals: usize,
    /// Corners without a texcoord index
    pub missing_uvs: usize,
    /// Faces whose `usemtl` named no library material
    pub unknown_materials: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedMesh {
    pub parts: Vec<MeshPartData>,
    pub report: LoadReport,
}

impl LoadedMesh {
    pub fn total_elements(&self) -> usize {
        self.parts.iter().map(MeshPartData::element_count).sum()
    }

    /// Reduce to the single part holding geometry.
    ///
    /// Empty parts are ignored; a mesh with no geometry yields its (empty) part 0.
    pub fn into_single_part(mut self) -> Result<MeshPartData, LoadError> {
        let filled: Vec<usize> = self
            .parts
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_empty())
            .map(|(i, _)| i)
            .collect();

        match filled.as_slice() {
            [] if !self.parts.is_empty() => Ok(self.parts.swap_remove(0)),
            [] => Ok(MeshPartData::default()),
            [only] => Ok(self.parts.swap_remove(*only)),
            _ => Err(LoadError::MultipleParts {
                parts: filled.len(),
            }),
        }
    }
}

struct PartBuilder {
    part: MeshPartData,
    cache: HashMap<IndexTriple, u32>,
}

impl PartBuilder {
    fn new(material: Option<&ObjMaterial>, base_dir: Option<&Path>) -> Self {
        let diffuse_texture = material
            .and_then(|m| m.diffuse_texture.as_deref())
            .map(|tex| match base_dir {
                Some(dir) => dir.join(tex),
                None => PathBuf::from(tex),
            });
        Self {
            part: MeshPartData {
                material: material.map(|m| m.name.clone()),
                diffuse_texture,
                ..Default::default()
            },
            cache: HashMap::new(),
        }
    }
}

/// Loads OBJ meshes into material parts
#[derive(Debug, Clone, Default)]
pub struct MeshLoader {
    options: LoadOptions,
}

impl MeshLoader {
    pub fn new(options: LoadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Load a mesh file. Material libraries and texture paths resolve against its directory.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadedMesh, LoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mesh = self.load_from_str(&source, path.parent())?;
        log::info!(
            "Loaded {}: {} parts, {} elements",
            path.display(),
            mesh.parts.len(),
            mesh.total_elements()
        );
        Ok(mesh)
    }

    /// Load from OBJ text. Without `base_dir`, `mtllib` statements are not followed.
    pub fn load_from_str(&self, source: &str, base_dir: Option<&Path>) -> Result<LoadedMesh, LoadError> {
        let data = obj::parse_obj(source)?;

        let library = match (self.options.materials, base_dir) {
            (MaterialMode::Honor, Some(dir)) => Self::read_libraries(&data, dir),
            _ => Vec::new(),
        };

        self.build(&data, &library, base_dir)
    }

    /// Read every referenced material library; missing ones are reported and skipped
    fn read_libraries(data: &ObjData, dir: &Path) -> Vec<ObjMaterial> {
        let mut materials = Vec::new();
        for lib in &data.material_libraries {
            let lib_path = dir.join(lib);
            match std::fs::read_to_string(&lib_path) {
                Ok(text) => materials.extend(obj::parse_mtl(&text)),
                Err(err) => log::warn!("Material library {} unavailable: {}", lib_path.display(), err),
            }
        }
        materials
    }

    fn build(
        &self,
        data: &ObjData,
        library: &[ObjMaterial],
        base_dir: Option<&Path>,
    ) -> Result<LoadedMesh, LoadError> {
        let mut report = LoadReport::default();

        let mut builders = vec![PartBuilder::new(None, base_dir)];
        if self.options.materials == MaterialMode::Honor {
            builders.extend(library.iter().map(|m| PartBuilder::new(Some(m), base_dir)));
        }

        // usemtl slot -> part index
        let part_of_ref: Vec<usize> = data
            .material_refs
            .iter()
            .map(|name| match self.options.materials {
                MaterialMode::Ignore => 0,
                MaterialMode::Honor => library
                    .iter()
                    .position(|m| m.name == *name)
                    .map_or(0, |i| i + 1),
            })
            .collect();

        for face in &data.faces {
            if face.corners.len() != 3 {
                log::warn!(
                    "line {}: skipping face with {} vertices, only triangles are supported",
                    face.line,
                    face.corners.len()
                );
                report.skipped_faces += 1;
                continue;
            }

            let part_index = match face.material {
                Some(slot) => {
                    let part = part_of_ref[slot];
                    if part == 0 && self.options.materials == MaterialMode::Honor {
                        report.unknown_materials += 1;
                    }
                    part
                }
                None => 0,
            };

            let builder = &mut builders[part_index];
            for corner in &face.corners {
                let index = match builder.cache.get(corner) {
                    Some(&index) => index,
                    None => {
                        let vertex = Self::make_vertex(data, corner, face.line, &mut report)?;
                        let next = builder.part.vertices.len();
                        let index = u32::try_from(next)
                            .ok()
                            .filter(|i| *i < self.options.index_limit)
                            .ok_or(LoadError::IndexOverflow {
                                part: part_index,
                                limit: self.options.index_limit,
                            })?;
                        builder.part.vertices.push(vertex);
                        builder.cache.insert(*corner, index);
                        index
                    }
                };
                builder.part.indices.push(index);
            }
        }

        if report.skipped_faces > 0 {
            log::warn!("Skipped {} non-triangle faces", report.skipped_faces);
        }
        if report.missing_normals > 0 {
            log::warn!("{} face corners have no normal; using zero", report.missing_normals);
        }
        if report.missing_uvs > 0 {
            log::warn!("{} face corners have no texcoord; using zero", report.missing_uvs);
        }
        if report.unknown_materials > 0 {
            log::warn!(
                "{} faces reference unknown materials; placed in part 0",
                report.unknown_materials
            );
        }

        Ok(LoadedMesh {
            parts: builders.into_iter().map(|b| b.part).collect(),
            report,
        })
    }

    fn make_vertex(
        data: &ObjData,
        corner: &IndexTriple,
        line: usize,
        report: &mut LoadReport,
    ) -> Result<Vertex, LoadError> {
        fn fetch<T: Copy>(items: &[T], index: u32, line: usize, kind: &'static str) -> Result<T, LoadError> {
            items
                .get(index as usize)
                .copied()
                .ok_or(LoadError::IndexOutOfRange {
                    line,
                    kind,
                    index: i64::from(index) + 1,
                    count: items.len(),
                })
        }

        let position = fetch(&data.positions, corner.position, line, "position")?;
        let normal = match corner.normal {
            Some(i) => fetch(&data.normals, i, line, "normal")?,
            None => {
                report.missing_normals += 1;
                Vec3::ZERO
            }
        };
        let uv = match corner.uv {
            Some(i) => fetch(&data.texcoords, i, line, "texcoord")?,
            None => {
                report.missing_uvs += 1;
                Vec2::ZERO
            }
        };
        Ok(Vertex::new(position, normal, uv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const QUAD: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1
f 1/1/1 3/3/1 4/4/1
";

    #[test]
    fn test_shared_corners_are_deduplicated() {
        let mesh = MeshLoader::default().load_from_str(QUAD, None).unwrap();
        let part = &mesh.parts[0];
        assert_eq!(part.vertices.len(), 4);
        assert_eq!(part.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(part.vertices[2].uv, Vec2::new(1.0, 1.0));
        assert_eq!(part.vertices[2].normal, Vec3::Z);
    }

    #[test]
    fn test_same_position_different_normal_is_distinct() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nvn 0 0 -1\n\
                   f 1//1 2//1 3//1\nf 1//2 3//2 2//2\n";
        let part = MeshLoader::default().load_from_str(src, None).unwrap().into_single_part().unwrap();
        assert_eq!(part.vertices.len(), 6);
        assert_eq!(part.triangle_count(), 2);
    }

    #[test]
    fn test_quads_are_skipped_with_report() {
        let src = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\nf 1 2 3\n";
        let mesh = MeshLoader::default().load_from_str(src, None).unwrap();
        assert_eq!(mesh.report.skipped_faces, 1);
        assert_eq!(mesh.parts[0].indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_missing_attributes_default_to_zero() {
        let src = "v 1 2 3\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";
        let mesh = MeshLoader::default().load_from_str(src, None).unwrap();
        let v = mesh.parts[0].vertices[0];
        assert_eq!(v.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(v.normal, Vec3::ZERO);
        assert_eq!(v.uv, Vec2::ZERO);
        assert_eq!(mesh.report.missing_normals, 3);
        assert_eq!(mesh.report.missing_uvs, 3);
    }

    #[test]
    fn test_index_limit_is_fatal() {
        let loader = MeshLoader::new(LoadOptions {
            index_limit: 3,
            ..LoadOptions::default()
        });
        let err = loader.load_from_str(QUAD, None).unwrap_err();
        assert!(matches!(err, LoadError::IndexOverflow { part: 0, limit: 3 }));
    }

    #[test]
    fn test_usemtl_without_library_goes_to_part_zero() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl ghost\nf 1 2 3\n";
        let mesh = MeshLoader::default().load_from_str(src, None).unwrap();
        assert_eq!(mesh.parts.len(), 1);
        assert_eq!(mesh.parts[0].triangle_count(), 1);
        assert_eq!(mesh.report.unknown_materials, 1);
    }

    #[test]
    fn test_materials_split_parts_and_resolve_textures() {
        let dir = tempfile::tempdir().unwrap();
        let mut mtl = std::fs::File::create(dir.path().join("scene.mtl")).unwrap();
        writeln!(mtl, "newmtl stone\nmap_Kd textures/stone.png\nnewmtl moss").unwrap();

        let obj_path = dir.path().join("scene.obj");
        std::fs::write(
            &obj_path,
            "mtllib scene.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\n\
             f 1 2 3\nusemtl moss\nf 1 2 3\nusemtl stone\nf 1 3 2\n",
        )
        .unwrap();

        let mesh = MeshLoader::default().load(&obj_path).unwrap();
        assert_eq!(mesh.parts.len(), 3);
        assert_eq!(mesh.parts[0].triangle_count(), 1);
        assert_eq!(mesh.parts[1].material.as_deref(), Some("stone"));
        assert_eq!(mesh.parts[1].triangle_count(), 1);
        assert_eq!(mesh.parts[2].material.as_deref(), Some("moss"));
        assert_eq!(
            mesh.parts[1].diffuse_texture,
            Some(dir.path().join("textures/stone.png"))
        );
        assert_eq!(mesh.parts[2].diffuse_texture, None);

        // Same file as plain geometry collapses into one part
        let geometry = MeshLoader::new(LoadOptions::geometry_only()).load(&obj_path).unwrap();
        assert_eq!(geometry.parts.len(), 1);
        assert_eq!(geometry.into_single_part().unwrap().triangle_count(), 3);

        assert!(matches!(
            mesh.into_single_part(),
            Err(LoadError::MultipleParts { parts: 3 })
        ));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = MeshLoader::default().load("/definitely/not/here.obj").unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
