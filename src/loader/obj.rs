//! OBJ / MTL text parsing
//!
//! Produces raw attribute arrays and faces of index triples. Nothing here
//! touches the filesystem; resolving `mtllib` references and building
//! indexed parts is the loader's job.

use super::LoadError;
use glam::{Vec2, Vec3};

/// Zero-based attribute indices of one face corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexTriple {
    pub position: u32,
    pub normal: Option<u32>,
    pub uv: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjFace {
    pub corners: Vec<IndexTriple>,
    /// Index into [`ObjData::material_refs`] of the active `usemtl`
    pub material: Option<usize>,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub texcoords: Vec<Vec2>,
    pub faces: Vec<ObjFace>,
    /// Material names in order of first `usemtl`
    pub material_refs: Vec<String>,
    /// `mtllib` file names, relative to the OBJ file
    pub material_libraries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjMaterial {
    pub name: String,
    pub diffuse_texture: Option<String>,
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_floats<const N: usize>(
    tokens: &mut std::str::SplitWhitespace<'_>,
    line: usize,
    what: &str,
    required: usize,
) -> Result<[f32; N], LoadError> {
    let mut values = [0.0; N];
    for (i, value) in values.iter_mut().enumerate() {
        match tokens.next() {
            Some(token) => {
                *value = token.parse().map_err(|_| LoadError::Parse {
                    line,
                    message: format!("invalid {} component `{}`", what, token),
                })?;
            }
            None if i < required => {
                return Err(LoadError::Parse {
                    line,
                    message: format!("{} needs at least {} components", what, required),
                });
            }
            None => break,
        }
    }
    Ok(values)
}

/// Resolve a one-based (or negative, relative) OBJ index against `count` elements seen so far
fn resolve_index(token: &str, count: usize, line: usize, kind: &'static str) -> Result<u32, LoadError> {
    let raw: i64 = token.parse().map_err(|_| LoadError::Parse {
        line,
        message: format!("invalid {} index `{}`", kind, token),
    })?;

    let resolved = match raw {
        0 => None,
        r if r > 0 => Some(r - 1),
        r => Some(count as i64 + r),
    };

    match resolved {
        Some(index) if index >= 0 && index < count as i64 => u32::try_from(index).map_err(|_| {
            LoadError::IndexOutOfRange {
                line,
                kind,
                index: raw,
                count,
            }
        }),
        _ => Err(LoadError::IndexOutOfRange {
            line,
            kind,
            index: raw,
            count,
        }),
    }
}

fn parse_corner(token: &str, data: &ObjData, line: usize) -> Result<IndexTriple, LoadError> {
    let mut parts = token.split('/');
    let position = match parts.next() {
        Some(p) if !p.is_empty() => resolve_index(p, data.positions.len(), line, "position")?,
        _ => {
            return Err(LoadError::Parse {
                line,
                message: format!("face corner `{}` has no position", token),
            })
        }
    };
    let uv = match parts.next() {
        Some(t) if !t.is_empty() => Some(resolve_index(t, data.texcoords.len(), line, "texcoord")?),
        _ => None,
    };
    let normal = match parts.next() {
        Some(n) if !n.is_empty() => Some(resolve_index(n, data.normals.len(), line, "normal")?),
        _ => None,
    };
    Ok(IndexTriple {
        position,
        normal,
        uv,
    })
}

/// Parse OBJ text
pub fn parse_obj(source: &str) -> Result<ObjData, LoadError> {
    let mut data = ObjData::default();
    let mut current_material: Option<usize> = None;

    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let mut tokens = strip_comment(raw_line).split_whitespace();
        let Some(keyword) = tokens.next() else {
            continue;
        };

        match keyword {
            "v" => {
                let [x, y, z] = parse_floats::<3>(&mut tokens, line, "position", 3)?;
                data.positions.push(Vec3::new(x, y, z));
            }
            "vn" => {
                let [x, y, z] = parse_floats::<3>(&mut tokens, line, "normal", 3)?;
                data.normals.push(Vec3::new(x, y, z));
            }
            "vt" => {
                let [u, v] = parse_floats::<2>(&mut tokens, line, "texcoord", 1)?;
                data.texcoords.push(Vec2::new(u, v));
            }
            "f" => {
                let corners = tokens
                    .map(|token| parse_corner(token, &data, line))
                    .collect::<Result<Vec<_>, _>>()?;
                data.faces.push(ObjFace {
                    corners,
                    material: current_material,
                    line,
                });
            }
            "usemtl" => {
                let name = tokens.collect::<Vec<_>>().join(" ");
                let slot = match data.material_refs.iter().position(|m| *m == name) {
                    Some(slot) => slot,
                    None => {
                        data.material_refs.push(name);
                        data.material_refs.len() - 1
                    }
                };
                current_material = Some(slot);
            }
            "mtllib" => {
                data.material_libraries.extend(tokens.map(str::to_string));
            }
            "o" | "g" | "s" | "l" | "p" | "vp" => {}
            other => {
                log::debug!("line {}: ignoring `{}` statement", line, other);
            }
        }
    }

    Ok(data)
}

/// Parse MTL text, keeping the name and diffuse map of each material
pub fn parse_mtl(source: &str) -> Vec<ObjMaterial> {
    let mut materials: Vec<ObjMaterial> = Vec::new();

    for raw_line in source.lines() {
        let mut tokens = strip_comment(raw_line).split_whitespace();
        match tokens.next() {
            Some("newmtl") => {
                materials.push(ObjMaterial {
                    name: tokens.collect::<Vec<_>>().join(" "),
                    diffuse_texture: None,
                });
            }
            Some("map_Kd") => {
                // Map options precede the file name
                if let (Some(material), Some(path)) = (materials.last_mut(), tokens.last()) {
                    material.diffuse_texture = Some(path.to_string());
                }
            }
            _ => {}
        }
    }

    materials
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_forms() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvt 0 0\nvn 0 0 1\n\
                   f 1 2 3\nf 1/1 2/1 3/1\nf 1//1 2//1 3//1\nf 1/1/1 2/1/1 3/1/1\n";
        let data = parse_obj(src).unwrap();
        assert_eq!(data.faces.len(), 4);

        let first = |f: usize| data.faces[f].corners[0];
        assert_eq!(first(0), IndexTriple { position: 0, normal: None, uv: None });
        assert_eq!(first(1), IndexTriple { position: 0, normal: None, uv: Some(0) });
        assert_eq!(first(2), IndexTriple { position: 0, normal: Some(0), uv: None });
        assert_eq!(first(3), IndexTriple { position: 0, normal: Some(0), uv: Some(0) });
    }

    #[test]
    fn test_relative_indices() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n";
        let data = parse_obj(src).unwrap();
        let positions: Vec<u32> = data.faces[0].corners.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_range_index_is_an_error() {
        let err = parse_obj("v 0 0 0\nf 1 2 3\n").unwrap_err();
        assert!(matches!(
            err,
            LoadError::IndexOutOfRange { line: 2, kind: "position", index: 2, count: 1 }
        ));
        assert!(parse_obj("v 0 0 0\nf 0 1 1\n").is_err());
    }

    #[test]
    fn test_malformed_number_reports_line() {
        let err = parse_obj("# header\nv 1 nope 3\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_materials_and_comments() {
        let src = "mtllib scene.mtl\nv 0 0 0 # origin\nv 1 0 0\nv 0 1 0\n\
                   usemtl stone\nf 1 2 3\nusemtl moss\nf 1 2 3\nusemtl stone\nf 1 2 3\n";
        let data = parse_obj(src).unwrap();
        assert_eq!(data.material_libraries, vec!["scene.mtl".to_string()]);
        assert_eq!(data.material_refs, vec!["stone".to_string(), "moss".to_string()]);
        let materials: Vec<_> = data.faces.iter().map(|f| f.material).collect();
        assert_eq!(materials, vec![Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn test_parse_mtl_takes_last_token_of_map() {
        let mats = parse_mtl("newmtl a\nKd 1 1 1\nmap_Kd -s 2 2 1 tex/a.png\nnewmtl b\n");
        assert_eq!(mats.len(), 2);
        assert_eq!(mats[0].diffuse_texture.as_deref(), Some("tex/a.png"));
        assert_eq!(mats[1].diffuse_texture, None);
    }
}
