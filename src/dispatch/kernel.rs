//! Tile stamping kernel
//!
//! One invocation per (target triangle, tile triangle) pair. The invocation
//! walks every tile cell its target triangle owns, maps the tile triangle's
//! corners from cell UV space onto the surface and appends the result to
//! the output streams.
//!
//! Variant defines:
//! - `CLIPPING`: drop tile triangles whose three corners all fall outside the target triangle
//! - `NORMALS_INTERPOLATED`: shade with barycentric-interpolated vertex normals instead of the face normal
//! - `THREAD_GROUP_SIZE`: workgroup width

use super::bindings;
use crate::backend::{BackendError, BackendResult, KernelInvocation, SoftwareBackend, SoftwareKernel};
use crate::streams::{OutputVertex, StreamHeader, TargetTriangle, TileVertex, STREAM_HEADER_SIZE};
use bytemuck::Zeroable;
use glam::{Vec2, Vec3};
use std::sync::Arc;

pub const TILE_ENTRY_POINT: &str = "generate_tiles";

pub const CLIPPING_DEFINE: &str = "CLIPPING";
pub const INTERPOLATED_NORMALS_DEFINE: &str = "NORMALS_INTERPOLATED";
pub const GROUP_SIZE_DEFINE: &str = "THREAD_GROUP_SIZE";

/// Corners further than this outside the triangle count as clipped
pub const CLIP_EPSILON: f32 = 1e-4;

pub const TILE_GENERATION_SHADER: &str = r#"
struct TargetTriangle {
    p0: vec3<f32>,
    tile_base: u32,
    p1: vec3<f32>,
    tile_count: u32,
    p2: vec3<f32>,
    tile_columns: u32,
    normal: vec3<f32>,
    _padding0: u32,
    vertex_normals: array<vec4<f32>, 3>,
    uv_to_bary: array<vec4<f32>, 3>,
    tile_origin: vec2<f32>,
    _padding1: vec2<f32>,
}

struct TileVertex {
    position: vec3<f32>,
    _padding0: f32,
    normal: vec3<f32>,
    _padding1: f32,
}

struct StreamHeader {
    count: atomic<u32>,
    dropped: atomic<u32>,
    capacity: u32,
    _padding: u32,
}

struct OutputVertex {
    position: vec4<f32>,
    normal: vec4<f32>,
}

struct VertexStream {
    header: StreamHeader,
    data: array<OutputVertex>,
}

struct IndexStream {
    header: StreamHeader,
    data: array<u32>,
}

@group(0) @binding(0) var<storage, read> triangles: array<TargetTriangle>;
@group(0) @binding(1) var<storage, read> tile_vertices: array<TileVertex>;
@group(0) @binding(2) var<storage, read> tile_indices: array<u32>;
@group(0) @binding(3) var<storage, read_write> out_vertices: VertexStream;
@group(0) @binding(4) var<storage, read_write> out_indices: IndexStream;

const CLIP_EPSILON: f32 = 1e-4;

fn safe_normalize(v: vec3<f32>, fallback: vec3<f32>) -> vec3<f32> {
    let len2 = dot(v, v);
    if (len2 > 1e-12) {
        return v * inverseSqrt(len2);
    }
    return fallback;
}

fn barycentric(tri: TargetTriangle, uv: vec2<f32>) -> vec3<f32> {
    let p = vec3<f32>(uv, 1.0);
    return vec3<f32>(
        dot(tri.uv_to_bary[0].xyz, p),
        dot(tri.uv_to_bary[1].xyz, p),
        dot(tri.uv_to_bary[2].xyz, p),
    );
}

fn surface_point(tri: TargetTriangle, bary: vec3<f32>) -> vec3<f32> {
    return tri.p0 * bary.x + tri.p1 * bary.y + tri.p2 * bary.z;
}

fn surface_normal(tri: TargetTriangle, bary: vec3<f32>) -> vec3<f32> {
#ifdef NORMALS_INTERPOLATED
    let n = tri.vertex_normals[0].xyz * bary.x
        + tri.vertex_normals[1].xyz * bary.y
        + tri.vertex_normals[2].xyz * bary.z;
    return safe_normalize(n, tri.normal);
#else
    return tri.normal;
#endif
}

// Counters stop at capacity. A failed reservation bumps `dropped` and returns 0xffffffffu.
fn reserve_vertices() -> u32 {
    var reserved = 0xffffffffu;
    var seen = atomicLoad(&out_vertices.header.count);
    loop {
        if (seen + 3u > out_vertices.header.capacity || seen + 3u < seen) {
            atomicAdd(&out_vertices.header.dropped, 1u);
            break;
        }
        let result = atomicCompareExchangeWeak(&out_vertices.header.count, seen, seen + 3u);
        if (result.exchanged) {
            reserved = seen;
            break;
        }
        seen = result.old_value;
    }
    return reserved;
}

fn reserve_indices() -> u32 {
    var reserved = 0xffffffffu;
    var seen = atomicLoad(&out_indices.header.count);
    loop {
        if (seen + 3u > out_indices.header.capacity || seen + 3u < seen) {
            atomicAdd(&out_indices.header.dropped, 1u);
            break;
        }
        let result = atomicCompareExchangeWeak(&out_indices.header.count, seen, seen + 3u);
        if (result.exchanged) {
            reserved = seen;
            break;
        }
        seen = result.old_value;
    }
    return reserved;
}

fn emit(a: OutputVertex, b: OutputVertex, c: OutputVertex) {
    let vbase = reserve_vertices();
    if (vbase == 0xffffffffu) {
        return;
    }
    out_vertices.data[vbase] = a;
    out_vertices.data[vbase + 1u] = b;
    out_vertices.data[vbase + 2u] = c;

    let ibase = reserve_indices();
    if (ibase == 0xffffffffu) {
        return;
    }
    out_indices.data[ibase] = vbase;
    out_indices.data[ibase + 1u] = vbase + 1u;
    out_indices.data[ibase + 2u] = vbase + 2u;
}

@compute @workgroup_size(${THREAD_GROUP_SIZE})
fn generate_tiles(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let tile_triangles = arrayLength(&tile_indices) / 3u;
    if (tile_triangles == 0u) {
        return;
    }
    let work = global_id.x;
    if (work >= arrayLength(&triangles) * tile_triangles) {
        return;
    }

    let tri = triangles[work / tile_triangles];
    let first = (work % tile_triangles) * 3u;

    var corners: array<TileVertex, 3>;
    for (var k = 0u; k < 3u; k = k + 1u) {
        corners[k] = tile_vertices[tile_indices[first + k]];
    }

    // Tile x follows +u, tile z follows +v
    let dpdu = tri.p0 * tri.uv_to_bary[0].x + tri.p1 * tri.uv_to_bary[1].x + tri.p2 * tri.uv_to_bary[2].x;
    let dpdv = tri.p0 * tri.uv_to_bary[0].y + tri.p1 * tri.uv_to_bary[1].y + tri.p2 * tri.uv_to_bary[2].y;
    let tangent = safe_normalize(dpdu, vec3<f32>(0.0));
    let bitangent = safe_normalize(dpdv, vec3<f32>(0.0));

    for (var t = 0u; t < tri.tile_count; t = t + 1u) {
        let cell = tri.tile_origin + vec2<f32>(f32(t % tri.tile_columns), f32(t / tri.tile_columns));

        var emitted: array<OutputVertex, 3>;
        var outside = 0u;
        for (var k = 0u; k < 3u; k = k + 1u) {
            let p = corners[k].position;
            let bary = barycentric(tri, cell + p.xz);
            if (any(bary < vec3<f32>(-CLIP_EPSILON))) {
                outside = outside + 1u;
            }
            let n = surface_normal(tri, bary);
            let tn = corners[k].normal;
            let world_normal = safe_normalize(tangent * tn.x + n * tn.y + bitangent * tn.z, n);
            emitted[k] = OutputVertex(
                vec4<f32>(surface_point(tri, bary) + n * p.y, 1.0),
                vec4<f32>(world_normal, 0.0),
            );
        }

#ifdef CLIPPING
        if (outside == 3u) {
            continue;
        }
#endif
        emit(emitted[0], emitted[1], emitted[2]);
    }
}
"#;

fn safe_normalize(v: Vec3, fallback: Vec3) -> Vec3 {
    let len2 = v.length_squared();
    if len2 > 1e-12 {
        v / len2.sqrt()
    } else {
        fallback
    }
}

/// Per-triangle data the kernel derives once and reuses for every cell
struct SurfaceFrame<'a> {
    triangle: &'a TargetTriangle,
    corners: [Vec3; 3],
    tangent: Vec3,
    bitangent: Vec3,
    interpolated: bool,
}

impl<'a> SurfaceFrame<'a> {
    fn new(triangle: &'a TargetTriangle, interpolated: bool) -> Self {
        let corners = triangle.corners();
        let rows = &triangle.uv_to_bary;
        let dpdu = corners[0] * rows[0][0] + corners[1] * rows[1][0] + corners[2] * rows[2][0];
        let dpdv = corners[0] * rows[0][1] + corners[1] * rows[1][1] + corners[2] * rows[2][1];
        Self {
            triangle,
            corners,
            tangent: safe_normalize(dpdu, Vec3::ZERO),
            bitangent: safe_normalize(dpdv, Vec3::ZERO),
            interpolated,
        }
    }

    fn normal(&self, bary: Vec3) -> Vec3 {
        let face = Vec3::from_array(self.triangle.normal);
        if !self.interpolated {
            return face;
        }
        let n = self.triangle.vertex_normals;
        let blended = Vec3::from_slice(&n[0][..3]) * bary.x
            + Vec3::from_slice(&n[1][..3]) * bary.y
            + Vec3::from_slice(&n[2][..3]) * bary.z;
        safe_normalize(blended, face)
    }

    /// Map one tile triangle into `cell`; returns the vertices and how many corners fell outside
    fn stamp(&self, tile: &[TileVertex; 3], cell: Vec2) -> ([OutputVertex; 3], u32) {
        let mut outside = 0;
        let vertices = tile.map(|corner| {
            let p = Vec3::from_array(corner.position);
            let bary = self.triangle.barycentric(cell + Vec2::new(p.x, p.z));
            if bary.min_element() < -CLIP_EPSILON {
                outside += 1;
            }
            let n = self.normal(bary);
            let tn = Vec3::from_array(corner.normal);
            let world_normal = safe_normalize(self.tangent * tn.x + n * tn.y + self.bitangent * tn.z, n);
            let surface = self.corners[0] * bary.x + self.corners[1] * bary.y + self.corners[2] * bary.z;
            OutputVertex {
                position: (surface + n * p.y).extend(1.0).to_array(),
                normal: world_normal.extend(0.0).to_array(),
            }
        });
        (vertices, outside)
    }
}

/// CPU implementation of `generate_tiles` for the software backend.
///
/// Invocations run in order, so output from a given dispatch is
/// deterministic. Buffer layouts and overflow handling match the WGSL.
#[derive(Debug, Default, Clone, Copy)]
pub struct TileStampKernel;

impl TileStampKernel {
    pub fn register(backend: &mut SoftwareBackend) {
        backend.register_kernel(TILE_ENTRY_POINT, Arc::new(Self));
    }

    /// Claim three slots of the stream at `binding`, or count a drop once
    /// the next three would pass capacity. `count` never moves past capacity.
    fn reserve(invocation: &mut KernelInvocation<'_>, binding: u32) -> BackendResult<Option<u32>> {
        let header: StreamHeader = invocation.read(binding, 0)?;
        match header.count.checked_add(3) {
            Some(end) if end <= header.capacity => {
                invocation.write(binding, 0, &end)?;
                Ok(Some(header.count))
            }
            _ => {
                invocation.fetch_add_u32(binding, 4, 1)?;
                Ok(None)
            }
        }
    }

    fn emit(invocation: &mut KernelInvocation<'_>, vertices: &[OutputVertex; 3]) -> BackendResult<()> {
        let header = STREAM_HEADER_SIZE as usize;

        let Some(vbase) = Self::reserve(invocation, bindings::OUTPUT_VERTICES)? else {
            return Ok(());
        };
        for (k, vertex) in vertices.iter().enumerate() {
            let offset = header + (vbase as usize + k) * std::mem::size_of::<OutputVertex>();
            invocation.write(bindings::OUTPUT_VERTICES, offset, vertex)?;
        }

        let Some(ibase) = Self::reserve(invocation, bindings::OUTPUT_INDICES)? else {
            return Ok(());
        };
        for k in 0..3u32 {
            let offset = header + (ibase + k) as usize * 4;
            invocation.write(bindings::OUTPUT_INDICES, offset, &(vbase + k))?;
        }
        Ok(())
    }
}

impl SoftwareKernel for TileStampKernel {
    fn execute(&self, invocation: &mut KernelInvocation<'_>) -> BackendResult<()> {
        let group_size: u32 = invocation.defines.parse(GROUP_SIZE_DEFINE).ok_or_else(|| {
            BackendError::KernelFailed(format!("`{}` is not defined", GROUP_SIZE_DEFINE))
        })?;
        let clipping = invocation.defines.is_defined(CLIPPING_DEFINE);
        let interpolated = invocation.defines.is_defined(INTERPOLATED_NORMALS_DEFINE);

        // Both headers must be present before anything is appended
        let _: StreamHeader = invocation.read(bindings::OUTPUT_VERTICES, 0)?;
        let _: StreamHeader = invocation.read(bindings::OUTPUT_INDICES, 0)?;

        let triangles: Vec<TargetTriangle> = invocation.read_array(bindings::TARGET)?;
        let tile_vertices: Vec<TileVertex> = invocation.read_array(bindings::TILE_VERTICES)?;
        let tile_indices: Vec<u32> = invocation.read_array(bindings::TILE_INDICES)?;

        let tile_triangles = (tile_indices.len() / 3) as u64;
        if tile_triangles == 0 {
            return Ok(());
        }
        let total = triangles.len() as u64 * tile_triangles;
        let [x, y, z] = invocation.workgroups;
        let width = (u64::from(x) * u64::from(group_size)).min(total);

        // Every (y, z) slice of the grid repeats the same global x range
        for _ in 0..u64::from(y) * u64::from(z) {
            for work in 0..width {
                let triangle = &triangles[(work / tile_triangles) as usize];
                let first = ((work % tile_triangles) * 3) as usize;
                let corner = |k: usize| {
                    tile_vertices
                        .get(tile_indices[first + k] as usize)
                        .copied()
                        .unwrap_or_else(TileVertex::zeroed)
                };
                let tile = [corner(0), corner(1), corner(2)];
                let frame = SurfaceFrame::new(triangle, interpolated);

                for t in 0..triangle.tile_count {
                    let cell = Vec2::from_array(triangle.tile_origin)
                        + Vec2::new(
                            (t % triangle.tile_columns) as f32,
                            (t / triangle.tile_columns) as f32,
                        );
                    let (vertices, outside) = frame.stamp(&tile, cell);
                    if clipping && outside == 3 {
                        continue;
                    }
                    Self::emit(invocation, &vertices)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{preprocess, ShaderDefines};

    fn validate(defines: &ShaderDefines) -> Result<(), String> {
        let source = preprocess(TILE_GENERATION_SHADER, defines).map_err(|e| e.to_string())?;
        let module = naga::front::wgsl::parse_str(&source).map_err(|e| e.emit_to_string(&source))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        )
        .validate(&module)
        .map_err(|e| e.into_inner().to_string())?;
        Ok(())
    }

    #[test]
    fn test_every_variant_compiles() {
        for size in [64, 128, 256, 512] {
            for clipping in [false, true] {
                for interpolated in [false, true] {
                    let mut defines = ShaderDefines::new().value(GROUP_SIZE_DEFINE, size);
                    if clipping {
                        defines = defines.flag(CLIPPING_DEFINE);
                    }
                    if interpolated {
                        defines = defines.flag(INTERPOLATED_NORMALS_DEFINE);
                    }
                    if let Err(err) = validate(&defines) {
                        panic!("variant [{}] failed: {}", defines, err);
                    }
                }
            }
        }
    }

    fn flat_triangle() -> TargetTriangle {
        use crate::backend::Vertex;
        use crate::streams::TileSpan;

        let a = Vertex::new(Vec3::ZERO, Vec3::Y, Vec2::ZERO);
        let b = Vertex::new(Vec3::new(0.0, 0.0, 2.0), Vec3::Y, Vec2::new(0.0, 1.0));
        let c = Vertex::new(Vec3::new(2.0, 0.0, 0.0), Vec3::Y, Vec2::new(1.0, 0.0));
        let span = TileSpan::from_uvs(&[a.uv, b.uv, c.uv]);
        TargetTriangle::new([&a, &b, &c], 0, span)
    }

    fn assert_close(actual: [f32; 4], expected: [f32; 4]) {
        let close = actual.iter().zip(expected).all(|(a, e)| (a - e).abs() < 1e-5);
        assert!(close, "{:?} != {:?}", actual, expected);
    }

    fn tile_vertex(position: [f32; 3], normal: [f32; 3]) -> TileVertex {
        TileVertex {
            position,
            _padding0: 0.0,
            normal,
            _padding1: 0.0,
        }
    }

    #[test]
    fn test_stamp_maps_cell_uv_onto_surface() {
        let triangle = flat_triangle();
        let frame = SurfaceFrame::new(&triangle, false);
        let tile = [
            tile_vertex([0.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            tile_vertex([0.5, 0.0, 0.0], [0.0, 1.0, 0.0]),
            tile_vertex([0.0, 0.25, 0.5], [1.0, 0.0, 0.0]),
        ];

        let (vertices, outside) = frame.stamp(&tile, Vec2::ZERO);
        assert_eq!(outside, 0);
        assert_close(vertices[1].position, [1.0, 0.0, 0.0, 1.0]);
        // Height rides along the face normal
        assert_close(vertices[2].position, [0.0, 0.25, 1.0, 1.0]);
        assert_close(vertices[0].normal, [0.0, 1.0, 0.0, 0.0]);
        // Tile +x follows the +u direction on the surface
        assert_close(vertices[2].normal, [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_stamp_counts_corners_outside() {
        let triangle = flat_triangle();
        let frame = SurfaceFrame::new(&triangle, false);
        let tile = [
            tile_vertex([0.9, 0.0, 0.9], [0.0, 1.0, 0.0]),
            tile_vertex([1.0, 0.0, 0.9], [0.0, 1.0, 0.0]),
            tile_vertex([0.9, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ];
        let (_, outside) = frame.stamp(&tile, Vec2::ZERO);
        assert_eq!(outside, 3);
    }
}
