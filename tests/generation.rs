//! End-to-end generation tests on the software backend.
//!
//! Meshes go through the OBJ loader from disk, the streams are uploaded,
//! the dispatcher runs the CPU kernel and results are read back through the
//! output stream's counters.

mod common;

use std::sync::Arc;

use rstest::rstest;

use common::{begin_offscreen_pass, grid_obj, software_backend, write_file, BLADES_OBJ};
use surface_tiler::backend::{
    BackendResult, GraphicsBackend, KernelInvocation, SoftwareCommand, SoftwareKernel,
};
use surface_tiler::dispatch::{dispatch_size, TILE_ENTRY_POINT};
use surface_tiler::loader::LoadError;
use surface_tiler::streams::{OutputVertex, StreamError, STREAM_HEADER_SIZE};
use surface_tiler::{
    CapacityPolicy, DispatchConfig, FrameConfig, GpuMeshStream, LoadOptions, MeshLoader,
    MeshSource, NormalMode, SessionConfig, TargetMesh, ThreadGroupSize, TileDispatcher, TileMesh,
    TilingSession,
};

fn dispatched_workgroups(commands: &[SoftwareCommand]) -> Vec<[u32; 3]> {
    commands
        .iter()
        .filter_map(|c| match c {
            SoftwareCommand::Dispatch { workgroups, .. } => Some(*workgroups),
            _ => None,
        })
        .collect()
}

#[rstest]
#[case::x64(ThreadGroupSize::X64, 25)]
#[case::x128(ThreadGroupSize::X128, 13)]
#[case::x256(ThreadGroupSize::X256, 7)]
#[case::x512(ThreadGroupSize::X512, 4)]
fn test_workgroups_cover_every_pair(#[case] group_size: ThreadGroupSize, #[case] expected: u32) {
    let dir = tempfile::tempdir().unwrap();
    let target_path = write_file(dir.path(), "grid.obj", &grid_obj(20));
    let tile_path = write_file(dir.path(), "blades.obj", BLADES_OBJ);

    let mut backend = software_backend();
    let target = TargetMesh::load(&mut backend, &target_path).unwrap();
    let tile = TileMesh::load(&mut backend, &tile_path).unwrap();
    assert_eq!(target.num_triangles(), 800);
    assert_eq!(tile.num_triangles(), 2);

    let size = dispatch_size(target.num_triangles(), tile.num_indices(), group_size);
    assert_eq!(size.workgroups, u64::from(expected));

    let dispatcher = TileDispatcher::new(&mut backend);
    let mut output = GpuMeshStream::allocate(&mut backend, 4800, 4800).unwrap();
    backend.clear_commands();

    let config = DispatchConfig {
        thread_group_size: group_size,
        ..Default::default()
    };
    dispatcher
        .dispatch(&mut backend, &config, target.stream(), tile.streams(), &mut output)
        .unwrap();
    assert_eq!(dispatched_workgroups(backend.commands()), vec![[expected, 1, 1]]);

    // Every (triangle, blade) pair lands in the output exactly once
    assert_eq!(output.generated_count(&mut backend).unwrap(), 800 * 2 * 3);
}

#[test]
fn test_clipping_keeps_blades_inside_their_triangle() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        target: MeshSource::File(write_file(dir.path(), "grid.obj", &grid_obj(3))),
        tile: MeshSource::File(write_file(dir.path(), "blades.obj", BLADES_OBJ)),
        capacity: CapacityPolicy::WorstCase,
    };

    let mut backend = software_backend();
    let mut session = TilingSession::new(&mut backend, &config).unwrap();
    let triangles = session.target().num_triangles();

    let unclipped = session.generate(&mut backend, &FrameConfig::default()).unwrap();
    assert_eq!(unclipped.generated.triangles(), triangles * 2);

    let clipped = FrameConfig {
        dispatch: DispatchConfig {
            clipping: true,
            ..Default::default()
        },
    };
    let report = session.generate(&mut backend, &clipped).unwrap();
    // Each blade sits on one side of its cell's diagonal
    assert_eq!(report.generated.triangles(), triangles);
    assert_eq!(report.generated.dropped_triangles, 0);
}

#[test]
fn test_generated_vertices_stay_over_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        target: MeshSource::File(write_file(dir.path(), "grid.obj", &grid_obj(2))),
        tile: MeshSource::File(write_file(dir.path(), "blades.obj", BLADES_OBJ)),
        capacity: CapacityPolicy::WorstCase,
    };

    let mut backend = software_backend();
    let mut session = TilingSession::new(&mut backend, &config).unwrap();
    let frame = FrameConfig {
        dispatch: DispatchConfig {
            clipping: true,
            normal_mode: NormalMode::Interpolated,
            thread_group_size: ThreadGroupSize::X128,
        },
    };
    let report = session.generate(&mut backend, &frame).unwrap();
    assert!(report.generated.vertices > 0);

    let stride = std::mem::size_of::<OutputVertex>() as u64;
    let bytes = backend
        .read_buffer(
            session.output().vertex_buffer(),
            STREAM_HEADER_SIZE,
            u64::from(report.generated.vertices) * stride,
        )
        .unwrap();
    for chunk in bytes.chunks_exact(stride as usize) {
        let vertex: OutputVertex = bytemuck::pod_read_unaligned(chunk);
        let [x, y, z, w] = vertex.position;
        assert!((-1e-4..=2.0 + 1e-4).contains(&x), "x = {}", x);
        assert!((-1e-4..=2.0 + 1e-4).contains(&z), "z = {}", z);
        assert!((-1e-4..=0.5 + 1e-4).contains(&y), "y = {}", y);
        assert_eq!(w, 1.0);
        // Blade normals follow +v on the surface, which is +z
        assert!((vertex.normal[2] - 1.0).abs() < 1e-4);
    }

    session.destroy(&mut backend);
    assert!(backend.failures().is_empty());
}

/// Appends a fixed number of indices, whatever it is given
struct AppendIndices(u32);

impl SoftwareKernel for AppendIndices {
    fn execute(&self, invocation: &mut KernelInvocation<'_>) -> BackendResult<()> {
        for i in 0..self.0 {
            let slot = invocation.fetch_add_u32(4, 0, 1)?;
            invocation.write(4, STREAM_HEADER_SIZE as usize + slot as usize * 4, &i)?;
        }
        Ok(())
    }
}

#[test]
fn test_count_and_draw_follow_kernel_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = software_backend();
    backend.register_kernel(TILE_ENTRY_POINT, Arc::new(AppendIndices(9)));

    let target = TargetMesh::load(&mut backend, write_file(dir.path(), "grid.obj", &grid_obj(1))).unwrap();
    let tile = TileMesh::load(&mut backend, write_file(dir.path(), "blades.obj", BLADES_OBJ)).unwrap();
    let dispatcher = TileDispatcher::new(&mut backend);
    let mut output = GpuMeshStream::allocate(&mut backend, 64, 64).unwrap();

    output.reset(&mut backend);
    assert_eq!(output.generated_count(&mut backend).unwrap(), 0);

    output.reset(&mut backend);
    dispatcher
        .dispatch(&mut backend, &DispatchConfig::default(), target.stream(), tile.streams(), &mut output)
        .unwrap();
    let count = output.generated_count(&mut backend).unwrap();
    assert_eq!(count, 9);

    begin_offscreen_pass(&mut backend);
    output.draw(&mut backend, count);
    backend.end_render_pass();

    let draws = backend.draw_calls();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].indices, 0..9);
}

#[test]
fn test_loader_drops_non_triangles_and_defaults_missing_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "mixed.obj",
        "\
v 0 0 0
v 1 0 0
v 1 0 1
v 0 0 1
vt 0.5 0.5
f 1 2 3
f 1 2 3 4
f 1/1 3/1 4/1
f 1 3 4
",
    );

    let mesh = MeshLoader::new(LoadOptions::geometry_only()).load(&path).unwrap();
    assert_eq!(mesh.report.skipped_faces, 1);

    let part = mesh.into_single_part().unwrap();
    assert_eq!(part.triangle_count(), 3);
    // 1, 2, 3, 4 without UV plus 1, 3, 4 with UV
    assert_eq!(part.vertices.len(), 7);
    assert!(part.vertices.len() <= 3 * part.triangle_count());
    assert!(part.vertices.iter().all(|v| v.normal == glam::Vec3::ZERO));
    assert_eq!(part.vertices[0].uv, glam::Vec2::ZERO);
}

#[test]
fn test_target_with_two_materials_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "two.mtl", "newmtl a\nnewmtl b\n");
    let path = write_file(
        dir.path(),
        "two.obj",
        "mtllib two.mtl\nv 0 0 0\nv 1 0 0\nv 0 0 1\nusemtl a\nf 1 3 2\nusemtl b\nf 1 3 2\n",
    );

    // Materials honored: two filled parts cannot feed a single stream
    let mesh = MeshLoader::new(LoadOptions::default()).load(&path).unwrap();
    assert!(matches!(mesh.into_single_part(), Err(LoadError::MultipleParts { parts: 2 })));

    // Target loading ignores materials and merges the faces
    let mut backend = software_backend();
    let target = TargetMesh::load(&mut backend, &path).unwrap();
    assert_eq!(target.num_triangles(), 2);
}

#[test]
fn test_missing_file_is_an_error() {
    let mut backend = software_backend();
    let result = TileMesh::load(&mut backend, "does/not/exist.obj");
    assert!(matches!(result, Err(StreamError::Load(LoadError::Io { .. }))));
    assert_eq!(backend.buffer_count(), 0);
}
