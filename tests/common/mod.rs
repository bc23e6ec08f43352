//! Shared fixtures for the integration tests.
//!
//! Meshes are written as OBJ text into a scratch directory so the tests go
//! through the same path-based loading the CLI uses.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use surface_tiler::backend::{
    ColorAttachment, GraphicsBackend, LoadOp, RenderPassDescriptor, StoreOp, TextureDescriptor,
};
use surface_tiler::dispatch::TileStampKernel;
use surface_tiler::SoftwareBackend;

/// Software backend with the tiling kernel registered
pub fn software_backend() -> SoftwareBackend {
    let mut backend = SoftwareBackend::new();
    TileStampKernel::register(&mut backend);
    backend
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write fixture");
    path
}

/// `n` x `n` quads on the XZ plane facing +Y, one UV cell per quad
pub fn grid_obj(n: u32) -> String {
    let mut obj = String::from("# grid\nvn 0 1 0\n");
    for z in 0..=n {
        for x in 0..=n {
            let _ = writeln!(obj, "v {} 0 {}", x, z);
            let _ = writeln!(obj, "vt {} {}", x, z);
        }
    }
    let row = n + 1;
    for z in 0..n {
        for x in 0..n {
            // OBJ indices are 1-based
            let a = z * row + x + 1;
            let b = a + 1;
            let c = a + row;
            let d = c + 1;
            let _ = writeln!(obj, "f {a}/{a}/1 {c}/{c}/1 {b}/{b}/1");
            let _ = writeln!(obj, "f {b}/{b}/1 {c}/{c}/1 {d}/{d}/1");
        }
    }
    obj
}

/// Two thin blades standing in the cell, 0.5 high
pub const BLADES_OBJ: &str = "\
# two blades
v 0.20 0.0 0.25
v 0.30 0.0 0.25
v 0.25 0.5 0.25
v 0.70 0.0 0.75
v 0.80 0.0 0.75
v 0.75 0.5 0.75
vn 0 0 1
f 1//1 2//1 3//1
f 4//1 5//1 6//1
";

/// Open a render pass on an offscreen target so draws can be recorded
pub fn begin_offscreen_pass(backend: &mut dyn GraphicsBackend) {
    let texture = backend
        .create_texture(&TextureDescriptor {
            label: Some("offscreen".into()),
            width: 64,
            height: 64,
            ..Default::default()
        })
        .expect("failed to create offscreen target");
    let view = backend
        .create_texture_view(texture)
        .expect("failed to create offscreen view");
    backend.begin_render_pass(&RenderPassDescriptor {
        label: Some("offscreen".into()),
        color_attachments: vec![ColorAttachment {
            view,
            load_op: LoadOp::Clear([0.0; 4]),
            store_op: StoreOp::Store,
        }],
        depth_stencil_attachment: None,
    });
}
