//! Renderable meshes
//!
//! Multi-material meshes uploaded for drawing, plus procedural mesh data
//! for targets and tiles that do not come from a file.

mod mesh;

pub use mesh::*;
