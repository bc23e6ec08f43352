//! Backend abstraction layer
//!
//! Provides common traits and types that the wgpu and software backends implement.

pub mod software;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use software::{KernelInvocation, SoftwareBackend, SoftwareCommand, SoftwareKernel};
pub use traits::*;
pub use types::*;
