//! Common types shared between backends

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 2);
    pub const COPY_DST: Self = Self(1 << 3);
    pub const INDEX: Self = Self(1 << 4);
    pub const VERTEX: Self = Self(1 << 5);
    pub const STORAGE: Self = Self(1 << 7);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Memory visibility a barrier must establish before later commands run.
///
/// Mirrors the barrier classes a compute-then-draw frame needs: atomic
/// counters and storage writes must be visible before a CPU readback, and
/// the same storage must be visible as vertex/index input before a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier(u32);

impl MemoryBarrier {
    pub const ATOMIC_COUNTER: Self = Self(1 << 0);
    pub const SHADER_STORAGE: Self = Self(1 << 1);
    pub const VERTEX_ATTRIBUTE: Self = Self(1 << 2);
    pub const INDEX_BUFFER: Self = Self(1 << 3);

    /// Everything a CPU readback of generated counters depends on
    pub const READBACK: Self = Self((1 << 0) | (1 << 1));
    /// Everything a draw of generated geometry depends on
    pub const DRAW_INPUT: Self = Self((1 << 2) | (1 << 3));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for MemoryBarrier {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// How a compute kernel accesses a bound storage buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAccess {
    ReadOnly,
    ReadWrite,
}

/// Device limits the orchestration layer checks before dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    pub max_workgroups_per_dimension: u32,
    pub max_storage_buffer_binding_size: u64,
}

impl Default for BackendLimits {
    fn default() -> Self {
        // Guaranteed minimums for any WebGPU-class device
        Self {
            max_workgroups_per_dimension: 65_535,
            max_storage_buffer_binding_size: 128 << 20,
        }
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::RENDER_ATTACHMENT,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Per-vertex buffer layout
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Mesh vertex with position, normal, UV, and tangent.
///
/// Attributes absent from the source file stay zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: Vec4::ZERO,
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
                VertexAttribute {
                    location: 3,
                    format: VertexFormat::Float32x4,
                    offset: 32,
                },
            ],
        }
    }
}

/// Faces discarded by the rasterizer. Triangles wind counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Less,
    LessEqual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.array_stride, 48);
        let last = layout.attributes.last().unwrap();
        assert_eq!(last.offset + last.format.size(), layout.array_stride);
    }

    #[test]
    fn test_barrier_groups() {
        assert!(MemoryBarrier::READBACK.contains(MemoryBarrier::ATOMIC_COUNTER));
        assert!(MemoryBarrier::READBACK.contains(MemoryBarrier::SHADER_STORAGE));
        assert!(!MemoryBarrier::READBACK.contains(MemoryBarrier::INDEX_BUFFER));
        assert_eq!(
            MemoryBarrier::VERTEX_ATTRIBUTE | MemoryBarrier::INDEX_BUFFER,
            MemoryBarrier::DRAW_INPUT
        );
    }

    #[test]
    fn test_buffer_usage_flags() {
        let usage = BufferUsage::STORAGE | BufferUsage::VERTEX | BufferUsage::COPY_SRC;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(usage.contains(BufferUsage::VERTEX | BufferUsage::COPY_SRC));
        assert!(!usage.contains(BufferUsage::INDEX));
    }
}
