//! Offscreen preview of generated geometry
//!
//! A top-down orthographic view: world XZ inside the view window maps onto
//! the render target, and height (world Y) becomes depth so taller geometry
//! wins the depth test. Fragments are colored by their normal. The view is
//! baked into the shader text, so changing it means building a new pipeline.

use crate::backend::{
    BackendError, BackendResult, ColorAttachment, CompareFunction, CullMode, DepthStencilAttachment,
    DepthStencilState, GraphicsBackend, LoadOp, RenderPassDescriptor, RenderPipelineDescriptor,
    RenderPipelineHandle, StoreOp, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
    TextureViewHandle, Vertex, VertexBufferLayout,
};
use crate::shader::{self, ShaderDefines};
use crate::streams::OutputVertex;
use glam::{Vec2, Vec3};

pub const PREVIEW_COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const PREVIEW_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Vertex inputs: position at location 0, normal at location 1
pub const PREVIEW_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
}

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
}

const VIEW_CENTER: vec2<f32> = vec2<f32>(${VIEW_CENTER_X}, ${VIEW_CENTER_Z});
const VIEW_HALF_EXTENT: f32 = ${VIEW_HALF_EXTENT};
const VIEW_HEIGHT: f32 = ${VIEW_HEIGHT};

@vertex
fn vs_main(vertex: VertexInput) -> VertexOutput {
    var result: VertexOutput;
    let xz = (vertex.position.xz - VIEW_CENTER) / VIEW_HALF_EXTENT;
    let depth = clamp(0.5 - 0.5 * vertex.position.y / VIEW_HEIGHT, 0.0, 1.0);
    result.clip = vec4<f32>(xz.x, -xz.y, depth, 1.0);
    result.normal = vertex.normal;
    return result;
}

@fragment
fn fs_main(fragment: VertexOutput) -> @location(0) vec4<f32> {
    let len = length(fragment.normal);
    var n = vec3<f32>(0.0, 1.0, 0.0);
    if (len > 0.0) {
        n = fragment.normal / len;
    }
    return vec4<f32>(n * 0.5 + 0.5, 1.0);
}
"#;

/// Square XZ window the preview looks down on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewView {
    pub center: Vec2,
    pub half_extent: f32,
    /// Heights in `-height..=height` map onto the depth range
    pub height: f32,
}

impl Default for PreviewView {
    fn default() -> Self {
        Self {
            center: Vec2::ZERO,
            half_extent: 1.0,
            height: 1.0,
        }
    }
}

impl PreviewView {
    /// Smallest view containing every point, with a little margin
    pub fn fit(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for p in points {
            min = min.min(p);
            max = max.max(p);
        }
        if min.x > max.x {
            return Self::default();
        }
        let size = max - min;
        Self {
            center: Vec2::new(min.x + max.x, min.z + max.z) * 0.5,
            half_extent: (size.x.max(size.z) * 0.5 * 1.05).max(1e-3),
            height: min.y.abs().max(max.y.abs()).max(1e-3),
        }
    }

    fn defines(&self) -> ShaderDefines {
        // Debug formatting keeps a decimal point, which WGSL needs for float literals
        ShaderDefines::new()
            .value("VIEW_CENTER_X", format!("{:?}", self.center.x))
            .value("VIEW_CENTER_Z", format!("{:?}", self.center.y))
            .value("VIEW_HALF_EXTENT", format!("{:?}", self.half_extent))
            .value("VIEW_HEIGHT", format!("{:?}", self.height))
    }
}

/// Render pipeline drawing triangles with [`PREVIEW_SHADER`]
#[derive(Debug, Clone, Copy)]
pub struct PreviewPipeline {
    pipeline: RenderPipelineHandle,
}

impl PreviewPipeline {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        layout: VertexBufferLayout,
        cull_mode: CullMode,
        view: &PreviewView,
    ) -> BackendResult<Self> {
        let source = shader::preprocess(PREVIEW_SHADER, &view.defines())
            .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?;
        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(label.into()),
            shader: source,
            has_fragment: true,
            vertex_layouts: vec![layout],
            cull_mode,
            depth_stencil: Some(DepthStencilState {
                format: PREVIEW_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: vec![PREVIEW_COLOR_FORMAT],
        })?;
        log::info!("Created preview pipeline {:?}", label);
        Ok(Self { pipeline })
    }

    /// For kernel output. Blades are seen from both sides, so nothing is culled.
    pub fn for_generated(backend: &mut dyn GraphicsBackend, view: &PreviewView) -> BackendResult<Self> {
        Self::new(backend, "Generated Preview", OutputVertex::layout(), CullMode::None, view)
    }

    /// For loaded [`crate::resources::Mesh`] parts
    pub fn for_mesh(backend: &mut dyn GraphicsBackend, view: &PreviewView) -> BackendResult<Self> {
        Self::new(backend, "Mesh Preview", Vertex::layout(), CullMode::Back, view)
    }

    /// Make this the pipeline for subsequent draws in the open render pass
    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_render_pipeline(self.pipeline);
    }

    pub fn handle(&self) -> RenderPipelineHandle {
        self.pipeline
    }
}

/// Color and depth textures a preview renders into
#[derive(Debug)]
pub struct PreviewTarget {
    color: TextureHandle,
    color_view: TextureViewHandle,
    depth: TextureHandle,
    depth_view: TextureViewHandle,
    width: u32,
    height: u32,
}

impl PreviewTarget {
    pub fn new(backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> BackendResult<Self> {
        let color = backend.create_texture(&TextureDescriptor {
            label: Some("Preview Color".into()),
            width,
            height,
            format: PREVIEW_COLOR_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC | TextureUsage::TEXTURE_BINDING,
        })?;
        let depth = match backend.create_texture(&TextureDescriptor {
            label: Some("Preview Depth".into()),
            width,
            height,
            format: PREVIEW_DEPTH_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT,
        }) {
            Ok(depth) => depth,
            Err(err) => {
                backend.destroy_texture(color);
                return Err(err);
            }
        };

        let views = backend
            .create_texture_view(color)
            .and_then(|color_view| Ok((color_view, backend.create_texture_view(depth)?)));
        match views {
            Ok((color_view, depth_view)) => Ok(Self {
                color,
                color_view,
                depth,
                depth_view,
                width,
                height,
            }),
            Err(err) => {
                backend.destroy_texture(color);
                backend.destroy_texture(depth);
                Err(err)
            }
        }
    }

    /// Open a render pass clearing color to `clear` and depth to the far plane
    pub fn begin(&self, backend: &mut dyn GraphicsBackend, clear: [f32; 4]) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Preview".into()),
            color_attachments: vec![ColorAttachment {
                view: self.color_view,
                load_op: LoadOp::Clear(clear),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: self.depth_view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
            }),
        });
    }

    pub fn color(&self) -> TextureHandle {
        self.color
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture(self.color);
        backend.destroy_texture(self.depth);
    }
}
