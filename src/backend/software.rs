//! Software backend for headless runs and tests.
//!
//! Buffers live in host memory. Compute pipelines resolve to CPU kernels
//! registered under their entry point name, and dispatches execute
//! immediately against the buffers bound at that moment. Render passes are
//! not rasterized; draws are recorded so callers can inspect them. Every
//! operation is also appended to a command log, which is how tests check
//! ordering of barriers, bindings and readbacks.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::{self, ShaderDefines};
use bytemuck::Pod;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

/// CPU implementation of a compute entry point
pub trait SoftwareKernel: Send + Sync {
    fn execute(&self, invocation: &mut KernelInvocation<'_>) -> BackendResult<()>;
}

struct BoundStorage {
    handle: BufferHandle,
    access: StorageAccess,
    data: Vec<u8>,
}

/// View of one dispatch: its grid size, its variant defines and the
/// storage buffers bound when it was issued.
pub struct KernelInvocation<'a> {
    pub workgroups: [u32; 3],
    pub defines: &'a ShaderDefines,
    bindings: BTreeMap<u32, BoundStorage>,
}

impl<'a> KernelInvocation<'a> {
    fn bound(&self, binding: u32) -> BackendResult<&BoundStorage> {
        self.bindings
            .get(&binding)
            .ok_or_else(|| BackendError::Binding(format!("nothing bound at binding {}", binding)))
    }

    /// Raw bytes of the buffer bound at `binding`
    pub fn storage(&self, binding: u32) -> BackendResult<&[u8]> {
        Ok(&self.bound(binding)?.data)
    }

    /// Mutable bytes of a read-write binding
    pub fn storage_mut(&mut self, binding: u32) -> BackendResult<&mut [u8]> {
        let bound = self
            .bindings
            .get_mut(&binding)
            .ok_or_else(|| BackendError::Binding(format!("nothing bound at binding {}", binding)))?;
        if bound.access == StorageAccess::ReadOnly {
            return Err(BackendError::Binding(format!(
                "binding {} is read-only",
                binding
            )));
        }
        Ok(&mut bound.data)
    }

    /// Decode the whole binding as an array of `T`, ignoring trailing bytes
    pub fn read_array<T: Pod>(&self, binding: u32) -> BackendResult<Vec<T>> {
        let data = self.storage(binding)?;
        Ok(data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn read<T: Pod>(&self, binding: u32, byte_offset: usize) -> BackendResult<T> {
        let data = self.storage(binding)?;
        let end = byte_offset + std::mem::size_of::<T>();
        let bytes = data.get(byte_offset..end).ok_or(BackendError::OutOfRange {
            offset: byte_offset as u64,
            size: std::mem::size_of::<T>() as u64,
            capacity: data.len() as u64,
        })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write<T: Pod>(&mut self, binding: u32, byte_offset: usize, value: &T) -> BackendResult<()> {
        let data = self.storage_mut(binding)?;
        let bytes = bytemuck::bytes_of(value);
        let capacity = data.len() as u64;
        let target = data
            .get_mut(byte_offset..byte_offset + bytes.len())
            .ok_or(BackendError::OutOfRange {
                offset: byte_offset as u64,
                size: bytes.len() as u64,
                capacity,
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Add to a `u32` in place and return its previous value (wrapping, like `atomicAdd`)
    pub fn fetch_add_u32(&mut self, binding: u32, byte_offset: usize, value: u32) -> BackendResult<u32> {
        let previous: u32 = self.read(binding, byte_offset)?;
        self.write(binding, byte_offset, &previous.wrapping_add(value))?;
        Ok(previous)
    }
}

/// A recorded draw call
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pipeline: Option<RenderPipelineHandle>,
    pub vertex_buffer: Option<(BufferHandle, u64)>,
    pub index_buffer: Option<(BufferHandle, u64, IndexFormat)>,
    pub indices: Range<u32>,
    pub base_vertex: i32,
    pub instances: Range<u32>,
}

/// Entry in the software backend's command log
#[derive(Debug, Clone, PartialEq)]
pub enum SoftwareCommand {
    WriteBuffer { buffer: BufferHandle, offset: u64, len: u64 },
    ReadBuffer { buffer: BufferHandle, offset: u64, size: u64 },
    BeginComputePass { label: Option<String> },
    EndComputePass,
    BindStorage { binding: u32, buffer: BufferHandle, access: StorageAccess },
    UnbindStorage { binding: u32 },
    Dispatch { pipeline: ComputePipelineHandle, workgroups: [u32; 3] },
    Barrier(MemoryBarrier),
    BeginRenderPass { label: Option<String> },
    EndRenderPass,
    Draw(DrawCall),
    Submit,
}

struct SoftwareBuffer {
    label: Option<String>,
    usage: BufferUsage,
    data: Vec<u8>,
}

struct SoftwarePipeline {
    label: Option<String>,
    kernel: Arc<dyn SoftwareKernel>,
    defines: ShaderDefines,
}

/// Host-memory backend
pub struct SoftwareBackend {
    limits: BackendLimits,
    max_buffers: Option<usize>,
    validate_shaders: bool,
    kernels: HashMap<String, Arc<dyn SoftwareKernel>>,

    // Resource storage
    buffers: HashMap<u64, SoftwareBuffer>,
    textures: HashMap<u64, TextureDescriptor>,
    texture_views: HashMap<u64, u64>,
    render_pipelines: HashMap<u64, RenderPipelineDescriptor>,
    compute_pipelines: HashMap<u64, SoftwarePipeline>,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_view_id: u64,
    next_render_pipeline_id: u64,
    next_compute_pipeline_id: u64,

    // Binding state
    in_compute_pass: bool,
    in_render_pass: bool,
    compute_pipeline: Option<ComputePipelineHandle>,
    render_pipeline: Option<RenderPipelineHandle>,
    storage_bindings: BTreeMap<u32, (BufferHandle, StorageAccess)>,
    vertex_buffer: Option<(BufferHandle, u64)>,
    index_buffer: Option<(BufferHandle, u64, IndexFormat)>,

    commands: Vec<SoftwareCommand>,
    failures: Vec<String>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            limits: BackendLimits::default(),
            max_buffers: None,
            validate_shaders: true,
            kernels: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            next_buffer_id: 1,
            next_texture_id: 1,
            next_view_id: 1,
            next_render_pipeline_id: 1,
            next_compute_pipeline_id: 1,
            in_compute_pass: false,
            in_render_pass: false,
            compute_pipeline: None,
            render_pipeline: None,
            storage_bindings: BTreeMap::new(),
            vertex_buffer: None,
            index_buffer: None,
            commands: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Override the reported device limits
    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Fail buffer creation once `count` buffers are alive, like a device out of memory
    pub fn with_buffer_budget(mut self, count: usize) -> Self {
        self.max_buffers = Some(count);
        self
    }

    /// Skip WGSL parsing and validation when creating compute pipelines
    pub fn without_shader_validation(mut self) -> Self {
        self.validate_shaders = false;
        self
    }

    /// Register the CPU implementation used for pipelines with this entry point
    pub fn register_kernel(&mut self, entry_point: impl Into<String>, kernel: Arc<dyn SoftwareKernel>) {
        self.kernels.insert(entry_point.into(), kernel);
    }

    /// Everything recorded so far, in issue order
    pub fn commands(&self) -> &[SoftwareCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Recorded draw calls, in issue order
    pub fn draw_calls(&self) -> Vec<&DrawCall> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                SoftwareCommand::Draw(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Errors that a real device would have reported asynchronously
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Storage currently bound at `binding`
    pub fn bound_storage(&self, binding: u32) -> Option<BufferHandle> {
        self.storage_bindings.get(&binding).map(|(handle, _)| *handle)
    }

    /// Direct view of a buffer's contents
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Descriptor a render pipeline was created with
    pub fn render_pipeline(&self, pipeline: RenderPipelineHandle) -> Option<&RenderPipelineDescriptor> {
        self.render_pipelines.get(&pipeline.0)
    }

    /// Defines a compute pipeline was created with
    pub fn pipeline_defines(&self, pipeline: ComputePipelineHandle) -> Option<&ShaderDefines> {
        self.compute_pipelines.get(&pipeline.0).map(|p| &p.defines)
    }

    fn fail(&mut self, message: String) {
        log::error!("SoftwareBackend: {}", message);
        self.failures.push(message);
    }

    fn validate_wgsl(source: &str, entry_point: &str) -> BackendResult<()> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| BackendError::ShaderCreationFailed(e.emit_to_string(source)))?;

        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        )
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(e.into_inner().to_string()))?;

        if !module.entry_points.iter().any(|ep| ep.name == entry_point) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "entry point `{}` not found in shader",
                entry_point
            )));
        }
        Ok(())
    }

    fn run_dispatch(&mut self, pipeline: ComputePipelineHandle, workgroups: [u32; 3]) -> BackendResult<()> {
        let (kernel, defines, label) = {
            let p = self
                .compute_pipelines
                .get(&pipeline.0)
                .ok_or(BackendError::InvalidHandle {
                    kind: "compute pipeline",
                    id: pipeline.0,
                })?;
            (p.kernel.clone(), p.defines.clone(), p.label.clone())
        };

        let mut bindings = BTreeMap::new();
        let mut failure = None;
        for (&binding, &(handle, access)) in &self.storage_bindings {
            if bindings.values().any(|b: &BoundStorage| b.handle == handle) {
                failure = Some(BackendError::Binding(format!(
                    "buffer {} is bound to more than one binding",
                    handle.0
                )));
                continue;
            }
            match self.buffers.get_mut(&handle.0) {
                Some(buffer) => {
                    let data = std::mem::take(&mut buffer.data);
                    bindings.insert(binding, BoundStorage { handle, access, data });
                }
                None => {
                    failure = Some(BackendError::InvalidHandle {
                        kind: "buffer",
                        id: handle.0,
                    });
                }
            }
        }

        let result = match failure {
            Some(err) => Err(err),
            None => {
                log::trace!(
                    "SoftwareBackend: dispatch {:?} {:?} [{}]",
                    label,
                    workgroups,
                    defines
                );
                let mut invocation = KernelInvocation {
                    workgroups,
                    defines: &defines,
                    bindings,
                };
                let result = kernel.execute(&mut invocation);
                bindings = invocation.bindings;
                result
            }
        };

        // Hand the storage back whether or not the kernel succeeded
        for bound in bindings.into_values() {
            if let Some(buffer) = self.buffers.get_mut(&bound.handle.0) {
                buffer.data = bound.data;
            }
        }
        result
    }
}

impl GraphicsBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software Backend"
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.create_buffer_init(desc, &[])
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        if (data.len() as u64) > desc.size && desc.size != 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{} bytes of initial data exceed buffer size {}",
                data.len(),
                desc.size
            )));
        }
        if let Some(max) = self.max_buffers.filter(|max| self.buffers.len() >= *max) {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?}: budget of {} buffers exhausted",
                desc.label, max
            )));
        }
        log::trace!(
            "SoftwareBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );

        let size = desc.size.max(data.len() as u64) as usize;
        let mut contents = vec![0u8; size];
        contents[..data.len()].copy_from_slice(data);

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            SoftwareBuffer {
                label: desc.label.clone(),
                usage: desc.usage,
                data: contents,
            },
        );

        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(buf) = self.buffers.get_mut(&buffer.0) else {
            self.fail(format!("write to unknown buffer {}", buffer.0));
            return;
        };
        let start = offset as usize;
        let Some(target) = buf.data.get_mut(start..start + data.len()) else {
            let message = format!(
                "write of {} bytes at {} overflows buffer {:?} ({} bytes)",
                data.len(),
                offset,
                buf.label,
                buf.data.len()
            );
            self.fail(message);
            return;
        };
        target.copy_from_slice(data);
        self.commands.push(SoftwareCommand::WriteBuffer {
            buffer,
            offset,
            len: data.len() as u64,
        });
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let buf = self.buffers.get(&buffer.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if !buf.usage.contains(BufferUsage::COPY_SRC) {
            return Err(BackendError::ReadbackFailed(format!(
                "buffer {:?} was not created with COPY_SRC",
                buf.label
            )));
        }
        let start = offset as usize;
        let bytes = buf
            .data
            .get(start..start + size as usize)
            .ok_or(BackendError::OutOfRange {
                offset,
                size,
                capacity: buf.data.len() as u64,
            })?
            .to_vec();
        self.commands.push(SoftwareCommand::ReadBuffer {
            buffer,
            offset,
            size,
        });
        Ok(bytes)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "texture {:?} has zero extent",
                desc.label
            )));
        }
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed("Texture not found".into()));
        }
        let id = self.next_view_id;
        self.next_view_id += 1;
        self.texture_views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if self.validate_shaders {
            Self::validate_wgsl(&desc.shader, "vs_main")?;
        }
        if desc.vertex_layouts.is_empty() {
            log::debug!("SoftwareBackend: render pipeline {:?} has no vertex input", desc.label);
        }
        let id = self.next_render_pipeline_id;
        self.next_render_pipeline_id += 1;
        self.render_pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let source = shader::preprocess(&desc.shader, &desc.defines)
            .map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?;
        if self.validate_shaders {
            Self::validate_wgsl(&source, &desc.entry_point)?;
        }

        let kernel = self.kernels.get(&desc.entry_point).cloned().ok_or_else(|| {
            BackendError::PipelineCreationFailed(format!(
                "no software kernel registered for entry point `{}`",
                desc.entry_point
            ))
        })?;

        log::trace!(
            "SoftwareBackend: creating compute pipeline {:?} [{}]",
            desc.label,
            desc.defines
        );

        let id = self.next_compute_pipeline_id;
        self.next_compute_pipeline_id += 1;
        self.compute_pipelines.insert(
            id,
            SoftwarePipeline {
                label: desc.label.clone(),
                kernel,
                defines: desc.defines.clone(),
            },
        );
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        let views = desc
            .color_attachments
            .iter()
            .map(|a| (a.view, false))
            .chain(desc.depth_stencil_attachment.as_ref().map(|a| (a.view, true)));
        let mut problems = Vec::new();
        for (view, depth) in views {
            let format = self
                .texture_views
                .get(&view.0)
                .and_then(|texture| self.textures.get(texture))
                .map(|desc| desc.format);
            match format {
                None => problems.push(format!("render pass uses unknown view {}", view.0)),
                Some(format) if format.is_depth() != depth => problems.push(format!(
                    "view {} with format {:?} attached as {} target",
                    view.0,
                    format,
                    if depth { "depth" } else { "color" }
                )),
                Some(_) => {}
            }
        }
        for problem in problems {
            self.fail(problem);
        }
        self.in_render_pass = true;
        self.render_pipeline = None;
        self.vertex_buffer = None;
        self.index_buffer = None;
        self.commands.push(SoftwareCommand::BeginRenderPass {
            label: desc.label.clone(),
        });
    }

    fn end_render_pass(&mut self) {
        if self.in_render_pass {
            self.in_render_pass = false;
            self.commands.push(SoftwareCommand::EndRenderPass);
        }
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.in_compute_pass = true;
        self.compute_pipeline = None;
        self.commands.push(SoftwareCommand::BeginComputePass {
            label: label.map(str::to_string),
        });
    }

    fn end_compute_pass(&mut self) {
        if self.in_compute_pass {
            self.in_compute_pass = false;
            self.commands.push(SoftwareCommand::EndComputePass);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if self.in_render_pass {
            self.render_pipeline = Some(pipeline);
        }
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        if self.in_compute_pass {
            self.compute_pipeline = Some(pipeline);
        }
    }

    fn bind_storage_buffer(&mut self, binding: u32, buffer: BufferHandle, access: StorageAccess) {
        self.storage_bindings.insert(binding, (buffer, access));
        self.commands.push(SoftwareCommand::BindStorage {
            binding,
            buffer,
            access,
        });
    }

    fn unbind_storage_buffer(&mut self, binding: u32) {
        self.storage_bindings.remove(&binding);
        self.commands.push(SoftwareCommand::UnbindStorage { binding });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if !self.in_render_pass {
            return;
        }
        if slot != 0 {
            log::warn!("SoftwareBackend: only vertex slot 0 is tracked (got {})", slot);
            return;
        }
        self.vertex_buffer = Some((buffer, offset));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if self.in_render_pass {
            self.index_buffer = Some((buffer, offset, format));
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if !self.in_render_pass {
            self.fail("draw_indexed outside of a render pass".into());
            return;
        }
        let call = DrawCall {
            pipeline: self.render_pipeline,
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            indices,
            base_vertex,
            instances,
        };
        self.commands.push(SoftwareCommand::Draw(call));
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        if !self.in_compute_pass {
            self.fail("dispatch outside of a compute pass".into());
            return;
        }
        let Some(pipeline) = self.compute_pipeline else {
            self.fail("dispatch without a compute pipeline".into());
            return;
        };
        self.commands.push(SoftwareCommand::Dispatch {
            pipeline,
            workgroups: [x, y, z],
        });
        if let Err(err) = self.run_dispatch(pipeline, [x, y, z]) {
            self.fail(format!("dispatch failed: {}", err));
        }
    }

    fn memory_barrier(&mut self, barrier: MemoryBarrier) {
        log::trace!("SoftwareBackend: barrier {:#x}", barrier.bits());
        self.commands.push(SoftwareCommand::Barrier(barrier));
    }

    fn submit(&mut self) {
        self.commands.push(SoftwareCommand::Submit);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.storage_bindings.retain(|_, (handle, _)| *handle != buffer);
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.texture_views.retain(|_, tex| *tex != texture.0);
        self.textures.remove(&texture.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILL_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(${SIZE})
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&values)) {
        values[id.x] = id.x;
    }
}
"#;

    struct Fill;

    impl SoftwareKernel for Fill {
        fn execute(&self, invocation: &mut KernelInvocation<'_>) -> BackendResult<()> {
            let size: u32 = invocation.defines.parse("SIZE").unwrap_or(1);
            let invocations = invocation.workgroups[0] * size;
            let len = invocation.storage(0)?.len() / 4;
            for i in 0..invocations.min(len as u32) {
                invocation.write(0, i as usize * 4, &i)?;
            }
            Ok(())
        }
    }

    fn storage_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            label: Some("test".into()),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        }
    }

    fn fill_pipeline(backend: &mut SoftwareBackend) -> ComputePipelineHandle {
        backend.register_kernel("fill", Arc::new(Fill));
        backend
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some("fill".into()),
                shader: FILL_SHADER.into(),
                entry_point: "fill".into(),
                defines: ShaderDefines::new().value("SIZE", 4),
            })
            .unwrap()
    }

    #[test]
    fn test_buffer_write_and_read() {
        let mut backend = SoftwareBackend::new();
        let buffer = backend.create_buffer(&storage_desc(16)).unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]);

        let bytes = backend.read_buffer(buffer, 0, 8).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(backend.read_buffer(buffer, 12, 8).is_err());
    }

    #[test]
    fn test_write_out_of_range_is_reported() {
        let mut backend = SoftwareBackend::new();
        let buffer = backend.create_buffer(&storage_desc(4)).unwrap();
        backend.write_buffer(buffer, 2, &[0; 4]);
        assert_eq!(backend.failures().len(), 1);
    }

    #[test]
    fn test_dispatch_runs_registered_kernel() {
        let mut backend = SoftwareBackend::new();
        let pipeline = fill_pipeline(&mut backend);
        let buffer = backend.create_buffer(&storage_desc(32)).unwrap();

        backend.begin_compute_pass(Some("fill"));
        backend.set_compute_pipeline(pipeline);
        backend.bind_storage_buffer(0, buffer, StorageAccess::ReadWrite);
        backend.dispatch_compute(1, 1, 1);
        backend.end_compute_pass();

        let bytes = backend.read_buffer(buffer, 0, 32).unwrap();
        let values: Vec<u32> = bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        // one workgroup of four invocations
        assert_eq!(values, vec![0, 1, 2, 3, 0, 0, 0, 0]);
        assert!(backend.failures().is_empty());
    }

    #[test]
    fn test_read_only_binding_rejects_writes() {
        let mut backend = SoftwareBackend::new();
        let pipeline = fill_pipeline(&mut backend);
        let buffer = backend.create_buffer(&storage_desc(16)).unwrap();

        backend.begin_compute_pass(None);
        backend.set_compute_pipeline(pipeline);
        backend.bind_storage_buffer(0, buffer, StorageAccess::ReadOnly);
        backend.dispatch_compute(1, 1, 1);
        backend.end_compute_pass();

        assert_eq!(backend.failures().len(), 1);
        // storage is returned to the buffer even when the kernel fails
        assert_eq!(backend.buffer_contents(buffer).map(<[u8]>::len), Some(16));
    }

    #[test]
    fn test_missing_kernel_fails_pipeline_creation() {
        let mut backend = SoftwareBackend::new();
        let result = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: None,
            shader: FILL_SHADER.into(),
            entry_point: "fill".into(),
            defines: ShaderDefines::new().value("SIZE", 4),
        });
        assert!(matches!(result, Err(BackendError::PipelineCreationFailed(_))));
    }

    #[test]
    fn test_invalid_wgsl_is_rejected() {
        let mut backend = SoftwareBackend::new();
        backend.register_kernel("fill", Arc::new(Fill));
        let result = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: None,
            shader: "fn fill( {".into(),
            entry_point: "fill".into(),
            defines: ShaderDefines::new(),
        });
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }

    #[test]
    fn test_draw_records_bound_state() {
        let mut backend = SoftwareBackend::new();
        let vb = backend.create_buffer(&storage_desc(64)).unwrap();
        let ib = backend.create_buffer(&storage_desc(64)).unwrap();
        let texture = backend
            .create_texture(&TextureDescriptor {
                width: 8,
                height: 8,
                ..Default::default()
            })
            .unwrap();
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
        backend.set_vertex_buffer(0, vb, 16);
        backend.set_index_buffer(ib, 16, IndexFormat::Uint32);
        backend.draw_indexed(0..6, 0, 0..1);
        backend.end_render_pass();

        let draws = backend.draw_calls();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].vertex_buffer, Some((vb, 16)));
        assert_eq!(draws[0].index_buffer, Some((ib, 16, IndexFormat::Uint32)));
        assert_eq!(draws[0].indices, 0..6);
    }

    #[test]
    fn test_buffer_budget_fails_creation() {
        let mut backend = SoftwareBackend::new().with_buffer_budget(1);
        let first = backend.create_buffer(&storage_desc(16)).unwrap();
        assert!(matches!(
            backend.create_buffer(&storage_desc(16)),
            Err(BackendError::BufferCreationFailed(_))
        ));

        backend.destroy_buffer(first);
        assert!(backend.create_buffer(&storage_desc(16)).is_ok());
    }

    #[test]
    fn test_depth_texture_as_color_target_is_reported() {
        let mut backend = SoftwareBackend::new();
        let depth = backend
            .create_texture(&TextureDescriptor {
                format: TextureFormat::Depth32Float,
                ..Default::default()
            })
            .unwrap();
        let view = backend.create_texture_view(depth).unwrap();

        backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment {
                view,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        backend.end_render_pass();
        assert_eq!(backend.failures().len(), 1);
        assert!(backend.failures()[0].contains("color"));
    }
}
