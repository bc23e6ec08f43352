//! Generated geometry output
//!
//! Two storage buffers the tiling kernel appends to. Each starts with a
//! 16-byte [`StreamHeader`]; the payload follows immediately. The kernel
//! reserves three slots at a time by advancing `count`, which never moves
//! past `capacity`; a reservation that would not fit bumps `dropped` instead.
//! Drawing binds both buffers offset past the header.

use crate::backend::{
    BackendError, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
    MemoryBarrier, StorageAccess, VertexAttribute, VertexBufferLayout, VertexFormat,
};
use bytemuck::{Pod, Zeroable};

/// Size of the counter header in front of each payload
pub const STREAM_HEADER_SIZE: u64 = std::mem::size_of::<StreamHeader>() as u64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StreamHeader {
    /// Elements reserved so far, including reservations that overflowed
    pub count: u32,
    /// Triangles that did not fit
    pub dropped: u32,
    /// Payload capacity in elements
    pub capacity: u32,
    pub _padding: u32,
}

impl StreamHeader {
    fn cleared(capacity: u32) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Reserved elements that actually landed in the payload
    fn written(&self) -> u32 {
        self.count.min(self.capacity - self.capacity % 3)
    }
}

/// Vertex produced by the tiling kernel (WGSL `OutputVertex`, 32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct OutputVertex {
    /// xyz position, w = 1
    pub position: [f32; 4],
    /// xyz normal, w unused
    pub normal: [f32; 4],
}

impl OutputVertex {
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
                    offset: 16,
                },
            ],
        }
    }
}

/// Where a stream is in the reset, dispatch, readback cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Dispatched,
    Readable,
}

/// Counters read back after a dispatch, clamped to what fits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratedGeometry {
    pub vertices: u32,
    pub indices: u32,
    pub dropped_triangles: u32,
}

impl GeneratedGeometry {
    pub fn triangles(&self) -> u32 {
        self.indices / 3
    }

    pub fn overflowed(&self) -> bool {
        self.dropped_triangles > 0
    }
}

/// Append-only vertex and index buffers filled by the tiling kernel
#[derive(Debug)]
pub struct GpuMeshStream {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    max_vertices: u32,
    max_indices: u32,
    phase: StreamPhase,
}

impl GpuMeshStream {
    /// Create both buffers with zeroed counters
    pub fn allocate(
        backend: &mut dyn GraphicsBackend,
        max_vertices: u32,
        max_indices: u32,
    ) -> Result<Self, BackendError> {
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;

        // Runtime-sized arrays must be able to hold at least one element when bound
        let vertex_size = STREAM_HEADER_SIZE
            + u64::from(max_vertices.max(1)) * std::mem::size_of::<OutputVertex>() as u64;
        let index_size = STREAM_HEADER_SIZE + u64::from(max_indices.max(1)) * 4;

        let vertex_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("Generated Vertices".into()),
            size: vertex_size,
            usage: usage | BufferUsage::VERTEX,
        })?;
        let index_buffer = match backend.create_buffer(&BufferDescriptor {
            label: Some("Generated Indices".into()),
            size: index_size,
            usage: usage | BufferUsage::INDEX,
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_buffer(vertex_buffer);
                return Err(err);
            }
        };

        log::debug!(
            "Allocated output stream: {} vertices ({} bytes), {} indices ({} bytes)",
            max_vertices,
            vertex_size,
            max_indices,
            index_size
        );

        let mut stream = Self {
            vertex_buffer,
            index_buffer,
            max_vertices,
            max_indices,
            phase: StreamPhase::Idle,
        };
        stream.reset(backend);
        Ok(stream)
    }

    /// Zero both counters. Payload contents are left as they are.
    pub fn reset(&mut self, backend: &mut dyn GraphicsBackend) {
        backend.write_buffer(
            self.vertex_buffer,
            0,
            bytemuck::bytes_of(&StreamHeader::cleared(self.max_vertices)),
        );
        backend.write_buffer(
            self.index_buffer,
            0,
            bytemuck::bytes_of(&StreamHeader::cleared(self.max_indices)),
        );
        self.phase = StreamPhase::Idle;
    }

    /// Bind both buffers as writable storage
    pub fn bind(&self, backend: &mut dyn GraphicsBackend, vertex_binding: u32, index_binding: u32) {
        backend.bind_storage_buffer(vertex_binding, self.vertex_buffer, StorageAccess::ReadWrite);
        backend.bind_storage_buffer(index_binding, self.index_buffer, StorageAccess::ReadWrite);
    }

    pub(crate) fn mark_dispatched(&mut self) {
        if self.phase != StreamPhase::Idle {
            log::warn!("Dispatching into an output stream that was not reset; results append");
        }
        self.phase = StreamPhase::Dispatched;
    }

    fn read_header(
        backend: &mut dyn GraphicsBackend,
        buffer: BufferHandle,
    ) -> Result<StreamHeader, BackendError> {
        let bytes = backend.read_buffer(buffer, 0, STREAM_HEADER_SIZE)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Wait for the kernel's writes and read back both counters
    pub fn generated(&mut self, backend: &mut dyn GraphicsBackend) -> Result<GeneratedGeometry, BackendError> {
        backend.memory_barrier(MemoryBarrier::READBACK);

        let vertices = Self::read_header(backend, self.vertex_buffer)?;
        let indices = Self::read_header(backend, self.index_buffer)?;

        let generated = GeneratedGeometry {
            vertices: vertices.written(),
            indices: indices.written(),
            dropped_triangles: vertices.dropped.saturating_add(indices.dropped),
        };

        if generated.overflowed() {
            log::warn!(
                "Output stream overflowed: {} triangles dropped (capacity {} vertices, {} indices)",
                generated.dropped_triangles,
                self.max_vertices,
                self.max_indices
            );
        }
        if self.phase == StreamPhase::Dispatched {
            self.phase = StreamPhase::Readable;
        }
        Ok(generated)
    }

    /// Number of indices generated by the last dispatch
    pub fn generated_count(&mut self, backend: &mut dyn GraphicsBackend) -> Result<u32, BackendError> {
        Ok(self.generated(backend)?.indices)
    }

    /// Record an indexed draw of the first `count` generated indices.
    ///
    /// Must be called inside a render pass whose pipeline consumes
    /// [`OutputVertex::layout`]. `count` should come from
    /// [`generated_count`](Self::generated_count); it is not checked against
    /// the buffer capacity.
    pub fn draw(&self, backend: &mut dyn GraphicsBackend, count: u32) {
        if count == 0 {
            return;
        }
        if self.phase != StreamPhase::Readable {
            log::warn!("Drawing an output stream whose counters were not read back");
        }

        backend.memory_barrier(MemoryBarrier::DRAW_INPUT);
        backend.set_vertex_buffer(0, self.vertex_buffer, STREAM_HEADER_SIZE);
        backend.set_index_buffer(self.index_buffer, STREAM_HEADER_SIZE, IndexFormat::Uint32);
        backend.draw_indexed(0..count, 0, 0..1);
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn max_vertices(&self) -> u32 {
        self.max_vertices
    }

    pub fn max_indices(&self) -> u32 {
        self.max_indices
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}
