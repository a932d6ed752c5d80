//! GPU Device Module
//!
//! The device seam of the engine. Everything above this module talks to the
//! GPU through [`GpuDevice`] and the plain-data command vocabulary defined
//! here; recorders build a [`Batch`] of [`Command`]s on the host and the
//! device replays it on submission.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::Result;

#[cfg(windows)]
pub mod d3d12;
pub mod null;

// =============================================================================
// Raw object ids
// =============================================================================

/// Device-side queue id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawQueue(pub u64);

/// Device-side fence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFence(pub u64);

/// Device-side resource id. Owned by the resource table once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawResource(pub u64);

/// Device-side descriptor heap id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHeap(pub u64);

/// Device-side swap chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawSwapChain(pub u64);

/// Compiled pipeline state (with its root signature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

/// CPU-visible descriptor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptor(pub u64);

/// GPU-visible descriptor address (shader-visible heaps only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptor(pub u64);

// =============================================================================
// Enumerations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

/// Usage role of a resource. The state tracker keeps exactly one of these
/// per resource and emits a barrier whenever the next use needs another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    UnorderedAccess,
    CopySource,
    CopyDest,
    GenericRead,
    VertexAndConstantBuffer,
    IndexBuffer,
    PixelShaderResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Render-target views, never shader visible.
    RenderTarget,
    /// Constant-buffer, shader-resource and unordered-access views.
    ShaderResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Rgba8Unorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    /// GPU-local memory.
    Default,
    /// Host-visible memory, always in `GenericRead`.
    Upload,
}

// =============================================================================
// Descriptions
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct HeapInfo {
    pub raw: RawHeap,
    pub cpu_start: CpuDescriptor,
    pub gpu_start: Option<GpuDescriptor>,
    pub increment: u32,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub allow_unordered_access: bool,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub heap: HeapType,
}

/// Where a swap chain presents to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Off-screen presentation (simulated device only).
    Headless,
    /// A Win32 window handle.
    Win32 { hwnd: isize },
}

#[derive(Debug, Clone, Copy)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: Format,
}

#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub path: PathBuf,
    pub entry_point: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub path: PathBuf,
    pub bytecode: Vec<u8>,
}

// =============================================================================
// Command vocabulary
// =============================================================================

/// A single recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier {
        resource: RawResource,
        before: ResourceState,
        after: ResourceState,
    },
    SetDescriptorHeap(RawHeap),
    SetComputePipeline(PipelineId),
    SetGraphicsPipeline(PipelineId),
    SetComputeTable {
        parameter: u32,
        base: GpuDescriptor,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ClearRenderTarget {
        view: CpuDescriptor,
        color: [f32; 4],
    },
    /// Viewport and scissor covering `width` x `height`.
    SetViewport {
        width: u32,
        height: u32,
    },
    SetRenderTarget {
        view: CpuDescriptor,
    },
    SetVertexBuffer {
        buffer: RawResource,
        size: u32,
        stride: u32,
    },
    /// 16-bit indices.
    SetIndexBuffer {
        buffer: RawResource,
        size: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    CopyResource {
        dst: RawResource,
        src: RawResource,
    },
    CopyBuffer {
        dst: RawResource,
        src: RawResource,
        size: u64,
    },
}

/// A closed recording handed to [`GpuDevice::execute`].
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub commands: Vec<Command>,
    /// Every raw resource the commands reference, without duplicates.
    pub resources: Vec<RawResource>,
}

impl Batch {
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|cmd| matches!(cmd, Command::Barrier { .. }))
            .count()
    }
}

// =============================================================================
// Device trait
// =============================================================================

/// Process-wide handle to the adapter. Every other GPU object is created
/// through it and must be released before it is dropped.
pub trait GpuDevice {
    fn adapter_name(&self) -> String;

    /// Whether presenting with tearing (vsync off) is supported.
    fn tearing_supported(&self) -> bool;

    // Queues and fences

    /// Creates a queue with `slot_count` recording allocators.
    fn create_queue(&mut self, kind: QueueKind, slot_count: usize) -> Result<RawQueue>;

    fn create_fence(&mut self, initial_value: u64) -> Result<RawFence>;

    /// Replays `batch` using the allocator of `slot` and submits it.
    fn execute(&mut self, queue: RawQueue, slot: usize, batch: &Batch) -> Result<()>;

    /// Enqueues a GPU-side signal of `fence` to `value` on `queue`.
    fn signal(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()>;

    /// Makes later work on `queue` wait until `fence` reaches `value`.
    fn queue_wait(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()>;

    fn completed_value(&self, fence: RawFence) -> u64;

    /// Blocks until `fence` reaches `value`. Returns `false` on timeout.
    fn wait_for_value(&mut self, fence: RawFence, value: u64, timeout: Duration) -> Result<bool>;

    // Descriptors

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo>;

    fn create_render_target_view(&mut self, resource: RawResource, dest: CpuDescriptor);

    fn create_unordered_access_view(&mut self, resource: RawResource, dest: CpuDescriptor);

    fn create_constant_buffer_view(&mut self, resource: RawResource, size: u64, dest: CpuDescriptor);

    // Resources

    fn create_texture(&mut self, desc: &TextureDesc, initial: ResourceState) -> Result<RawResource>;

    fn create_buffer(&mut self, desc: &BufferDesc, initial: ResourceState) -> Result<RawResource>;

    /// Maps an upload-heap buffer, copies `data` at `offset` and unmaps it.
    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> Result<()>;

    /// Drops the host reference to `resource`.
    fn release_resource(&mut self, resource: RawResource);

    // Swap chains

    fn create_swap_chain(
        &mut self,
        queue: RawQueue,
        surface: Surface,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain>;

    /// Takes a host reference to back buffer `index`.
    fn swap_chain_buffer(&mut self, swap_chain: RawSwapChain, index: u32) -> Result<RawResource>;

    /// Fails if any back buffer is still referenced by the host.
    fn resize_swap_chain(&mut self, swap_chain: RawSwapChain, width: u32, height: u32) -> Result<()>;

    fn present(&mut self, swap_chain: RawSwapChain, sync_interval: u32, allow_tearing: bool) -> Result<()>;

    fn current_back_buffer_index(&self, swap_chain: RawSwapChain) -> u32;

    // Shaders and pipelines

    fn compile_shader(&mut self, source: &ShaderSource) -> Result<ShaderBlob>;

    /// Pipeline with a root signature of two descriptor tables:
    /// UAV `u0` at parameter 0 and CBV `b0` at parameter 1.
    fn create_compute_pipeline(&mut self, shader: &ShaderBlob) -> Result<PipelineId>;

    /// Pipeline with an empty root signature, a float3 `POSITION` input and
    /// one render target of `format`.
    fn create_graphics_pipeline(
        &mut self,
        vertex: &ShaderBlob,
        pixel: &ShaderBlob,
        format: Format,
    ) -> Result<PipelineId>;
}

/// Block until `completed()` reaches `value` or `timeout` elapses.
///
/// `block` arms a wakeup for `value` and sleeps for at most the given time.
/// A wakeup is only a hint: it may belong to an older value, so the
/// completed value is read again after every one.
pub fn wait_until_reached(
    value: u64,
    timeout: Duration,
    mut completed: impl FnMut() -> u64,
    mut block: impl FnMut(Duration) -> Result<()>,
) -> Result<bool> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if completed() >= value {
            return Ok(true);
        }
        let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        if remaining.is_zero() {
            return Ok(false);
        }
        block(remaining)?;
    }
}
