//! Frame Driver Module
//!
//! Per-frame orchestration. Each call to [`FrameDriver::render_frame`] walks
//! the cycle `Idle -> Recording -> Submitted -> Presenting -> Idle`:
//!
//! 1. drain input (resize, camera)
//! 2. wait until the GPU released the current back buffer's frame slot
//! 3. record the compute and/or graphics pass against that back buffer
//! 4. submit on the direct queue and remember the fence value in the slot
//! 5. present and read back the next back-buffer index
//!
//! Everything the driver creates is released by [`FrameDriver::shutdown`],
//! which flushes every queue first.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::camera::{Camera, CameraBuffer};
use crate::constant_buffer::ConstantBuffer;
use crate::context::GpuContext;
use crate::descriptor::{DescriptorHeap, DescriptorSlot};
use crate::error::{EngineError, Result};
use crate::gpu::{
    BufferDesc, Command, DescriptorKind, Format, GpuDevice, HeapType, QueueKind, ResourceState, Surface,
    SwapChainDesc, TextureDesc,
};
use crate::input::{CameraControl, EventQueue, InputEvent};
use crate::queue::{CommandQueue, CommandRecorder};
use crate::resource::ResourceHandle;
use crate::shader::{Pipelines, ShaderLibrary};
use crate::swapchain::SwapChain;

/// Unit plane in the XY plane.
pub const PLANE_VERTICES: [[f32; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [1.0, 1.0, 0.0],
];
pub const PLANE_INDICES: [u16; 6] = [0, 1, 2, 1, 3, 2];

const SWAP_CHAIN_FORMAT: Format = Format::Rgba8Unorm;

/// Which passes a frame records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Voxel raster into the framebuffer, copied to the back buffer.
    Compute,
    /// Clear and draw the plane.
    Graphics,
    /// Compute pass, then the plane drawn on top.
    Hybrid,
}

impl RenderMode {
    fn uses_compute(self) -> bool {
        matches!(self, RenderMode::Compute | RenderMode::Hybrid)
    }

    fn uses_graphics(self) -> bool {
        matches!(self, RenderMode::Graphics | RenderMode::Hybrid)
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "compute" => Ok(RenderMode::Compute),
            "graphics" => Ok(RenderMode::Graphics),
            "hybrid" => Ok(RenderMode::Hybrid),
            other => Err(format!("unknown render mode {:?}", other)),
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderMode::Compute => "compute",
            RenderMode::Graphics => "graphics",
            RenderMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    Presenting,
}

/// Frame driver settings, built from the engine config.
#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub render_mode: RenderMode,
    pub vsync: bool,
    /// Run the dispatch on the compute queue instead of the direct queue.
    pub async_compute: bool,
    pub clear_color: [f32; 4],
    /// Edge of the compute shader's square thread group.
    pub thread_group_size: u32,
    pub fence_timeout: Duration,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            width: 800,
            height: 800,
            buffer_count: 3,
            render_mode: RenderMode::Compute,
            vsync: true,
            async_compute: false,
            clear_color: [0.4, 0.6, 0.9, 1.0],
            thread_group_size: 8,
            fence_timeout: Duration::from_millis(5000),
        }
    }
}

/// Bookkeeping for one back-buffer index.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSlot {
    /// Direct-queue value to reach before this slot is reused.
    pub fence_value: u64,
    /// Camera version held by this slot's constant buffer.
    camera_version: u64,
}

/// What happened during one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameReport {
    pub frame: u64,
    pub back_buffer: u32,
    pub next_back_buffer: u32,
    pub fence_value: u64,
    pub barriers: usize,
    pub resized: bool,
    pub close_requested: bool,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    vertex_buffer: ResourceHandle,
    index_buffer: ResourceHandle,
}

/// Drives the per-frame state machine over the three queues and the swap chain.
pub struct FrameDriver {
    ctx: GpuContext,
    direct: CommandQueue,
    compute: CommandQueue,
    copy: CommandQueue,
    swap_chain: SwapChain,
    rtv_heap: DescriptorHeap,
    view_heap: DescriptorHeap,
    framebuffer: ResourceHandle,
    framebuffer_uav: DescriptorSlot,
    camera: Camera,
    camera_control: CameraControl,
    camera_version: u64,
    camera_buffer: ConstantBuffer<CameraBuffer>,
    pipelines: Pipelines,
    geometry: Geometry,
    frame_slots: Vec<FrameSlot>,
    state: FrameState,
    settings: FrameSettings,
    frame_count: u64,
    shut_down: bool,
}

impl FrameDriver {
    /// Build queues, swap chain, pipelines and the resources every frame
    /// uses, and start the geometry upload.
    pub fn new(
        device: Box<dyn GpuDevice>,
        surface: Surface,
        shaders: &ShaderLibrary,
        settings: FrameSettings,
    ) -> Result<Self> {
        let mut ctx = GpuContext::new(device);
        info!("Initializing frame driver on {}", ctx.device.adapter_name());

        let slot_count = settings.buffer_count as usize;
        let mut direct = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, slot_count)?;
        let compute = CommandQueue::new(ctx.device_mut(), QueueKind::Compute, slot_count)?;
        let mut copy = CommandQueue::new(ctx.device_mut(), QueueKind::Copy, 1)?;

        let mut rtv_heap =
            DescriptorHeap::new(ctx.device_mut(), DescriptorKind::RenderTarget, settings.buffer_count.max(1), false)?;
        // framebuffer UAV plus one camera CBV per frame slot
        let mut view_heap =
            DescriptorHeap::new(ctx.device_mut(), DescriptorKind::ShaderResource, settings.buffer_count + 1, true)?;

        let desc = SwapChainDesc {
            width: settings.width,
            height: settings.height,
            buffer_count: settings.buffer_count,
            format: SWAP_CHAIN_FORMAT,
        };
        let swap_chain = SwapChain::create(&mut ctx, &direct, surface, &desc, &mut rtv_heap)?;

        let pipelines = shaders.load_pipelines(ctx.device_mut(), SWAP_CHAIN_FORMAT)?;

        let framebuffer_uav = view_heap.allocate()?;
        let framebuffer = create_framebuffer(&mut ctx, settings.width, settings.height, framebuffer_uav)?;

        let geometry = upload_geometry(&mut ctx, &mut copy, &mut direct)?;

        let mut camera = Camera::default();
        camera.set_aspect_ratio(settings.width, settings.height);

        info!(
            "Frame driver ready: {}x{}, {} buffers, {} mode{}",
            settings.width,
            settings.height,
            settings.buffer_count,
            settings.render_mode,
            if settings.async_compute { ", async compute" } else { "" }
        );

        Ok(Self {
            ctx,
            direct,
            compute,
            copy,
            swap_chain,
            rtv_heap,
            view_heap,
            framebuffer,
            framebuffer_uav,
            camera,
            camera_control: CameraControl::default(),
            camera_version: 1,
            camera_buffer: ConstantBuffer::new("camera", slot_count),
            pipelines,
            geometry,
            frame_slots: vec![FrameSlot::default(); slot_count],
            state: FrameState::Idle,
            settings,
            frame_count: 0,
            shut_down: false,
        })
    }

    /// Run one full frame. On error nothing of the failed frame has been
    /// submitted on the direct queue and the driver is back in `Idle`.
    pub fn render_frame(&mut self, events: &mut EventQueue) -> Result<FrameReport> {
        assert_eq!(self.state, FrameState::Idle, "render_frame re-entered");
        let result = self.run_frame(events);
        self.state = FrameState::Idle;
        if result.is_ok() {
            self.frame_count += 1;
        }
        result
    }

    fn run_frame(&mut self, events: &mut EventQueue) -> Result<FrameReport> {
        let mut report = FrameReport {
            frame: self.frame_count,
            ..FrameReport::default()
        };

        // Idle: input
        let mut resize = None;
        for event in events.drain() {
            match event {
                InputEvent::Resize { width, height } => resize = Some((width, height)),
                InputEvent::CloseRequested => report.close_requested = true,
                InputEvent::ToggleFullscreen => {}
                other => {
                    if self.camera_control.apply(&mut self.camera, &other) {
                        self.camera_version += 1;
                    }
                }
            }
        }
        if let Some((width, height)) = resize {
            report.resized = self.resize(width, height)?;
        }

        // Idle -> Recording
        let index = self.swap_chain.current_index() as usize;
        let timeout = self.settings.fence_timeout;
        let slot_value = self.frame_slots[index].fence_value;
        self.direct.wait_for(self.ctx.device_mut(), slot_value, timeout)?;
        self.direct.wait_for_next_slot(self.ctx.device_mut(), timeout)?;
        if self.settings.async_compute && self.settings.render_mode.uses_compute() {
            self.compute.wait_for_next_slot(self.ctx.device_mut(), timeout)?;
        }
        let collected = self.ctx.collect(&[&self.direct, &self.compute, &self.copy]);
        if collected > 0 {
            debug!("Collected {} retired resources", collected);
        }

        if self.frame_slots[index].camera_version != self.camera_version {
            let data = self.camera.buffer();
            self.camera_buffer.upload(
                &mut self.ctx,
                &mut self.view_heap,
                index,
                &data,
                &[&self.direct, &self.compute],
            )?;
            self.frame_slots[index].camera_version = self.camera_version;
        }

        self.state = FrameState::Recording;
        report.back_buffer = index as u32;
        let (compute_batch, direct_batch) = self.record_frame(index)?;
        report.barriers = direct_batch.barrier_count() + compute_batch.as_ref().map_or(0, |r| r.barrier_count());

        // Recording -> Submitted. Only submission itself can fail from here.
        // If the direct batch is refused after the compute one went through,
        // the table keeps the states the compute batch left behind.
        if let Some(compute_batch) = compute_batch {
            if let Err(e) = self.compute.submit(&mut self.ctx, compute_batch) {
                self.ctx.resources.discard(direct_batch);
                return Err(e);
            }
        }
        let value = self.direct.submit(&mut self.ctx, direct_batch)?;
        self.frame_slots[index].fence_value = value;
        self.state = FrameState::Submitted;
        report.fence_value = value;

        // Submitted -> Presenting
        self.state = FrameState::Presenting;
        let interval = u32::from(self.settings.vsync);
        report.next_back_buffer = self.swap_chain.present(&mut self.ctx, interval, !self.settings.vsync)?;

        trace!(
            "Frame {} on buffer {}: fence {}, {} barriers",
            report.frame,
            report.back_buffer,
            value,
            report.barriers
        );
        Ok(report)
    }

    /// Record the frame's batches and enqueue the waits between them.
    /// Returns the compute-queue batch (async compute only) and the
    /// direct-queue batch; nothing is submitted. On error every tracked state
    /// the recording moved is restored.
    fn record_frame(&mut self, index: usize) -> Result<(Option<CommandRecorder>, CommandRecorder)> {
        let mut direct = self.direct.record_batch(self.ctx.device())?;
        let mut compute = if self.settings.async_compute && self.settings.render_mode.uses_compute() {
            Some(self.compute.record_batch(self.ctx.device())?)
        } else {
            None
        };

        if let Err(e) = self.record_commands(index, &mut direct, compute.as_mut()) {
            self.ctx.resources.discard(direct);
            if let Some(rec) = compute {
                self.ctx.resources.discard(rec);
            }
            return Err(e);
        }
        Ok((compute, direct))
    }

    fn record_commands(
        &mut self,
        index: usize,
        direct: &mut CommandRecorder,
        mut compute: Option<&mut CommandRecorder>,
    ) -> Result<()> {
        let mode = self.settings.render_mode;
        let back = self.swap_chain.current_buffer();

        if mode.uses_compute() {
            match compute.as_deref_mut() {
                Some(rec) => self.record_dispatch(rec, index)?,
                None => self.record_dispatch(direct, index)?,
            }
            self.record_copy(direct, back)?;
        }
        if mode.uses_graphics() {
            self.record_plane(direct, back, mode == RenderMode::Graphics)?;
        }

        let resources = &mut self.ctx.resources;
        resources.restore_idle(direct, back)?;
        resources.restore_idle(direct, self.framebuffer)?;
        debug_assert!(
            resources
                .non_idle(&[back, self.framebuffer, self.geometry.vertex_buffer, self.geometry.index_buffer])
                .is_empty(),
            "resource left outside its idle state at end of frame"
        );

        if compute.is_some() {
            // The dispatch overwrites the framebuffer, which the previous
            // frame's copy on the direct queue may still be reading.
            let previous = self.direct.last_submitted();
            self.compute.wait_on_queue(self.ctx.device_mut(), &self.direct, previous)?;
            // The copy reads what the dispatch about to be submitted writes.
            let computed = self.compute.last_submitted() + 1;
            self.direct.wait_on_queue(self.ctx.device_mut(), &self.compute, computed)?;
        }
        Ok(())
    }

    fn record_dispatch(&mut self, rec: &mut CommandRecorder, index: usize) -> Result<()> {
        let resources = &mut self.ctx.resources;
        resources.transition(rec, self.framebuffer, ResourceState::UnorderedAccess)?;

        let camera = self
            .camera_buffer
            .handle(index)
            .ok_or_else(|| EngineError::Device(format!("camera buffer for slot {} missing", index)))?;
        resources.bind(rec, camera)?;
        let uav = self.framebuffer_uav.gpu;
        let cbv = self.camera_buffer.view(index).and_then(|slot| slot.gpu);
        let (Some(uav), Some(cbv)) = (uav, cbv) else {
            return Err(EngineError::ResourceCreateFailed(
                "compute descriptors are not shader visible".to_string(),
            ));
        };

        let (width, height) = self.swap_chain.dimensions();
        let group = self.settings.thread_group_size.max(1);
        rec.push(Command::SetDescriptorHeap(self.view_heap.raw()));
        rec.push(Command::SetComputePipeline(self.pipelines.compute));
        rec.push(Command::SetComputeTable { parameter: 0, base: uav });
        rec.push(Command::SetComputeTable { parameter: 1, base: cbv });
        rec.push(Command::Dispatch {
            x: width.div_ceil(group),
            y: height.div_ceil(group),
            z: 1,
        });
        Ok(())
    }

    fn record_copy(&mut self, rec: &mut CommandRecorder, back: ResourceHandle) -> Result<()> {
        let resources = &mut self.ctx.resources;
        resources.transition(rec, self.framebuffer, ResourceState::CopySource)?;
        resources.transition(rec, back, ResourceState::CopyDest)?;
        let dst = resources.bind(rec, back)?;
        let src = resources.bind(rec, self.framebuffer)?;
        rec.push(Command::CopyResource { dst, src });
        resources.restore_idle(rec, self.framebuffer)?;
        Ok(())
    }

    fn record_plane(&mut self, rec: &mut CommandRecorder, back: ResourceHandle, clear: bool) -> Result<()> {
        let resources = &mut self.ctx.resources;
        let rtv = self.swap_chain.current_rtv();
        resources.transition(rec, back, ResourceState::RenderTarget)?;
        if clear {
            rec.push(Command::ClearRenderTarget {
                view: rtv.cpu,
                color: self.settings.clear_color,
            });
        }

        resources.transition(rec, self.geometry.vertex_buffer, ResourceState::VertexAndConstantBuffer)?;
        resources.transition(rec, self.geometry.index_buffer, ResourceState::IndexBuffer)?;
        let vertex_buffer = resources.bind(rec, self.geometry.vertex_buffer)?;
        let index_buffer = resources.bind(rec, self.geometry.index_buffer)?;

        let (width, height) = self.swap_chain.dimensions();
        rec.push(Command::SetGraphicsPipeline(self.pipelines.graphics));
        rec.push(Command::SetViewport { width, height });
        rec.push(Command::SetRenderTarget { view: rtv.cpu });
        rec.push(Command::SetVertexBuffer {
            buffer: vertex_buffer,
            size: std::mem::size_of_val(&PLANE_VERTICES) as u32,
            stride: std::mem::size_of::<[f32; 3]>() as u32,
        });
        rec.push(Command::SetIndexBuffer {
            buffer: index_buffer,
            size: std::mem::size_of_val(&PLANE_INDICES) as u32,
        });
        rec.push(Command::DrawIndexed {
            index_count: PLANE_INDICES.len() as u32,
            instance_count: 1,
        });
        Ok(())
    }

    /// Resize the swap chain and recreate the framebuffer at the new size.
    /// Returns `false` if the size did not change.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        let resized = self.swap_chain.resize(
            &mut self.ctx,
            width,
            height,
            &mut [&mut self.direct, &mut self.compute, &mut self.copy],
            self.settings.fence_timeout,
        )?;
        if !resized {
            return Ok(false);
        }

        let (width, height) = self.swap_chain.dimensions();
        self.ctx.resources.release(self.framebuffer)?;
        self.framebuffer = create_framebuffer(&mut self.ctx, width, height, self.framebuffer_uav)?;
        self.camera.set_aspect_ratio(width, height);
        self.camera_version += 1;
        Ok(true)
    }

    /// Flush every queue, then release and destroy every resource. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        info!("Shutting down frame driver after {} frames", self.frame_count);
        let timeout = self.settings.fence_timeout;
        for queue in [&mut self.direct, &mut self.compute, &mut self.copy] {
            queue.flush(self.ctx.device_mut(), timeout)?;
        }
        self.shut_down = true;

        self.ctx.resources.release_all();
        let destroyed = self.ctx.collect(&[&self.direct, &self.compute, &self.copy]);
        debug!("Destroyed {} resources", destroyed);
        Ok(())
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frame_slots(&self) -> &[FrameSlot] {
        &self.frame_slots
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn swap_chain(&self) -> &SwapChain {
        &self.swap_chain
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue {
        match kind {
            QueueKind::Direct => &self.direct,
            QueueKind::Compute => &self.compute,
            QueueKind::Copy => &self.copy,
        }
    }

    pub fn framebuffer(&self) -> ResourceHandle {
        self.framebuffer
    }

    pub fn framebuffer_uav(&self) -> DescriptorSlot {
        self.framebuffer_uav
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn rtv_heap(&self) -> &DescriptorHeap {
        &self.rtv_heap
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame driver shutdown failed: {}", e);
        }
    }
}

fn create_framebuffer(
    ctx: &mut GpuContext,
    width: u32,
    height: u32,
    uav: DescriptorSlot,
) -> Result<ResourceHandle> {
    let desc = TextureDesc {
        name: "framebuffer".to_string(),
        width,
        height,
        format: SWAP_CHAIN_FORMAT,
        allow_unordered_access: true,
    };
    let raw = ctx.device.create_texture(&desc, ResourceState::UnorderedAccess)?;
    ctx.device.create_unordered_access_view(raw, uav.cpu);
    debug!("Framebuffer {}x{} bound to descriptor {}", width, height, uav.offset);
    Ok(ctx.resources.register(
        raw,
        ResourceState::UnorderedAccess,
        ResourceState::UnorderedAccess,
        "framebuffer",
    ))
}

/// Upload the plane through staging buffers on the copy queue. The direct
/// queue waits for the copy on the GPU before moving the buffers into their
/// vertex and index states; the staging buffers are retired right away and
/// destroyed once the copy fence is reached.
fn upload_geometry(ctx: &mut GpuContext, copy: &mut CommandQueue, direct: &mut CommandQueue) -> Result<Geometry> {
    let vertices: &[u8] = bytemuck::cast_slice(&PLANE_VERTICES);
    let indices: &[u8] = bytemuck::cast_slice(&PLANE_INDICES);

    let (vertex_buffer, vertex_staging) = create_with_staging(ctx, "plane_vertices", vertices)?;
    let (index_buffer, index_staging) = create_with_staging(ctx, "plane_indices", indices)?;

    let mut rec = copy.record_batch(ctx.device())?;
    for (dst, src, size) in [
        (vertex_buffer, vertex_staging, vertices.len()),
        (index_buffer, index_staging, indices.len()),
    ] {
        let dst = ctx.resources.bind(&mut rec, dst)?;
        let src = ctx.resources.bind(&mut rec, src)?;
        rec.push(Command::CopyBuffer {
            dst,
            src,
            size: size as u64,
        });
    }
    let copied = copy.submit(ctx, rec)?;

    direct.wait_on_queue(ctx.device_mut(), copy, copied)?;
    let mut rec = direct.record_batch(ctx.device())?;
    ctx.resources.transition(&mut rec, vertex_buffer, ResourceState::VertexAndConstantBuffer)?;
    ctx.resources.transition(&mut rec, index_buffer, ResourceState::IndexBuffer)?;
    ctx.resources.set_idle_state(vertex_buffer, ResourceState::VertexAndConstantBuffer)?;
    ctx.resources.set_idle_state(index_buffer, ResourceState::IndexBuffer)?;
    direct.submit(ctx, rec)?;

    ctx.resources.release(vertex_staging)?;
    ctx.resources.release(index_staging)?;
    debug!("Plane geometry upload submitted (copy fence {})", copied);

    Ok(Geometry {
        vertex_buffer,
        index_buffer,
    })
}

/// A GPU-local buffer in `Common` plus a filled upload-heap staging buffer.
fn create_with_staging(ctx: &mut GpuContext, name: &str, data: &[u8]) -> Result<(ResourceHandle, ResourceHandle)> {
    let size = data.len() as u64;
    let raw = ctx.device.create_buffer(
        &BufferDesc {
            name: name.to_string(),
            size,
            heap: HeapType::Default,
        },
        ResourceState::Common,
    )?;
    let buffer = ctx
        .resources
        .register(raw, ResourceState::Common, ResourceState::Common, name);

    let staging_name = format!("{}_staging", name);
    let raw = ctx.device.create_buffer(
        &BufferDesc {
            name: staging_name.clone(),
            size,
            heap: HeapType::Upload,
        },
        ResourceState::GenericRead,
    )?;
    ctx.device.write_buffer(raw, 0, data)?;
    let staging = ctx.resources.register(
        raw,
        ResourceState::GenericRead,
        ResourceState::GenericRead,
        &staging_name,
    );
    Ok((buffer, staging))
}
