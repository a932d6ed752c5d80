//! Swap Chain Module
//!
//! Owns the presentable surface and its back buffers. The buffers live in
//! the resource table like every other resource (idle state `Present`), and
//! each has a render-target view in a fixed descriptor slot that survives
//! resizes.

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::context::GpuContext;
use crate::descriptor::{DescriptorHeap, DescriptorSlot};
use crate::error::{EngineError, Result};
use crate::gpu::{RawSwapChain, ResourceState, Surface, SwapChainDesc};
use crate::queue::CommandQueue;
use crate::resource::ResourceHandle;

pub const MIN_BUFFER_COUNT: u32 = 2;
pub const MAX_BUFFER_COUNT: u32 = 16;

/// Back buffers, their render-target views and the current index.
#[derive(Debug)]
pub struct SwapChain {
    raw: RawSwapChain,
    buffers: Vec<ResourceHandle>,
    rtvs: Vec<DescriptorSlot>,
    width: u32,
    height: u32,
    current_index: u32,
    tearing_supported: bool,
}

impl SwapChain {
    /// Create the swap chain on `queue` and one RTV per back buffer in
    /// `rtv_heap`.
    pub fn create(
        ctx: &mut GpuContext,
        queue: &CommandQueue,
        surface: Surface,
        desc: &SwapChainDesc,
        rtv_heap: &mut DescriptorHeap,
    ) -> Result<Self> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&desc.buffer_count) {
            return Err(EngineError::SurfaceCreateFailed(format!(
                "buffer count {} outside {}..={}",
                desc.buffer_count, MIN_BUFFER_COUNT, MAX_BUFFER_COUNT
            )));
        }
        info!(
            "Creating swap chain: {}x{} with {} buffers",
            desc.width, desc.height, desc.buffer_count
        );

        let raw = ctx.device.create_swap_chain(queue.raw(), surface, desc)?;
        let rtvs = (0..desc.buffer_count)
            .map(|_| rtv_heap.allocate())
            .collect::<Result<Vec<_>>>()?;
        let buffers = acquire_buffers(ctx, raw, &rtvs)?;

        let swap_chain = Self {
            raw,
            buffers,
            rtvs,
            width: desc.width,
            height: desc.height,
            current_index: ctx.device.current_back_buffer_index(raw),
            tearing_supported: ctx.device.tearing_supported(),
        };
        debug!(
            "Swap chain ready, current buffer {}, tearing supported: {}",
            swap_chain.current_index, swap_chain.tearing_supported
        );
        Ok(swap_chain)
    }

    /// Resize the back buffers. Every queue in `queues` is flushed first so
    /// no GPU work can still reference the old buffers when they are
    /// released. Returns `false` without doing anything if the size is
    /// unchanged.
    pub fn resize(
        &mut self,
        ctx: &mut GpuContext,
        width: u32,
        height: u32,
        queues: &mut [&mut CommandQueue],
        timeout: Duration,
    ) -> Result<bool> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            trace!("Resize to current size {}x{} skipped", width, height);
            return Ok(false);
        }
        info!(
            "Resizing swap chain {}x{} -> {}x{}",
            self.width, self.height, width, height
        );

        for queue in queues.iter_mut() {
            queue.flush(ctx.device_mut(), timeout)?;
        }

        for &buffer in &self.buffers {
            ctx.resources.release(buffer)?;
        }
        self.buffers.clear();
        let flushed: Vec<&CommandQueue> = queues.iter().map(|q| &**q).collect();
        let destroyed = ctx.collect(&flushed);
        debug!("Released {} resources before resize", destroyed);

        ctx.device.resize_swap_chain(self.raw, width, height)?;
        self.buffers = acquire_buffers(ctx, self.raw, &self.rtvs)?;
        self.width = width;
        self.height = height;
        self.current_index = ctx.device.current_back_buffer_index(self.raw);
        Ok(true)
    }

    /// Present the current back buffer and return the index the platform
    /// hands out next.
    ///
    /// # Panics
    ///
    /// If the current back buffer is not in `Present`.
    pub fn present(&mut self, ctx: &mut GpuContext, sync_interval: u32, allow_tearing: bool) -> Result<u32> {
        let state = ctx.resources.state(self.current_buffer())?;
        assert_eq!(
            state,
            ResourceState::Present,
            "back buffer {} presented in the wrong state",
            self.current_index
        );

        let interval = sync_interval.min(1);
        let tearing = allow_tearing && self.tearing_supported && interval == 0;
        ctx.device.present(self.raw, interval, tearing)?;
        self.current_index = ctx.device.current_back_buffer_index(self.raw);
        trace!("Presented (interval {}, tearing {}), next buffer {}", interval, tearing, self.current_index);
        Ok(self.current_index)
    }

    pub fn raw(&self) -> RawSwapChain {
        self.raw
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn current_buffer(&self) -> ResourceHandle {
        self.buffers[self.current_index as usize]
    }

    pub fn current_rtv(&self) -> DescriptorSlot {
        self.rtvs[self.current_index as usize]
    }

    pub fn buffers(&self) -> &[ResourceHandle] {
        &self.buffers
    }

    pub fn rtvs(&self) -> &[DescriptorSlot] {
        &self.rtvs
    }

    pub fn buffer_count(&self) -> u32 {
        self.rtvs.len() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn tearing_supported(&self) -> bool {
        self.tearing_supported
    }
}

/// Take every back buffer into the resource table and write its RTV.
fn acquire_buffers(
    ctx: &mut GpuContext,
    raw: RawSwapChain,
    rtvs: &[DescriptorSlot],
) -> Result<Vec<ResourceHandle>> {
    let mut buffers = Vec::with_capacity(rtvs.len());
    for (index, rtv) in rtvs.iter().enumerate() {
        let buffer = ctx.device.swap_chain_buffer(raw, index as u32)?;
        ctx.device.create_render_target_view(buffer, rtv.cpu);
        buffers.push(ctx.resources.register(
            buffer,
            ResourceState::Present,
            ResourceState::Present,
            &format!("back_buffer{}", index),
        ));
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use crate::gpu::{DescriptorKind, Format, QueueKind, RawResource};

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Fixture {
        gpu: NullDevice,
        ctx: GpuContext,
        direct: CommandQueue,
        compute: CommandQueue,
        rtv_heap: DescriptorHeap,
    }

    fn fixture() -> Fixture {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let direct = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 3).unwrap();
        let compute = CommandQueue::new(ctx.device_mut(), QueueKind::Compute, 3).unwrap();
        let rtv_heap = DescriptorHeap::new(ctx.device_mut(), DescriptorKind::RenderTarget, 16, false).unwrap();
        Fixture {
            gpu,
            ctx,
            direct,
            compute,
            rtv_heap,
        }
    }

    fn desc(buffer_count: u32) -> SwapChainDesc {
        SwapChainDesc {
            width: 800,
            height: 800,
            buffer_count,
            format: Format::Rgba8Unorm,
        }
    }

    fn raws(ctx: &GpuContext, sc: &SwapChain) -> Vec<RawResource> {
        sc.buffers().iter().map(|&h| ctx.resources.raw(h).unwrap()).collect()
    }

    #[test]
    fn test_create_rejects_bad_buffer_counts() {
        let mut f = fixture();
        for count in [0, 1, 17] {
            let result = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(count), &mut f.rtv_heap);
            assert!(matches!(result, Err(EngineError::SurfaceCreateFailed(_))));
        }
        assert_eq!(f.rtv_heap.allocated(), 0);
    }

    #[test]
    fn test_create_registers_buffers_with_views() {
        let mut f = fixture();
        let sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(3), &mut f.rtv_heap).unwrap();

        assert_eq!(sc.buffer_count(), 3);
        assert_eq!(sc.current_index(), 0);
        for (i, &buffer) in sc.buffers().iter().enumerate() {
            assert_eq!(f.ctx.resources.state(buffer).unwrap(), ResourceState::Present);
            let raw = f.ctx.resources.raw(buffer).unwrap();
            assert_eq!(f.gpu.view_target(sc.rtvs()[i].cpu), Some(raw));
        }
    }

    #[test]
    fn test_resize_to_same_size_is_a_noop() {
        let mut f = fixture();
        let mut sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(3), &mut f.rtv_heap).unwrap();
        let handles = sc.buffers().to_vec();
        let before = raws(&f.ctx, &sc);
        let rtvs = sc.rtvs().to_vec();
        let allocated = f.gpu.stats().back_buffers_allocated;

        for _ in 0..2 {
            let resized = sc
                .resize(&mut f.ctx, 800, 800, &mut [&mut f.direct, &mut f.compute], TIMEOUT)
                .unwrap();
            assert!(!resized);
        }
        assert_eq!(sc.buffers(), handles.as_slice());
        assert_eq!(raws(&f.ctx, &sc), before);
        assert_eq!(sc.rtvs(), rtvs.as_slice());
        assert_eq!(f.gpu.stats().back_buffers_allocated, allocated);
        assert_eq!(f.gpu.stats().resizes, 0);
    }

    #[test]
    fn test_resize_flushes_before_releasing_buffers() {
        let mut f = fixture();
        let mut sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(3), &mut f.rtv_heap).unwrap();
        let back = sc.current_buffer();
        let mut rec = f.direct.record_batch(f.ctx.device()).unwrap();
        f.ctx.resources.transition(&mut rec, back, ResourceState::RenderTarget).unwrap();
        f.ctx.resources.transition(&mut rec, back, ResourceState::Present).unwrap();
        let value = f.direct.submit(&mut f.ctx, rec).unwrap();

        let old = raws(&f.ctx, &sc);
        assert_eq!(f.gpu.gpu_refs(old[0]), 1);

        let resized = sc
            .resize(&mut f.ctx, 1280, 720, &mut [&mut f.direct, &mut f.compute], TIMEOUT)
            .unwrap();
        assert!(resized);
        assert!(f.direct.fence().is_reached(f.ctx.device(), value));
        assert!(f.gpu.violations().is_empty(), "{:?}", f.gpu.violations());
        for raw in &old {
            assert_eq!(f.gpu.gpu_refs(*raw), 0);
            assert!(!f.gpu.is_alive(*raw));
        }

        let new = raws(&f.ctx, &sc);
        assert!(new.iter().all(|raw| !old.contains(raw)));
        assert!(!f.ctx.resources.contains(back));
        assert_eq!(sc.dimensions(), (1280, 720));
        for (i, slot) in sc.rtvs().iter().enumerate() {
            assert_eq!(slot.offset, i as u32);
            assert_eq!(f.gpu.view_target(slot.cpu), Some(new[i]));
        }
    }

    #[test]
    fn test_resize_clamps_zero_extent() {
        let mut f = fixture();
        let mut sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(2), &mut f.rtv_heap).unwrap();
        assert!(sc.resize(&mut f.ctx, 0, 0, &mut [&mut f.direct], TIMEOUT).unwrap());
        assert_eq!(sc.dimensions(), (1, 1));
        assert!(!sc.resize(&mut f.ctx, 0, 1, &mut [&mut f.direct], TIMEOUT).unwrap());
    }

    #[test]
    fn test_present_reads_index_from_device() {
        let mut f = fixture();
        let mut sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(3), &mut f.rtv_heap).unwrap();
        f.gpu.script_present_indices([2, 2, 0]);

        assert_eq!(sc.present(&mut f.ctx, 1, false).unwrap(), 2);
        assert_eq!(sc.present(&mut f.ctx, 1, false).unwrap(), 2);
        assert_eq!(sc.present(&mut f.ctx, 1, false).unwrap(), 0);
        assert_eq!(sc.current_buffer(), sc.buffers()[0]);
    }

    #[test]
    fn test_present_only_tears_when_supported_and_unsynced() {
        let mut f = fixture();
        f.gpu.set_tearing_supported(false);
        let mut sc = SwapChain::create(&mut f.ctx, &f.direct, Surface::Headless, &desc(2), &mut f.rtv_heap).unwrap();
        assert!(!sc.tearing_supported());

        sc.present(&mut f.ctx, 0, true).unwrap();
        sc.present(&mut f.ctx, 4, true).unwrap();
        assert_eq!(f.gpu.stats().presents, 2);
    }
}
