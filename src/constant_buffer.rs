//! Constant Buffer Module
//!
//! Small per-frame uploads (camera parameters). Each frame slot gets its own
//! host-visible buffer and CBV, created on first use, so writing the data
//! for one frame never touches memory an earlier frame is still reading.

use std::marker::PhantomData;

use bytemuck::Pod;
use tracing::{debug, trace};

use crate::context::GpuContext;
use crate::descriptor::{DescriptorHeap, DescriptorSlot};
use crate::error::{EngineError, Result};
use crate::gpu::{BufferDesc, HeapType, ResourceState};
use crate::queue::CommandQueue;
use crate::resource::ResourceHandle;

/// Hardware alignment for constant buffer views.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Round `bytes` up to the next constant-buffer boundary.
pub fn aligned_size(bytes: usize) -> u64 {
    (bytes as u64 + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
}

#[derive(Debug, Clone, Copy)]
struct Instance {
    handle: ResourceHandle,
    view: DescriptorSlot,
}

/// One upload-heap instance of `T` per frame slot.
#[derive(Debug)]
pub struct ConstantBuffer<T: Pod> {
    name: String,
    instances: Vec<Option<Instance>>,
    _data: PhantomData<T>,
}

impl<T: Pod> ConstantBuffer<T> {
    pub fn new(name: &str, slot_count: usize) -> Self {
        Self {
            name: name.to_string(),
            instances: vec![None; slot_count],
            _data: PhantomData,
        }
    }

    /// Size of each instance in bytes.
    pub fn size(&self) -> u64 {
        aligned_size(std::mem::size_of::<T>())
    }

    pub fn handle(&self, slot: usize) -> Option<ResourceHandle> {
        self.instances.get(slot).copied().flatten().map(|i| i.handle)
    }

    pub fn view(&self, slot: usize) -> Option<DescriptorSlot> {
        self.instances.get(slot).copied().flatten().map(|i| i.view)
    }

    /// Write `data` into the instance for `slot`, creating it if needed.
    ///
    /// Fails with `BufferStillInFlight` if a batch on one of `queues` that
    /// reads the instance has not finished.
    pub fn upload(
        &mut self,
        ctx: &mut GpuContext,
        heap: &mut DescriptorHeap,
        slot: usize,
        data: &T,
        queues: &[&CommandQueue],
    ) -> Result<DescriptorSlot> {
        if slot >= self.instances.len() {
            return Err(EngineError::ResourceCreateFailed(format!(
                "{} has no frame slot {}",
                self.name, slot
            )));
        }
        let instance = match self.instances[slot] {
            Some(instance) => instance,
            None => {
                let instance = self.create_instance(ctx, heap, slot)?;
                self.instances[slot] = Some(instance);
                instance
            }
        };

        let pending = ctx
            .resources
            .last_use(instance.handle)?
            .iter()
            .copied()
            .find(|mark| {
                queues
                    .iter()
                    .any(|q| q.kind() == mark.queue && !q.fence().is_reached(ctx.device(), mark.value))
            });
        if let Some(mark) = pending {
            return Err(EngineError::BufferStillInFlight {
                queue: mark.queue,
                slot,
                fence_value: mark.value,
            });
        }

        let raw = ctx.resources.raw(instance.handle)?;
        ctx.device.write_buffer(raw, 0, bytemuck::bytes_of(data))?;
        trace!("{}[{}] uploaded {} bytes", self.name, slot, std::mem::size_of::<T>());
        Ok(instance.view)
    }

    fn create_instance(&self, ctx: &mut GpuContext, heap: &mut DescriptorHeap, slot: usize) -> Result<Instance> {
        let name = format!("{}[{}]", self.name, slot);
        let size = self.size();
        let desc = BufferDesc {
            name: name.clone(),
            size,
            heap: HeapType::Upload,
        };
        let raw = ctx.device.create_buffer(&desc, ResourceState::GenericRead)?;
        let handle = ctx
            .resources
            .register(raw, ResourceState::GenericRead, ResourceState::GenericRead, &name);
        let view = heap.allocate()?;
        ctx.device.create_constant_buffer_view(raw, size, view.cpu);
        debug!("Created constant buffer {} ({} bytes, descriptor {})", name, size, view.offset);
        Ok(Instance { handle, view })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{GpuPacing, NullDevice};
    use crate::gpu::{DescriptorKind, QueueKind};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Params {
        position: [f32; 3],
        scale: f32,
    }

    #[test]
    fn test_sizes_are_256_aligned() {
        assert_eq!(aligned_size(1), 256);
        assert_eq!(aligned_size(48), 256);
        assert_eq!(aligned_size(256), 256);
        assert_eq!(aligned_size(257), 512);
        assert_eq!(ConstantBuffer::<Params>::new("params", 2).size(), 256);
    }

    #[test]
    fn test_upload_creates_instance_lazily() {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut heap = DescriptorHeap::new(ctx.device_mut(), DescriptorKind::ShaderResource, 4, true).unwrap();
        let mut cb = ConstantBuffer::<Params>::new("params", 2);
        assert!(cb.handle(0).is_none());

        let data = Params {
            position: [1.0, 2.0, 3.0],
            scale: 0.5,
        };
        let view = cb.upload(&mut ctx, &mut heap, 1, &data, &[]).unwrap();
        assert_eq!(view.offset, 0);
        assert!(cb.handle(0).is_none());

        let raw = ctx.resources.raw(cb.handle(1).unwrap()).unwrap();
        let contents = gpu.buffer_contents(raw);
        assert_eq!(contents.len(), 256);
        assert_eq!(&contents[..16], bytemuck::bytes_of(&data));
        assert_eq!(gpu.view_target(view.cpu), Some(raw));

        // the second upload reuses the instance
        cb.upload(&mut ctx, &mut heap, 1, &data, &[]).unwrap();
        assert_eq!(heap.allocated(), 1);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_upload_refuses_in_flight_instance() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let mut heap = DescriptorHeap::new(ctx.device_mut(), DescriptorKind::ShaderResource, 4, true).unwrap();
        let mut cb = ConstantBuffer::<Params>::new("params", 2);
        let data = Params {
            position: [0.0; 3],
            scale: 1.0,
        };
        cb.upload(&mut ctx, &mut heap, 0, &data, &[&queue]).unwrap();

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        ctx.resources.bind(&mut rec, cb.handle(0).unwrap()).unwrap();
        let value = queue.submit(&mut ctx, rec).unwrap();

        match cb.upload(&mut ctx, &mut heap, 0, &data, &[&queue]) {
            Err(EngineError::BufferStillInFlight { queue: kind, slot, fence_value }) => {
                assert_eq!(kind, QueueKind::Direct);
                assert_eq!(slot, 0);
                assert_eq!(fence_value, value);
            }
            other => panic!("expected BufferStillInFlight, got {:?}", other),
        }
        // another slot is free to update
        cb.upload(&mut ctx, &mut heap, 1, &data, &[&queue]).unwrap();

        gpu.complete_all();
        cb.upload(&mut ctx, &mut heap, 0, &data, &[&queue]).unwrap();
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_upload_to_unknown_slot_fails() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        let mut heap = DescriptorHeap::new(ctx.device_mut(), DescriptorKind::ShaderResource, 4, true).unwrap();
        let mut cb = ConstantBuffer::<Params>::new("params", 2);
        let data = Params {
            position: [0.0; 3],
            scale: 1.0,
        };
        assert!(cb.upload(&mut ctx, &mut heap, 2, &data, &[]).is_err());
    }
}
