//! Descriptor Heap Module
//!
//! Fixed-capacity descriptor tables. Slots are handed out at sequential
//! offsets and never reclaimed; a view can be rewritten into an existing
//! slot when the resource behind it is recreated.

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::gpu::{CpuDescriptor, DescriptorKind, GpuDescriptor, GpuDevice, HeapInfo, RawHeap};

/// One allocated descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub heap: RawHeap,
    pub offset: u32,
    pub cpu: CpuDescriptor,
    /// Only set for shader-visible heaps.
    pub gpu: Option<GpuDescriptor>,
}

/// Linear allocator over one descriptor heap.
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorKind,
    info: HeapInfo,
    capacity: u32,
    next: u32,
}

impl DescriptorHeap {
    pub fn new(
        device: &mut dyn GpuDevice,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self> {
        let info = device.create_descriptor_heap(kind, capacity, shader_visible)?;
        debug!(
            "Created {:?} descriptor heap ({} slots, shader visible: {})",
            kind, capacity, shader_visible
        );
        Ok(Self {
            kind,
            info,
            capacity,
            next: 0,
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn raw(&self) -> RawHeap {
        self.info.raw
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }

    pub fn is_shader_visible(&self) -> bool {
        self.info.gpu_start.is_some()
    }

    /// Reserve the next free slot.
    pub fn allocate(&mut self) -> Result<DescriptorSlot> {
        if self.next >= self.capacity {
            return Err(EngineError::ResourceCreateFailed(format!(
                "{:?} descriptor heap is full ({} slots)",
                self.kind, self.capacity
            )));
        }
        let offset = self.next;
        self.next += 1;
        Ok(self.slot_at(offset))
    }

    fn slot_at(&self, offset: u32) -> DescriptorSlot {
        let stride = u64::from(offset) * u64::from(self.info.increment);
        DescriptorSlot {
            heap: self.info.raw,
            offset,
            cpu: CpuDescriptor(self.info.cpu_start.0 + stride),
            gpu: self.info.gpu_start.map(|start| GpuDescriptor(start.0 + stride)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    #[test]
    fn test_offsets_are_sequential() {
        let mut dev = NullDevice::new();
        let mut heap = DescriptorHeap::new(&mut dev, DescriptorKind::ShaderResource, 4, true).unwrap();

        let slots: Vec<DescriptorSlot> = (0..4).map(|_| heap.allocate().unwrap()).collect();
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.offset, i as u32);
            assert_eq!(slot.heap, heap.raw());
        }
        let step = slots[1].cpu.0 - slots[0].cpu.0;
        assert!(step > 0);
        assert_eq!(slots[3].cpu.0 - slots[0].cpu.0, 3 * step);
        let gpu_step = slots[1].gpu.unwrap().0 - slots[0].gpu.unwrap().0;
        assert_eq!(gpu_step, step);
    }

    #[test]
    fn test_full_heap_fails() {
        let mut dev = NullDevice::new();
        let mut heap = DescriptorHeap::new(&mut dev, DescriptorKind::RenderTarget, 2, false).unwrap();
        heap.allocate().unwrap();
        heap.allocate().unwrap();
        assert!(matches!(heap.allocate(), Err(EngineError::ResourceCreateFailed(_))));
        assert_eq!(heap.allocated(), 2);
    }

    #[test]
    fn test_render_target_heap_has_no_gpu_handles() {
        let mut dev = NullDevice::new();
        let mut heap = DescriptorHeap::new(&mut dev, DescriptorKind::RenderTarget, 3, false).unwrap();
        assert!(!heap.is_shader_visible());
        assert_eq!(heap.allocate().unwrap().gpu, None);
    }
}
