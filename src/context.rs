//! GPU Context Module
//!
//! The device handle together with the resource table that owns everything
//! created through it. Passed explicitly to every operation that needs both.

use crate::gpu::GpuDevice;
use crate::queue::CommandQueue;
use crate::resource::ResourceTable;

/// Device plus the table of everything created through it.
pub struct GpuContext {
    pub device: Box<dyn GpuDevice>,
    pub resources: ResourceTable,
}

impl GpuContext {
    pub fn new(device: Box<dyn GpuDevice>) -> Self {
        Self {
            device,
            resources: ResourceTable::new(),
        }
    }

    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut dyn GpuDevice {
        self.device.as_mut()
    }

    /// Destroy every retired resource the given queues can no longer touch.
    pub fn collect(&mut self, queues: &[&CommandQueue]) -> usize {
        self.resources.collect(self.device.as_mut(), queues)
    }
}
