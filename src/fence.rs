//! Fence Tracker Module
//!
//! A monotonic counter paired with a GPU-side fence. The counter is the last
//! value the host asked the GPU to signal; the completed value is read back
//! from the device and cached so that `is_reached` never goes back to false.

use std::cell::Cell;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::gpu::{GpuDevice, RawFence, RawQueue};

/// Host-side counter for one GPU fence.
#[derive(Debug)]
pub struct Fence {
    raw: RawFence,
    /// Last value enqueued for signaling.
    counter: u64,
    /// Highest completed value observed so far.
    completed: Cell<u64>,
}

impl Fence {
    pub fn new(device: &mut dyn GpuDevice) -> Result<Self> {
        let raw = device.create_fence(0)?;
        Ok(Self {
            raw,
            counter: 0,
            completed: Cell::new(0),
        })
    }

    pub fn raw(&self) -> RawFence {
        self.raw
    }

    pub fn last_signaled(&self) -> u64 {
        self.counter
    }

    /// Enqueue a GPU-side signal of the next counter value on `queue`.
    pub fn signal(&mut self, device: &mut dyn GpuDevice, queue: RawQueue) -> Result<u64> {
        let value = self.counter + 1;
        device.signal(queue, self.raw, value)?;
        self.counter = value;
        trace!("fence {} signal {} enqueued", self.raw.0, value);
        Ok(value)
    }

    /// Completed value as seen by the GPU, never lower than a previous read.
    pub fn completed_value(&self, device: &dyn GpuDevice) -> u64 {
        let observed = device.completed_value(self.raw).max(self.completed.get());
        self.completed.set(observed);
        observed
    }

    pub fn is_reached(&self, device: &dyn GpuDevice, value: u64) -> bool {
        value <= self.completed.get() || self.completed_value(device) >= value
    }

    /// Block until `value` completes.
    ///
    /// # Panics
    ///
    /// If `value` was never signaled: there is nothing that could ever
    /// complete it.
    pub fn wait(&self, device: &mut dyn GpuDevice, value: u64, timeout: Duration) -> Result<()> {
        assert!(
            value <= self.counter,
            "wait on fence value {} but only {} was ever signaled",
            value,
            self.counter
        );
        if self.is_reached(device, value) {
            return Ok(());
        }

        debug!("Waiting for fence {} to reach {}", self.raw.0, value);
        if device.wait_for_value(self.raw, value, timeout)? {
            self.completed_value(device);
            Ok(())
        } else {
            Err(EngineError::SyncTimeout {
                fence_value: value,
                timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{GpuPacing, NullDevice};
    use crate::gpu::QueueKind;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn test_is_reached_tracks_processed_signals() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 1).unwrap();
        let mut fence = Fence::new(&mut dev).unwrap();

        let values: Vec<u64> = (0..5).map(|_| fence.signal(&mut dev, queue).unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);

        for processed in 1..=5u64 {
            for v in processed..=5 {
                assert_eq!(fence.is_reached(&dev, v), v < processed);
            }
            gpu.complete_signals(1);
            for v in 1..=processed {
                assert!(fence.is_reached(&dev, v));
            }
        }
        assert_eq!(fence.completed_value(&dev), 5);
    }

    #[test]
    fn test_wait_times_out_when_gpu_stalls() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 1).unwrap();
        let mut fence = Fence::new(&mut dev).unwrap();
        let value = fence.signal(&mut dev, queue).unwrap();

        match fence.wait(&mut dev, value, TIMEOUT) {
            Err(EngineError::SyncTimeout { fence_value, .. }) => assert_eq!(fence_value, value),
            other => panic!("expected timeout, got {:?}", other),
        }

        gpu.complete_all();
        fence.wait(&mut dev, value, TIMEOUT).unwrap();
    }

    #[test]
    fn test_wait_drives_on_demand_device() {
        let mut dev = NullDevice::new();
        let queue = dev.create_queue(QueueKind::Compute, 1).unwrap();
        let mut fence = Fence::new(&mut dev).unwrap();
        fence.signal(&mut dev, queue).unwrap();
        let value = fence.signal(&mut dev, queue).unwrap();

        assert!(!fence.is_reached(&dev, value));
        fence.wait(&mut dev, value, TIMEOUT).unwrap();
        assert!(fence.is_reached(&dev, value));
    }

    #[test]
    #[should_panic(expected = "was ever signaled")]
    fn test_wait_before_signal_panics() {
        let mut dev = NullDevice::new();
        let fence = Fence::new(&mut dev).unwrap();
        let _ = fence.wait(&mut dev, 1, TIMEOUT);
    }
}
