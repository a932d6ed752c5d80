//! Command Queue Module
//!
//! One queue per kind of GPU work. Each queue owns a fence and a ring of
//! recording slots (one command allocator each on a real device). A slot may
//! be recorded into again only once the batch last submitted from it has
//! completed.

use std::time::Duration;

use tracing::{debug, trace};

use crate::context::GpuContext;
use crate::error::{EngineError, Result};
use crate::fence::Fence;
use crate::gpu::{Batch, Command, GpuDevice, QueueKind, RawQueue, RawResource, ResourceState};
use crate::resource::ResourceHandle;

/// One tracked-state change made while recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub handle: ResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    /// Fence value of the last batch recorded in this slot (0 = never used).
    fence_value: u64,
}

/// A GPU queue with its fence and ring of recording slots.
#[derive(Debug)]
pub struct CommandQueue {
    kind: QueueKind,
    raw: RawQueue,
    fence: Fence,
    slots: Vec<SlotState>,
    next_slot: usize,
}

/// An open recording on one slot of a queue.
///
/// Dropping a recorder without submitting it discards its commands, but not
/// the tracked states its transitions moved: hand it to
/// [`ResourceTable::discard`](crate::resource::ResourceTable::discard) instead.
#[derive(Debug)]
pub struct CommandRecorder {
    queue: RawQueue,
    kind: QueueKind,
    slot: usize,
    commands: Vec<Command>,
    handles: Vec<ResourceHandle>,
    resources: Vec<RawResource>,
    /// Every transition made through this recorder, in order.
    transitions: Vec<Transition>,
}

impl CommandRecorder {
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Note that the batch references `handle`.
    pub fn track(&mut self, handle: ResourceHandle, raw: RawResource) {
        if !self.handles.contains(&handle) {
            self.handles.push(handle);
        }
        self.track_raw(raw);
    }

    /// Note a reference to a resource outside the table.
    pub fn track_raw(&mut self, raw: RawResource) {
        if !self.resources.contains(&raw) {
            self.resources.push(raw);
        }
    }

    pub(crate) fn note_transition(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }

    pub(crate) fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|cmd| matches!(cmd, Command::Barrier { .. }))
            .count()
    }
}

impl CommandQueue {
    pub fn new(device: &mut dyn GpuDevice, kind: QueueKind, slot_count: usize) -> Result<Self> {
        let slot_count = slot_count.max(1);
        let raw = device.create_queue(kind, slot_count)?;
        let fence = Fence::new(device)?;
        debug!("Created {:?} queue with {} recording slots", kind, slot_count);
        Ok(Self {
            kind,
            raw,
            fence,
            slots: vec![SlotState::default(); slot_count],
            next_slot: 0,
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn raw(&self) -> RawQueue {
        self.raw
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Fence value last signaled on this queue.
    pub fn last_submitted(&self) -> u64 {
        self.fence.last_signaled()
    }

    /// Open a recording on the next slot.
    pub fn record_batch(&self, device: &dyn GpuDevice) -> Result<CommandRecorder> {
        let slot = self.next_slot;
        let pending = self.slots[slot].fence_value;
        if !self.fence.is_reached(device, pending) {
            return Err(EngineError::BufferStillInFlight {
                queue: self.kind,
                slot,
                fence_value: pending,
            });
        }

        trace!("{:?} queue recording on slot {}", self.kind, slot);
        Ok(CommandRecorder {
            queue: self.raw,
            kind: self.kind,
            slot,
            commands: Vec::new(),
            handles: Vec::new(),
            resources: Vec::new(),
            transitions: Vec::new(),
        })
    }

    /// Close `recorder`, submit it and signal the fence. Returns the value
    /// that is reached once the batch has finished.
    ///
    /// If the device refuses the batch, the recorder's transitions are rolled
    /// back so the table keeps matching what actually reached the GPU.
    ///
    /// # Panics
    ///
    /// If `recorder` was opened on another queue, or on a slot this queue
    /// has moved past.
    pub fn submit(&mut self, ctx: &mut GpuContext, mut recorder: CommandRecorder) -> Result<u64> {
        assert!(
            recorder.queue == self.raw && recorder.slot == self.next_slot,
            "recorder for {:?} slot {} submitted to {:?} queue at slot {}",
            recorder.kind,
            recorder.slot,
            self.kind,
            self.next_slot
        );

        let slot = recorder.slot;
        let batch = Batch {
            commands: std::mem::take(&mut recorder.commands),
            resources: std::mem::take(&mut recorder.resources),
        };
        if let Err(e) = ctx.device.execute(self.raw, slot, &batch) {
            ctx.resources.discard(recorder);
            return Err(e);
        }

        let value = self.fence.signal(ctx.device_mut(), self.raw)?;
        self.slots[slot].fence_value = value;
        self.next_slot = (slot + 1) % self.slots.len();
        ctx.resources.mark_submitted(&recorder.handles, self.kind, value);

        trace!(
            "{:?} queue submitted {} commands on slot {} (fence {})",
            self.kind,
            batch.commands.len(),
            slot,
            value
        );
        Ok(value)
    }

    /// Signal and block until everything submitted so far has completed.
    pub fn flush(&mut self, device: &mut dyn GpuDevice, timeout: Duration) -> Result<u64> {
        let value = self.fence.signal(device, self.raw)?;
        self.fence.wait(device, value, timeout)?;
        debug!("{:?} queue flushed at fence {}", self.kind, value);
        Ok(value)
    }

    /// Block until the next `record_batch` can succeed.
    pub fn wait_for_next_slot(&self, device: &mut dyn GpuDevice, timeout: Duration) -> Result<()> {
        let pending = self.slots[self.next_slot].fence_value;
        self.fence.wait(device, pending, timeout)
    }

    /// Block until `value` of this queue's fence is reached.
    pub fn wait_for(&self, device: &mut dyn GpuDevice, value: u64, timeout: Duration) -> Result<()> {
        self.fence.wait(device, value, timeout)
    }

    /// Make later work on this queue wait, on the GPU, for `other` to reach
    /// `value`. The host does not block.
    pub fn wait_on_queue(&mut self, device: &mut dyn GpuDevice, other: &CommandQueue, value: u64) -> Result<()> {
        if value == 0 || other.fence.is_reached(device, value) {
            return Ok(());
        }
        trace!("{:?} queue waits on {:?} fence {}", self.kind, other.kind, value);
        device.queue_wait(self.raw, other.fence.raw(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::{GpuPacing, NullDevice};
    use crate::gpu::{BufferDesc, Format, HeapType, ResourceState, TextureDesc};

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_in_flight_slot_is_refused_until_reached() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();

        let first = queue.record_batch(ctx.device()).unwrap();
        assert_eq!(first.slot(), 0);
        let v1 = queue.submit(&mut ctx, first).unwrap();
        let second = queue.record_batch(ctx.device()).unwrap();
        assert_eq!(second.slot(), 1);
        queue.submit(&mut ctx, second).unwrap();

        match queue.record_batch(ctx.device()) {
            Err(EngineError::BufferStillInFlight {
                queue: kind,
                slot,
                fence_value,
            }) => {
                assert_eq!(kind, QueueKind::Direct);
                assert_eq!(slot, 0);
                assert_eq!(fence_value, v1);
            }
            other => panic!("expected BufferStillInFlight, got {:?}", other.map(|r| r.slot())),
        }

        gpu.complete_signals(1);
        let again = queue.record_batch(ctx.device()).unwrap();
        assert_eq!(again.slot(), 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_wait_for_next_slot_unblocks_recording() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::with_pacing(GpuPacing::OnDemand)));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Compute, 1).unwrap();
        let rec = queue.record_batch(ctx.device()).unwrap();
        queue.submit(&mut ctx, rec).unwrap();
        assert!(queue.record_batch(ctx.device()).is_err());

        queue.wait_for_next_slot(ctx.device_mut(), TIMEOUT).unwrap();
        assert!(queue.record_batch(ctx.device()).is_ok());
    }

    #[test]
    fn test_dropped_recorder_submits_nothing() {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let mut rec = queue.record_batch(ctx.device()).unwrap();
        rec.push(Command::Dispatch { x: 1, y: 1, z: 1 });
        drop(rec);

        assert_eq!(gpu.stats().batches_executed, 0);
        assert_eq!(queue.last_submitted(), 0);
    }

    fn framebuffer(ctx: &mut GpuContext) -> (RawResource, ResourceHandle) {
        let desc = TextureDesc {
            name: "framebuffer".to_string(),
            width: 8,
            height: 8,
            format: Format::Rgba8Unorm,
            allow_unordered_access: true,
        };
        let state = ResourceState::UnorderedAccess;
        let raw = ctx.device.create_texture(&desc, state).unwrap();
        (raw, ctx.resources.register(raw, state, state, "framebuffer"))
    }

    #[test]
    fn test_discarded_recorder_restores_tracked_state() {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let (raw, fb) = framebuffer(&mut ctx);

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        ctx.resources.transition(&mut rec, fb, ResourceState::CopySource).unwrap();
        ctx.resources.transition(&mut rec, fb, ResourceState::CopyDest).unwrap();
        ctx.resources.discard(rec);
        assert_eq!(ctx.resources.state(fb).unwrap(), ResourceState::UnorderedAccess);

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        assert!(ctx.resources.transition(&mut rec, fb, ResourceState::CopySource).unwrap());
        let value = queue.submit(&mut ctx, rec).unwrap();
        queue.wait_for(ctx.device_mut(), value, TIMEOUT).unwrap();

        assert_eq!(gpu.gpu_state(raw), Some(ResourceState::CopySource));
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_refused_batch_rolls_back_and_keeps_slot() {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let (raw, fb) = framebuffer(&mut ctx);

        gpu.fail_next_execute(QueueKind::Direct);
        let mut rec = queue.record_batch(ctx.device()).unwrap();
        ctx.resources.transition(&mut rec, fb, ResourceState::CopySource).unwrap();
        assert!(matches!(queue.submit(&mut ctx, rec), Err(EngineError::Device(_))));
        assert_eq!(ctx.resources.state(fb).unwrap(), ResourceState::UnorderedAccess);
        assert_eq!(queue.last_submitted(), 0);

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        assert_eq!(rec.slot(), 0);
        ctx.resources.transition(&mut rec, fb, ResourceState::CopySource).unwrap();
        let value = queue.submit(&mut ctx, rec).unwrap();
        queue.wait_for(ctx.device_mut(), value, TIMEOUT).unwrap();
        assert_eq!(gpu.gpu_state(raw), Some(ResourceState::CopySource));
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn test_flush_blocks_until_all_work_is_done() {
        let gpu = NullDevice::new();
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 3).unwrap();
        let mut values = Vec::new();
        for _ in 0..3 {
            let rec = queue.record_batch(ctx.device()).unwrap();
            values.push(queue.submit(&mut ctx, rec).unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);

        let flushed = queue.flush(ctx.device_mut(), TIMEOUT).unwrap();
        assert_eq!(flushed, 4);
        for v in values {
            assert!(queue.fence().is_reached(ctx.device(), v));
        }
        assert_eq!(gpu.pending_ops(), 0);
    }

    #[test]
    #[should_panic(expected = "submitted to")]
    fn test_foreign_recorder_panics() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        let direct = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let mut compute = CommandQueue::new(ctx.device_mut(), QueueKind::Compute, 2).unwrap();
        let rec = direct.record_batch(ctx.device()).unwrap();
        let _ = compute.submit(&mut ctx, rec);
    }

    #[test]
    fn test_cross_queue_wait_orders_copy_before_direct() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut copy = CommandQueue::new(ctx.device_mut(), QueueKind::Copy, 1).unwrap();
        let mut direct = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 1).unwrap();

        let staging = ctx
            .device
            .create_buffer(
                &BufferDesc {
                    name: "staging".to_string(),
                    size: 64,
                    heap: HeapType::Upload,
                },
                ResourceState::GenericRead,
            )
            .unwrap();
        let mut rec = copy.record_batch(ctx.device()).unwrap();
        rec.track_raw(staging);
        let copied = copy.submit(&mut ctx, rec).unwrap();

        direct.wait_on_queue(ctx.device_mut(), &copy, copied).unwrap();
        let rec = direct.record_batch(ctx.device()).unwrap();
        let drawn = direct.submit(&mut ctx, rec).unwrap();
        assert_eq!(gpu.stats().queue_waits, 1);

        gpu.complete_all();
        assert!(copy.fence().is_reached(ctx.device(), copied));
        assert!(direct.fence().is_reached(ctx.device(), drawn));
        assert_eq!(gpu.gpu_refs(staging), 0);
    }
}
