//! Resource Table Module
//!
//! Owns every GPU resource the engine creates, keyed by a generational
//! [`ResourceHandle`]. The table is the single authority on each resource's
//! current state: [`ResourceTable::transition`] appends a barrier to the open
//! recording whenever the next use needs a different state.
//!
//! Releasing a handle does not destroy the resource. The entry is retired
//! together with the fence marks of the last batches that used it and only
//! destroyed by [`ResourceTable::collect`] once every mark is reached.

use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::gpu::{Command, GpuDevice, QueueKind, RawResource, ResourceState};
use crate::queue::{CommandQueue, CommandRecorder, Transition};

/// Opaque reference to a resource owned by a [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

/// "Last touched by `queue` in the batch that signals `value`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceMark {
    pub queue: QueueKind,
    pub value: u64,
}

#[derive(Debug)]
struct Entry {
    raw: RawResource,
    name: String,
    state: ResourceState,
    idle_state: ResourceState,
    last_use: Vec<FenceMark>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug)]
struct Retired {
    raw: RawResource,
    name: String,
    last_use: Vec<FenceMark>,
}

/// Owner and state authority for every resource the engine creates.
#[derive(Debug, Default)]
pub struct ResourceTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    retired: Vec<Retired>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `raw`. Its tracked state starts at `state`.
    pub fn register(
        &mut self,
        raw: RawResource,
        state: ResourceState,
        idle_state: ResourceState,
        name: &str,
    ) -> ResourceHandle {
        let entry = Entry {
            raw,
            name: name.to_string(),
            state,
            idle_state,
            last_use: Vec::new(),
        };
        debug!("Registered resource {} in {:?}", name, state);

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            ResourceHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            ResourceHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn entry(&self, handle: ResourceHandle) -> Result<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(EngineError::StaleResource(handle))
    }

    fn entry_mut(&mut self, handle: ResourceHandle) -> Result<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(EngineError::StaleResource(handle))
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.entry(handle).is_ok()
    }

    pub fn raw(&self, handle: ResourceHandle) -> Result<RawResource> {
        self.entry(handle).map(|e| e.raw)
    }

    pub fn state(&self, handle: ResourceHandle) -> Result<ResourceState> {
        self.entry(handle).map(|e| e.state)
    }

    pub fn idle_state(&self, handle: ResourceHandle) -> Result<ResourceState> {
        self.entry(handle).map(|e| e.idle_state)
    }

    pub fn set_idle_state(&mut self, handle: ResourceHandle, idle: ResourceState) -> Result<()> {
        self.entry_mut(handle)?.idle_state = idle;
        Ok(())
    }

    pub fn name(&self, handle: ResourceHandle) -> Result<&str> {
        self.entry(handle).map(|e| e.name.as_str())
    }

    /// Move `handle` into `required`, recording a barrier if it is not there
    /// yet. Returns whether a barrier was emitted.
    pub fn transition(
        &mut self,
        recorder: &mut CommandRecorder,
        handle: ResourceHandle,
        required: ResourceState,
    ) -> Result<bool> {
        let entry = self.entry_mut(handle)?;
        let raw = entry.raw;
        recorder.track(handle, raw);
        if entry.state == required {
            return Ok(false);
        }

        trace!("{}: {:?} -> {:?}", entry.name, entry.state, required);
        recorder.push(Command::Barrier {
            resource: raw,
            before: entry.state,
            after: required,
        });
        recorder.note_transition(Transition {
            handle,
            before: entry.state,
            after: required,
        });
        entry.state = required;
        Ok(true)
    }

    /// Throw away an unsubmitted recording and put every handle it moved back
    /// into the state it had before the recording touched it. A handle that
    /// another recording has moved since is left alone, so open recorders
    /// can be discarded in any order.
    pub fn discard(&mut self, mut recorder: CommandRecorder) {
        for t in recorder.take_transitions().into_iter().rev() {
            // Released handles have nothing left to restore.
            if let Ok(entry) = self.entry_mut(t.handle) {
                if entry.state == t.after {
                    entry.state = t.before;
                }
            }
        }
        trace!(
            "Discarded {:?} recording on slot {}",
            recorder.kind(),
            recorder.slot()
        );
    }

    /// Return `handle` to its idle state.
    pub fn restore_idle(&mut self, recorder: &mut CommandRecorder, handle: ResourceHandle) -> Result<bool> {
        let idle = self.idle_state(handle)?;
        self.transition(recorder, handle, idle)
    }

    /// Mark `handle` as referenced by the recording without changing its
    /// state. Returns the raw resource to put in a command.
    pub fn bind(&self, recorder: &mut CommandRecorder, handle: ResourceHandle) -> Result<RawResource> {
        let raw = self.raw(handle)?;
        recorder.track(handle, raw);
        Ok(raw)
    }

    /// Handles among `handles` that are not in their idle state.
    pub fn non_idle(&self, handles: &[ResourceHandle]) -> Vec<ResourceHandle> {
        handles
            .iter()
            .copied()
            .filter(|&h| self.entry(h).is_ok_and(|e| e.state != e.idle_state))
            .collect()
    }

    /// Record that the batch signaling `value` on `queue` used `handles`.
    pub fn mark_submitted(&mut self, handles: &[ResourceHandle], queue: QueueKind, value: u64) {
        for &handle in handles {
            if let Ok(entry) = self.entry_mut(handle) {
                set_mark(&mut entry.last_use, FenceMark { queue, value });
            }
        }
    }

    pub fn last_use(&self, handle: ResourceHandle) -> Result<&[FenceMark]> {
        self.entry(handle).map(|e| e.last_use.as_slice())
    }

    /// Whether any batch that used `handle` may still be executing.
    pub fn in_flight(
        &self,
        device: &dyn GpuDevice,
        handle: ResourceHandle,
        queues: &[&CommandQueue],
    ) -> Result<bool> {
        let entry = self.entry(handle)?;
        Ok(!marks_reached(device, &entry.last_use, queues))
    }

    /// Give up ownership of `handle`. The handle goes stale immediately; the
    /// resource itself is destroyed by a later [`collect`](Self::collect).
    pub fn release(&mut self, handle: ResourceHandle) -> Result<()> {
        self.entry(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        if let Some(entry) = slot.entry.take() {
            debug!("Retiring resource {}", entry.name);
            self.retired.push(Retired {
                raw: entry.raw,
                name: entry.name,
                last_use: entry.last_use,
            });
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    /// Retire every live resource.
    pub fn release_all(&mut self) {
        for index in 0..self.slots.len() {
            let handle = ResourceHandle {
                index: index as u32,
                generation: self.slots[index].generation,
            };
            if self.contains(handle) {
                let _ = self.release(handle);
            }
        }
    }

    /// Destroy retired resources whose fence marks are all reached. Returns
    /// how many were destroyed.
    pub fn collect(&mut self, device: &mut dyn GpuDevice, queues: &[&CommandQueue]) -> usize {
        let (ready, pending): (Vec<Retired>, Vec<Retired>) = self
            .retired
            .drain(..)
            .partition(|r| marks_reached(&*device, &r.last_use, queues));
        self.retired = pending;

        for retired in &ready {
            debug!("Destroying resource {}", retired.name);
            device.release_resource(retired.raw);
        }
        ready.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

fn set_mark(marks: &mut Vec<FenceMark>, mark: FenceMark) {
    match marks.iter_mut().find(|m| m.queue == mark.queue) {
        Some(existing) => existing.value = existing.value.max(mark.value),
        None => marks.push(mark),
    }
}

/// A mark on a queue that is not in `queues` counts as reached: the caller
/// vouches that queue can no longer touch the resource.
fn marks_reached(device: &dyn GpuDevice, marks: &[FenceMark], queues: &[&CommandQueue]) -> bool {
    marks.iter().all(|mark| {
        queues
            .iter()
            .find(|q| q.kind() == mark.queue)
            .map_or(true, |q| q.fence().is_reached(device, mark.value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GpuContext;
    use crate::gpu::null::{GpuPacing, NullDevice};
    use crate::gpu::{Format, TextureDesc};

    fn texture(ctx: &mut GpuContext, name: &str, state: ResourceState) -> (RawResource, ResourceHandle) {
        let desc = TextureDesc {
            name: name.to_string(),
            width: 8,
            height: 8,
            format: Format::Rgba8Unorm,
            allow_unordered_access: true,
        };
        let raw = ctx.device.create_texture(&desc, state).unwrap();
        (raw, ctx.resources.register(raw, state, state, name))
    }

    #[test]
    fn test_second_transition_emits_nothing() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let (_, fb) = texture(&mut ctx, "framebuffer", ResourceState::UnorderedAccess);

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        let sequence = [
            ResourceState::CopySource,
            ResourceState::CopySource,
            ResourceState::UnorderedAccess,
            ResourceState::UnorderedAccess,
            ResourceState::CopySource,
        ];
        let mut emitted = Vec::new();
        for state in sequence {
            emitted.push(ctx.resources.transition(&mut rec, fb, state).unwrap());
            assert_eq!(ctx.resources.state(fb).unwrap(), state);
        }
        assert_eq!(emitted, vec![true, false, true, false, true]);
        assert_eq!(rec.barrier_count(), 3);

        assert!(ctx.resources.restore_idle(&mut rec, fb).unwrap());
        assert!(ctx.resources.non_idle(&[fb]).is_empty());
    }

    #[test]
    fn test_discard_restores_across_recorders_in_any_order() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        let compute = CommandQueue::new(ctx.device_mut(), QueueKind::Compute, 1).unwrap();
        let direct = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 1).unwrap();
        let (_, fb) = texture(&mut ctx, "framebuffer", ResourceState::Common);

        let mut first = compute.record_batch(ctx.device()).unwrap();
        ctx.resources.transition(&mut first, fb, ResourceState::UnorderedAccess).unwrap();
        let mut second = direct.record_batch(ctx.device()).unwrap();
        ctx.resources.transition(&mut second, fb, ResourceState::CopySource).unwrap();
        ctx.resources.transition(&mut second, fb, ResourceState::UnorderedAccess).unwrap();

        ctx.resources.discard(first);
        ctx.resources.discard(second);
        assert_eq!(ctx.resources.state(fb).unwrap(), ResourceState::Common);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        let (_, old) = texture(&mut ctx, "old", ResourceState::Common);
        ctx.resources.release(old).unwrap();

        let (_, new) = texture(&mut ctx, "new", ResourceState::Common);
        assert_ne!(old, new);
        assert!(matches!(ctx.resources.state(old), Err(EngineError::StaleResource(h)) if h == old));
        assert!(matches!(ctx.resources.release(old), Err(EngineError::StaleResource(_))));
        assert_eq!(ctx.resources.name(new).unwrap(), "new");
    }

    #[test]
    fn test_release_waits_for_fence_marks() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut ctx = GpuContext::new(Box::new(gpu.clone()));
        let mut queue = CommandQueue::new(ctx.device_mut(), QueueKind::Direct, 2).unwrap();
        let (raw, target) = texture(&mut ctx, "target", ResourceState::Common);

        let mut rec = queue.record_batch(ctx.device()).unwrap();
        ctx.resources.transition(&mut rec, target, ResourceState::RenderTarget).unwrap();
        ctx.resources.transition(&mut rec, target, ResourceState::Common).unwrap();
        let value = queue.submit(&mut ctx, rec).unwrap();
        assert_eq!(
            ctx.resources.last_use(target).unwrap(),
            &[FenceMark {
                queue: QueueKind::Direct,
                value
            }]
        );
        assert!(ctx.resources.in_flight(ctx.device(), target, &[&queue]).unwrap());

        ctx.resources.release(target).unwrap();
        assert_eq!(ctx.collect(&[&queue]), 0);
        assert!(gpu.is_alive(raw));

        gpu.complete_all();
        assert_eq!(ctx.collect(&[&queue]), 1);
        assert!(!gpu.is_alive(raw));
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_release_all_retires_everything() {
        let mut ctx = GpuContext::new(Box::new(NullDevice::new()));
        for name in ["a", "b", "c"] {
            texture(&mut ctx, name, ResourceState::Common);
        }
        ctx.resources.release_all();
        assert_eq!(ctx.resources.live_count(), 0);
        assert_eq!(ctx.resources.retired_count(), 3);
        assert_eq!(ctx.collect(&[]), 3);
    }
}
