//! Simulated GPU
//!
//! A deterministic stand-in for a real adapter. Work submitted to a queue
//! is kept in a per-queue FIFO and only "executes" when the host waits on a
//! fence ([`GpuPacing::OnDemand`]) or when a test steps the timeline by hand
//! ([`GpuPacing::Manual`]).
//!
//! The device doubles as an oracle: it tracks host and GPU reference counts
//! per resource, applies barriers against its own copy of each resource's
//! state, and records a violation for every rule the engine breaks (wrong
//! barrier source state, release while the GPU still reads, allocator reuse
//! while in flight, ...).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{
    Batch, BufferDesc, Command, CpuDescriptor, DescriptorKind, Format, GpuDescriptor, GpuDevice,
    HeapInfo, HeapType, PipelineId, QueueKind, RawFence, RawHeap, RawQueue, RawResource,
    RawSwapChain, ResourceState, ShaderBlob, ShaderSource, Surface, SwapChainDesc, TextureDesc,
};
use crate::error::{EngineError, Result};

/// Descriptor address space reserved per heap.
const HEAP_ADDRESS_STRIDE: u64 = 0x1000_0000;
const DESCRIPTOR_INCREMENT: u32 = 32;
/// Executed batches kept for inspection.
const BATCH_HISTORY: usize = 64;

/// When the simulated GPU makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPacing {
    /// Queued work runs when the host blocks on a fence.
    OnDemand,
    /// Queued work runs only through [`NullDevice::complete_signals`] and
    /// friends; host waits on unreached values time out immediately.
    Manual,
}

/// Counters exposed for assertions and the headless run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub batches_executed: u64,
    pub batches_completed: u64,
    pub barriers: u64,
    pub signals: u64,
    pub queue_waits: u64,
    pub presents: u64,
    pub resizes: u64,
    pub back_buffers_allocated: u64,
    pub buffer_writes: u64,
    pub resources_created: u64,
    pub resources_destroyed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimKind {
    Texture,
    Buffer(HeapType),
    BackBuffer,
}

#[derive(Debug)]
struct SimResource {
    name: String,
    kind: SimKind,
    /// State as seen by the GPU timeline.
    state: ResourceState,
    host_refs: u32,
    gpu_refs: u32,
    alive: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
enum GpuOp {
    Batch {
        slot: usize,
        batch: Batch,
    },
    Signal {
        fence: RawFence,
        value: u64,
    },
    Wait {
        fence: RawFence,
        value: u64,
    },
}

#[derive(Debug)]
struct SimQueue {
    kind: QueueKind,
    pending: VecDeque<GpuOp>,
    slot_busy: Vec<bool>,
}

#[derive(Debug)]
struct SimSwapChain {
    buffers: Vec<RawResource>,
    width: u32,
    height: u32,
    current: u32,
}

#[derive(Debug)]
struct NullState {
    pacing: GpuPacing,
    tearing_supported: bool,
    next_id: u64,
    queues: BTreeMap<u64, SimQueue>,
    fences: HashMap<u64, u64>,
    resources: HashMap<u64, SimResource>,
    heaps: HashMap<u64, DescriptorKind>,
    swap_chains: HashMap<u64, SimSwapChain>,
    pipelines: HashMap<u64, &'static str>,
    views: HashMap<u64, RawResource>,
    scripted_indices: VecDeque<u32>,
    /// Queues whose next `execute` is refused.
    failing_queues: Vec<QueueKind>,
    history: VecDeque<(QueueKind, Batch)>,
    stats: GpuStats,
    violations: Vec<String>,
}

impl NullState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn violation(&mut self, message: String) {
        warn!("simulated GPU violation: {}", message);
        self.violations.push(message);
    }

    fn fence_value(&self, fence: RawFence) -> u64 {
        self.fences.get(&fence.0).copied().unwrap_or(0)
    }

    fn new_resource(&mut self, name: &str, kind: SimKind, state: ResourceState, size: usize) -> RawResource {
        let id = self.alloc_id();
        let host_refs = if kind == SimKind::BackBuffer { 0 } else { 1 };
        self.resources.insert(
            id,
            SimResource {
                name: name.to_string(),
                kind,
                state,
                host_refs,
                gpu_refs: 0,
                alive: true,
                data: vec![0; size],
            },
        );
        self.stats.resources_created += 1;
        RawResource(id)
    }

    /// Whether the front op of `queue` can run right now.
    fn runnable(&self, queue: &SimQueue) -> bool {
        match queue.pending.front() {
            Some(GpuOp::Wait { fence, value }) => self.fence_value(*fence) >= *value,
            Some(_) => true,
            None => false,
        }
    }

    /// Runs the front op of one queue. Returns the op's signal, if any.
    fn retire_front(&mut self, queue_id: u64) -> Option<(RawFence, u64)> {
        let op = self.queues.get_mut(&queue_id)?.pending.pop_front()?;
        match op {
            GpuOp::Batch { slot, batch } => {
                for cmd in &batch.commands {
                    if let Command::Barrier {
                        resource,
                        before,
                        after,
                    } = cmd
                    {
                        self.apply_barrier(*resource, *before, *after);
                    }
                }
                for raw in &batch.resources {
                    if let Some(res) = self.resources.get_mut(&raw.0) {
                        res.gpu_refs = res.gpu_refs.saturating_sub(1);
                    }
                }
                if let Some(queue) = self.queues.get_mut(&queue_id) {
                    if let Some(busy) = queue.slot_busy.get_mut(slot) {
                        *busy = false;
                    }
                }
                self.stats.batches_completed += 1;
                None
            }
            GpuOp::Signal { fence, value } => {
                let completed = self.fences.entry(fence.0).or_insert(0);
                *completed = (*completed).max(value);
                trace!("fence {} reached {}", fence.0, value);
                Some((fence, value))
            }
            GpuOp::Wait { .. } => None,
        }
    }

    fn apply_barrier(&mut self, raw: RawResource, before: ResourceState, after: ResourceState) {
        let mismatch = match self.resources.get_mut(&raw.0) {
            Some(res) if res.alive => {
                let current = res.state;
                res.state = after;
                (current != before).then(|| format!(
                    "barrier on {} expected {:?} but GPU state is {:?}",
                    res.name, before, current
                ))
            }
            _ => Some(format!("barrier on destroyed resource {}", raw.0)),
        };
        if let Some(message) = mismatch {
            self.violation(message);
        }
    }

    /// Steps every queue until `stop` returns true or nothing can run.
    fn run_until(&mut self, mut stop: impl FnMut(&NullState, Option<(RawFence, u64)>) -> bool) -> bool {
        if stop(self, None) {
            return true;
        }
        loop {
            let mut progressed = false;
            let ids: Vec<u64> = self.queues.keys().copied().collect();
            for id in ids {
                while self.queues.get(&id).is_some_and(|q| self.runnable(q)) {
                    progressed = true;
                    let signal = self.retire_front(id);
                    if stop(self, signal) {
                        return true;
                    }
                }
            }
            if !progressed {
                return false;
            }
        }
    }
}

/// Cloneable handle to a simulated adapter. Clones share one timeline, so a
/// test can keep a clone as an oracle after boxing another into the engine.
#[derive(Debug, Clone)]
pub struct NullDevice {
    inner: Arc<Mutex<NullState>>,
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NullDevice {
    pub fn new() -> Self {
        Self::with_pacing(GpuPacing::OnDemand)
    }

    pub fn with_pacing(pacing: GpuPacing) -> Self {
        debug!("Creating simulated GPU ({:?} pacing)", pacing);
        Self {
            inner: Arc::new(Mutex::new(NullState {
                pacing,
                tearing_supported: true,
                next_id: 0,
                queues: BTreeMap::new(),
                fences: HashMap::new(),
                resources: HashMap::new(),
                heaps: HashMap::new(),
                swap_chains: HashMap::new(),
                pipelines: HashMap::new(),
                views: HashMap::new(),
                scripted_indices: VecDeque::new(),
                failing_queues: Vec::new(),
                history: VecDeque::new(),
                stats: GpuStats::default(),
                violations: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, NullState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_pacing(&self, pacing: GpuPacing) {
        self.state().pacing = pacing;
    }

    pub fn set_tearing_supported(&self, supported: bool) {
        self.state().tearing_supported = supported;
    }

    /// Back-buffer indices handed out by the next presents, in order.
    /// Once exhausted, presents fall back to round-robin.
    pub fn script_present_indices(&self, indices: impl IntoIterator<Item = u32>) {
        self.state().scripted_indices.extend(indices);
    }

    /// Refuse the next batch submitted to a queue of `kind`, the way a real
    /// device fails `ExecuteCommandLists` after removal.
    pub fn fail_next_execute(&self, kind: QueueKind) {
        self.state().failing_queues.push(kind);
    }

    /// Runs queued work until `count` more fence signals have completed.
    /// Returns how many completed.
    pub fn complete_signals(&self, count: usize) -> usize {
        let mut done = 0;
        self.state().run_until(|_, signal| {
            if signal.is_some() {
                done += 1;
            }
            done >= count
        });
        done
    }

    /// Runs every queue until nothing more can make progress.
    pub fn complete_all(&self) {
        self.state().run_until(|_, _| false);
    }

    pub fn pending_ops(&self) -> usize {
        self.state().queues.values().map(|q| q.pending.len()).sum()
    }

    pub fn stats(&self) -> GpuStats {
        self.state().stats.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    pub fn gpu_refs(&self, resource: RawResource) -> u32 {
        self.state().resources.get(&resource.0).map_or(0, |r| r.gpu_refs)
    }

    pub fn host_refs(&self, resource: RawResource) -> u32 {
        self.state().resources.get(&resource.0).map_or(0, |r| r.host_refs)
    }

    pub fn is_alive(&self, resource: RawResource) -> bool {
        self.state().resources.get(&resource.0).is_some_and(|r| r.alive)
    }

    /// State of `resource` on the GPU timeline (after completed work only).
    pub fn gpu_state(&self, resource: RawResource) -> Option<ResourceState> {
        self.state().resources.get(&resource.0).map(|r| r.state)
    }

    pub fn buffer_contents(&self, resource: RawResource) -> Vec<u8> {
        self.state()
            .resources
            .get(&resource.0)
            .map(|r| r.data.clone())
            .unwrap_or_default()
    }

    /// Resource a descriptor currently points at.
    pub fn view_target(&self, view: CpuDescriptor) -> Option<RawResource> {
        self.state().views.get(&view.0).copied()
    }

    /// Most recent executed batches, oldest first.
    pub fn recent_batches(&self) -> Vec<(QueueKind, Batch)> {
        self.state().history.iter().cloned().collect()
    }
}

impl GpuDevice for NullDevice {
    fn adapter_name(&self) -> String {
        "RayVox simulated adapter".to_string()
    }

    fn tearing_supported(&self) -> bool {
        self.state().tearing_supported
    }

    fn create_queue(&mut self, kind: QueueKind, slot_count: usize) -> Result<RawQueue> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.queues.insert(
            id,
            SimQueue {
                kind,
                pending: VecDeque::new(),
                slot_busy: vec![false; slot_count],
            },
        );
        debug!("Simulated {:?} queue {} with {} slots", kind, id, slot_count);
        Ok(RawQueue(id))
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<RawFence> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.fences.insert(id, initial_value);
        Ok(RawFence(id))
    }

    fn execute(&mut self, queue: RawQueue, slot: usize, batch: &Batch) -> Result<()> {
        let mut state = self.state();
        let kind = match state.queues.get(&queue.0) {
            Some(q) => q.kind,
            None => return Err(EngineError::Device(format!("unknown queue {}", queue.0))),
        };
        if let Some(pos) = state.failing_queues.iter().position(|&k| k == kind) {
            state.failing_queues.remove(pos);
            return Err(EngineError::Device(format!("{:?} queue refused batch (device removed)", kind)));
        }

        let slot_in_flight = state.queues[&queue.0].slot_busy.get(slot).copied();
        match slot_in_flight {
            None => {
                return Err(EngineError::Device(format!(
                    "{:?} queue has no recording slot {}",
                    kind, slot
                )))
            }
            Some(true) => {
                state.violation(format!("{:?} allocator {} reset while in flight", kind, slot))
            }
            Some(false) => {}
        }

        for raw in &batch.resources {
            let live = match state.resources.get_mut(&raw.0) {
                Some(res) if res.alive => {
                    res.gpu_refs += 1;
                    true
                }
                _ => false,
            };
            if !live {
                state.violation(format!("batch references destroyed resource {}", raw.0));
            }
        }

        if let Some(q) = state.queues.get_mut(&queue.0) {
            q.slot_busy[slot] = true;
            q.pending.push_back(GpuOp::Batch {
                slot,
                batch: batch.clone(),
            });
        }
        state.stats.batches_executed += 1;
        state.stats.barriers += batch.barrier_count() as u64;
        if state.history.len() == BATCH_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back((kind, batch.clone()));
        Ok(())
    }

    fn signal(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        let q = state
            .queues
            .get_mut(&queue.0)
            .ok_or_else(|| EngineError::Device(format!("unknown queue {}", queue.0)))?;
        q.pending.push_back(GpuOp::Signal { fence, value });
        state.stats.signals += 1;
        Ok(())
    }

    fn queue_wait(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        let q = state
            .queues
            .get_mut(&queue.0)
            .ok_or_else(|| EngineError::Device(format!("unknown queue {}", queue.0)))?;
        q.pending.push_back(GpuOp::Wait { fence, value });
        state.stats.queue_waits += 1;
        Ok(())
    }

    fn completed_value(&self, fence: RawFence) -> u64 {
        self.state().fence_value(fence)
    }

    fn wait_for_value(&mut self, fence: RawFence, value: u64, _timeout: Duration) -> Result<bool> {
        let mut state = self.state();
        if state.pacing == GpuPacing::OnDemand {
            state.run_until(|s, _| s.fence_value(fence) >= value);
        }
        // Nothing else can advance the timeline, so an unreached value here
        // would block forever on real hardware: report the timeout at once.
        Ok(state.fence_value(fence) >= value)
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo> {
        if capacity == 0 {
            return Err(EngineError::ResourceCreateFailed(
                "descriptor heap with zero capacity".to_string(),
            ));
        }
        if shader_visible && kind == DescriptorKind::RenderTarget {
            return Err(EngineError::ResourceCreateFailed(
                "render-target heaps cannot be shader visible".to_string(),
            ));
        }
        let mut state = self.state();
        let id = state.alloc_id();
        state.heaps.insert(id, kind);
        let base = id * HEAP_ADDRESS_STRIDE;
        Ok(HeapInfo {
            raw: RawHeap(id),
            cpu_start: CpuDescriptor(base),
            gpu_start: shader_visible.then_some(GpuDescriptor(base)),
            increment: DESCRIPTOR_INCREMENT,
        })
    }

    fn create_render_target_view(&mut self, resource: RawResource, dest: CpuDescriptor) {
        self.state().views.insert(dest.0, resource);
    }

    fn create_unordered_access_view(&mut self, resource: RawResource, dest: CpuDescriptor) {
        self.state().views.insert(dest.0, resource);
    }

    fn create_constant_buffer_view(&mut self, resource: RawResource, size: u64, dest: CpuDescriptor) {
        let mut state = self.state();
        if size % 256 != 0 {
            state.violation(format!("constant buffer view of {} bytes is not 256-aligned", size));
        }
        state.views.insert(dest.0, resource);
    }

    fn create_texture(&mut self, desc: &TextureDesc, initial: ResourceState) -> Result<RawResource> {
        if desc.width == 0 || desc.height == 0 {
            return Err(EngineError::ResourceCreateFailed(format!(
                "texture {} has zero extent",
                desc.name
            )));
        }
        let raw = self.state().new_resource(&desc.name, SimKind::Texture, initial, 0);
        trace!("Simulated texture {} ({}x{})", desc.name, desc.width, desc.height);
        Ok(raw)
    }

    fn create_buffer(&mut self, desc: &BufferDesc, initial: ResourceState) -> Result<RawResource> {
        if desc.size == 0 {
            return Err(EngineError::ResourceCreateFailed(format!(
                "buffer {} has zero size",
                desc.name
            )));
        }
        if desc.heap == HeapType::Upload && initial != ResourceState::GenericRead {
            return Err(EngineError::ResourceCreateFailed(format!(
                "upload buffer {} must start in GenericRead",
                desc.name
            )));
        }
        let raw = self.state().new_resource(
            &desc.name,
            SimKind::Buffer(desc.heap),
            initial,
            desc.size as usize,
        );
        Ok(raw)
    }

    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let res = state
            .resources
            .get_mut(&resource.0)
            .filter(|r| r.alive)
            .ok_or_else(|| EngineError::Device(format!("write to unknown buffer {}", resource.0)))?;
        if res.kind != SimKind::Buffer(HeapType::Upload) {
            return Err(EngineError::Device(format!("{} is not host visible", res.name)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > res.data.len() {
            return Err(EngineError::Device(format!(
                "write of {} bytes at {} overflows {} ({} bytes)",
                data.len(),
                offset,
                res.name,
                res.data.len()
            )));
        }
        res.data[start..end].copy_from_slice(data);
        let racing = (res.gpu_refs > 0).then(|| format!("host overwrote {} while the GPU reads it", res.name));
        if let Some(message) = racing {
            state.violation(message);
        }
        state.stats.buffer_writes += 1;
        Ok(())
    }

    fn release_resource(&mut self, resource: RawResource) {
        let mut state = self.state();
        let message = match state.resources.get_mut(&resource.0) {
            None => Some(format!("release of unknown resource {}", resource.0)),
            Some(res) if res.host_refs == 0 => Some(format!("double release of {}", res.name)),
            Some(res) => {
                res.host_refs -= 1;
                let mut message = None;
                if res.host_refs == 0 {
                    if res.gpu_refs > 0 {
                        message = Some(format!(
                            "{} released with {} GPU references outstanding",
                            res.name, res.gpu_refs
                        ));
                    }
                    if res.kind != SimKind::BackBuffer {
                        res.alive = false;
                    }
                }
                message
            }
        };
        if let Some(message) = message {
            state.violation(message);
        } else if state.resources.get(&resource.0).is_some_and(|r| !r.alive) {
            state.stats.resources_destroyed += 1;
        }
    }

    fn create_swap_chain(
        &mut self,
        _queue: RawQueue,
        surface: Surface,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain> {
        if surface != Surface::Headless {
            return Err(EngineError::SurfaceCreateFailed(
                "the simulated device can only present headless".to_string(),
            ));
        }
        if !(2..=16).contains(&desc.buffer_count) || desc.width == 0 || desc.height == 0 {
            return Err(EngineError::SurfaceCreateFailed(format!(
                "unsupported swap chain {}x{} with {} buffers",
                desc.width, desc.height, desc.buffer_count
            )));
        }
        let mut state = self.state();
        let buffers = (0..desc.buffer_count)
            .map(|i| {
                state.new_resource(
                    &format!("swapchain_buffer{}", i),
                    SimKind::BackBuffer,
                    ResourceState::Present,
                    0,
                )
            })
            .collect();
        state.stats.back_buffers_allocated += desc.buffer_count as u64;
        let id = state.alloc_id();
        state.swap_chains.insert(
            id,
            SimSwapChain {
                buffers,
                width: desc.width,
                height: desc.height,
                current: 0,
            },
        );
        Ok(RawSwapChain(id))
    }

    fn swap_chain_buffer(&mut self, swap_chain: RawSwapChain, index: u32) -> Result<RawResource> {
        let mut state = self.state();
        let raw = state
            .swap_chains
            .get(&swap_chain.0)
            .and_then(|sc| sc.buffers.get(index as usize).copied())
            .ok_or_else(|| EngineError::Device(format!("no back buffer {}", index)))?;
        if let Some(res) = state.resources.get_mut(&raw.0) {
            res.host_refs += 1;
        }
        Ok(raw)
    }

    fn resize_swap_chain(&mut self, swap_chain: RawSwapChain, width: u32, height: u32) -> Result<()> {
        let mut state = self.state();
        let old = match state.swap_chains.get(&swap_chain.0) {
            Some(sc) => sc.buffers.clone(),
            None => return Err(EngineError::Device(format!("unknown swap chain {}", swap_chain.0))),
        };

        for raw in &old {
            let (host, gpu) = state
                .resources
                .get(&raw.0)
                .map_or((0, 0), |r| (r.host_refs, r.gpu_refs));
            if gpu > 0 {
                state.violation(format!("resize while the GPU still references back buffer {}", raw.0));
            }
            if host > 0 {
                return Err(EngineError::Device(format!(
                    "cannot resize: back buffer {} still has {} host references",
                    raw.0, host
                )));
            }
        }

        for raw in &old {
            if let Some(res) = state.resources.get_mut(&raw.0) {
                res.alive = false;
            }
            state.stats.resources_destroyed += 1;
        }
        let buffers: Vec<RawResource> = (0..old.len())
            .map(|i| {
                state.new_resource(
                    &format!("swapchain_buffer{}", i),
                    SimKind::BackBuffer,
                    ResourceState::Present,
                    0,
                )
            })
            .collect();
        state.stats.back_buffers_allocated += buffers.len() as u64;
        state.stats.resizes += 1;
        if let Some(sc) = state.swap_chains.get_mut(&swap_chain.0) {
            sc.buffers = buffers;
            sc.width = width;
            sc.height = height;
            sc.current = 0;
        }
        Ok(())
    }

    fn present(&mut self, swap_chain: RawSwapChain, sync_interval: u32, allow_tearing: bool) -> Result<()> {
        let mut state = self.state();
        if sync_interval > 1 {
            return Err(EngineError::Device(format!("invalid sync interval {}", sync_interval)));
        }
        if allow_tearing && (sync_interval != 0 || !state.tearing_supported) {
            return Err(EngineError::Device(
                "tearing requested without support or with vsync on".to_string(),
            ));
        }
        let scripted = state.scripted_indices.pop_front();
        let sc = state
            .swap_chains
            .get_mut(&swap_chain.0)
            .ok_or_else(|| EngineError::Device(format!("unknown swap chain {}", swap_chain.0)))?;
        let count = sc.buffers.len() as u32;
        let next = scripted.unwrap_or((sc.current + 1) % count);
        if next >= count {
            return Err(EngineError::Device(format!("scripted back buffer {} out of range", next)));
        }
        sc.current = next;
        trace!("Simulated present ({}x{}), next buffer {}", sc.width, sc.height, next);
        state.stats.presents += 1;
        Ok(())
    }

    fn current_back_buffer_index(&self, swap_chain: RawSwapChain) -> u32 {
        self.state().swap_chains.get(&swap_chain.0).map_or(0, |sc| sc.current)
    }

    fn compile_shader(&mut self, source: &ShaderSource) -> Result<ShaderBlob> {
        let bytecode = std::fs::read(&source.path).map_err(|e| EngineError::ShaderCompileFailed {
            path: source.path.clone(),
            message: e.to_string(),
        })?;
        if bytecode.is_empty() {
            return Err(EngineError::ShaderCompileFailed {
                path: source.path.clone(),
                message: "empty shader source".to_string(),
            });
        }
        debug!(
            "Simulated compile of {:?} ({} {}, {} bytes)",
            source.path,
            source.entry_point,
            source.target,
            bytecode.len()
        );
        Ok(ShaderBlob {
            path: source.path.clone(),
            bytecode,
        })
    }

    fn create_compute_pipeline(&mut self, _shader: &ShaderBlob) -> Result<PipelineId> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.pipelines.insert(id, "compute");
        Ok(PipelineId(id))
    }

    fn create_graphics_pipeline(
        &mut self,
        _vertex: &ShaderBlob,
        _pixel: &ShaderBlob,
        _format: Format,
    ) -> Result<PipelineId> {
        let mut state = self.state();
        let id = state.alloc_id();
        state.pipelines.insert(id, "graphics");
        Ok(PipelineId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_pacing_holds_work_until_stepped() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 2).unwrap();
        let fence = dev.create_fence(0).unwrap();

        dev.execute(queue, 0, &Batch::default()).unwrap();
        dev.signal(queue, fence, 1).unwrap();
        assert_eq!(dev.completed_value(fence), 0);
        assert!(!dev.wait_for_value(fence, 1, Duration::from_millis(1)).unwrap());

        assert_eq!(gpu.complete_signals(1), 1);
        assert_eq!(dev.completed_value(fence), 1);
        assert_eq!(gpu.pending_ops(), 0);
    }

    #[test]
    fn test_cross_queue_wait_blocks_until_fence() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut dev = gpu.clone();
        let copy = dev.create_queue(QueueKind::Copy, 1).unwrap();
        let direct = dev.create_queue(QueueKind::Direct, 1).unwrap();
        let copy_fence = dev.create_fence(0).unwrap();
        let direct_fence = dev.create_fence(0).unwrap();

        dev.queue_wait(direct, copy_fence, 1).unwrap();
        dev.signal(direct, direct_fence, 1).unwrap();
        gpu.complete_all();
        assert_eq!(dev.completed_value(direct_fence), 0);

        dev.signal(copy, copy_fence, 1).unwrap();
        gpu.complete_all();
        assert_eq!(dev.completed_value(direct_fence), 1);
    }

    #[test]
    fn test_wrong_barrier_source_is_a_violation() {
        let gpu = NullDevice::new();
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 1).unwrap();
        let fence = dev.create_fence(0).unwrap();
        let desc = TextureDesc {
            name: "target".to_string(),
            width: 4,
            height: 4,
            format: Format::Rgba8Unorm,
            allow_unordered_access: true,
        };
        let tex = dev.create_texture(&desc, ResourceState::UnorderedAccess).unwrap();
        let batch = Batch {
            commands: vec![Command::Barrier {
                resource: tex,
                before: ResourceState::CopyDest,
                after: ResourceState::CopySource,
            }],
            resources: vec![tex],
        };
        dev.execute(queue, 0, &batch).unwrap();
        dev.signal(queue, fence, 1).unwrap();
        assert!(dev.wait_for_value(fence, 1, Duration::from_secs(1)).unwrap());

        assert_eq!(gpu.violations().len(), 1);
        assert_eq!(gpu.gpu_state(tex), Some(ResourceState::CopySource));
    }

    #[test]
    fn test_release_while_referenced_is_a_violation() {
        let gpu = NullDevice::with_pacing(GpuPacing::Manual);
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 1).unwrap();
        let buffer = dev
            .create_buffer(
                &BufferDesc {
                    name: "staging".to_string(),
                    size: 16,
                    heap: HeapType::Upload,
                },
                ResourceState::GenericRead,
            )
            .unwrap();
        let batch = Batch {
            commands: Vec::new(),
            resources: vec![buffer],
        };
        dev.execute(queue, 0, &batch).unwrap();
        assert_eq!(gpu.gpu_refs(buffer), 1);

        dev.release_resource(buffer);
        assert_eq!(gpu.violations().len(), 1);
        assert!(!gpu.is_alive(buffer));
    }

    #[test]
    fn test_resize_refused_while_buffers_held() {
        let mut dev = NullDevice::new();
        let queue = dev.create_queue(QueueKind::Direct, 2).unwrap();
        let desc = SwapChainDesc {
            width: 64,
            height: 64,
            buffer_count: 2,
            format: Format::Rgba8Unorm,
        };
        let sc = dev.create_swap_chain(queue, Surface::Headless, &desc).unwrap();
        let buffer = dev.swap_chain_buffer(sc, 0).unwrap();
        assert!(dev.resize_swap_chain(sc, 32, 32).is_err());

        dev.release_resource(buffer);
        dev.resize_swap_chain(sc, 32, 32).unwrap();
        assert_eq!(dev.current_back_buffer_index(sc), 0);
    }

    #[test]
    fn test_present_follows_script_then_round_robin() {
        let gpu = NullDevice::new();
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 3).unwrap();
        let desc = SwapChainDesc {
            width: 8,
            height: 8,
            buffer_count: 3,
            format: Format::Rgba8Unorm,
        };
        let sc = dev.create_swap_chain(queue, Surface::Headless, &desc).unwrap();
        gpu.script_present_indices([2, 0]);

        dev.present(sc, 1, false).unwrap();
        assert_eq!(dev.current_back_buffer_index(sc), 2);
        dev.present(sc, 1, false).unwrap();
        assert_eq!(dev.current_back_buffer_index(sc), 0);
        dev.present(sc, 1, false).unwrap();
        assert_eq!(dev.current_back_buffer_index(sc), 1);
    }

    #[test]
    fn test_tearing_requires_support_and_vsync_off() {
        let gpu = NullDevice::new();
        let mut dev = gpu.clone();
        let queue = dev.create_queue(QueueKind::Direct, 2).unwrap();
        let desc = SwapChainDesc {
            width: 8,
            height: 8,
            buffer_count: 2,
            format: Format::Rgba8Unorm,
        };
        let sc = dev.create_swap_chain(queue, Surface::Headless, &desc).unwrap();
        assert!(dev.present(sc, 1, true).is_err());
        gpu.set_tearing_supported(false);
        assert!(dev.present(sc, 0, true).is_err());
        assert!(dev.present(sc, 0, false).is_ok());
    }
}
