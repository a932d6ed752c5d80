//! D3D12 Device Module
//!
//! Direct3D 12 implementation of [`GpuDevice`]. Raw ids handed out by the
//! trait map onto COM objects kept in per-kind tables; dropping a table entry
//! releases the host reference.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::mem::ManuallyDrop;
use std::time::Duration;

use tracing::{debug, info, warn};
use windows::core::{Interface, HSTRING, PCSTR};
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, HWND, RECT};
use windows::Win32::Graphics::Direct3D::Fxc::{
    D3DCompileFromFile, D3DCOMPILE_DEBUG, D3DCOMPILE_OPTIMIZATION_LEVEL3,
};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_FEATURE_LEVEL_11_0, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

use crate::error::{EngineError, Result};
use crate::gpu::{
    wait_until_reached, Batch, BufferDesc, Command, CpuDescriptor, DescriptorKind, Format, GpuDescriptor,
    GpuDevice, HeapInfo, HeapType, PipelineId, QueueKind, RawFence, RawHeap, RawQueue, RawResource,
    RawSwapChain, ResourceState, ShaderBlob, ShaderSource, Surface, SwapChainDesc, TextureDesc,
};

/// Adapter selection and debug options.
#[derive(Debug, Clone, Default)]
pub struct D3d12Options {
    pub adapter_index: u32,
    pub use_warp: bool,
    pub debug_layer: bool,
}

struct QueueObjects {
    kind: QueueKind,
    queue: ID3D12CommandQueue,
    allocators: Vec<ID3D12CommandAllocator>,
    list: ID3D12GraphicsCommandList,
}

struct SwapChainObjects {
    swap_chain: IDXGISwapChain3,
    buffer_count: u32,
    format: DXGI_FORMAT,
    flags: DXGI_SWAP_CHAIN_FLAG,
}

struct PipelineObjects {
    root_signature: ID3D12RootSignature,
    state: ID3D12PipelineState,
}

/// D3D12 adapter behind the [`GpuDevice`] seam.
pub struct D3d12Device {
    factory: IDXGIFactory4,
    device: ID3D12Device,
    adapter_name: String,
    tearing_supported: bool,
    fence_event: HANDLE,
    next_id: u64,
    queues: HashMap<u64, QueueObjects>,
    fences: HashMap<u64, ID3D12Fence>,
    heaps: HashMap<u64, ID3D12DescriptorHeap>,
    resources: HashMap<u64, ID3D12Resource>,
    swap_chains: HashMap<u64, SwapChainObjects>,
    pipelines: HashMap<u64, PipelineObjects>,
}

trait DeviceResultExt<T> {
    fn or_device(self, what: &str) -> Result<T>;
    fn or_resource(self, what: &str) -> Result<T>;
}

impl<T> DeviceResultExt<T> for windows::core::Result<T> {
    fn or_device(self, what: &str) -> Result<T> {
        self.map_err(|e| EngineError::Device(format!("{}: {}", what, e)))
    }

    fn or_resource(self, what: &str) -> Result<T> {
        self.map_err(|e| EngineError::ResourceCreateFailed(format!("{}: {}", what, e)))
    }
}

impl D3d12Device {
    /// Create the DXGI factory and a feature level 11.0 device.
    pub fn new(options: &D3d12Options) -> Result<Self> {
        info!("Creating D3D12 device...");
        let create_failed = |what: &str, e: windows::core::Error| {
            EngineError::DeviceCreateFailed(format!("{}: {}", what, e))
        };

        unsafe {
            if options.debug_layer {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            info!("D3D12 debug layer enabled");
                        }
                    }
                    Err(e) => warn!("D3D12 debug layer unavailable: {}", e),
                }
            }

            let factory: IDXGIFactory4 = CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0))
                .map_err(|e| create_failed("CreateDXGIFactory2", e))?;

            let adapter = if options.use_warp {
                factory
                    .EnumWarpAdapter::<IDXGIAdapter1>()
                    .map_err(|e| create_failed("EnumWarpAdapter", e))?
            } else {
                select_hardware_adapter(&factory, options.adapter_index)?
            };
            let adapter_desc = adapter
                .GetDesc1()
                .map_err(|e| create_failed("GetDesc1", e))?;
            let adapter_name = utf16_name(&adapter_desc.Description);

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device)
                .map_err(|e| create_failed("D3D12CreateDevice", e))?;
            let device = device.ok_or_else(|| {
                EngineError::DeviceCreateFailed("D3D12CreateDevice returned no device".to_string())
            })?;

            let tearing_supported = check_tearing_support(&factory);
            let fence_event = CreateEventW(None, false, false, None)
                .map_err(|e| create_failed("CreateEventW", e))?;

            info!(
                "D3D12 device on {} (tearing {})",
                adapter_name,
                if tearing_supported { "supported" } else { "unsupported" }
            );

            Ok(Self {
                factory,
                device,
                adapter_name,
                tearing_supported,
                fence_event,
                next_id: 1,
                queues: HashMap::new(),
                fences: HashMap::new(),
                heaps: HashMap::new(),
                resources: HashMap::new(),
                swap_chains: HashMap::new(),
                pipelines: HashMap::new(),
            })
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn resource(&self, raw: RawResource) -> Result<&ID3D12Resource> {
        self.resources
            .get(&raw.0)
            .ok_or_else(|| EngineError::Device(format!("unknown resource {:?}", raw)))
    }

    fn queue(&self, raw: RawQueue) -> Result<&QueueObjects> {
        self.queues
            .get(&raw.0)
            .ok_or_else(|| EngineError::Device(format!("unknown queue {:?}", raw)))
    }

    fn fence(&self, raw: RawFence) -> Result<&ID3D12Fence> {
        self.fences
            .get(&raw.0)
            .ok_or_else(|| EngineError::Device(format!("unknown fence {:?}", raw)))
    }

    fn swap_chain(&self, raw: RawSwapChain) -> Result<&SwapChainObjects> {
        self.swap_chains
            .get(&raw.0)
            .ok_or_else(|| EngineError::Device(format!("unknown swap chain {:?}", raw)))
    }

    fn pipeline(&self, id: PipelineId) -> Result<&PipelineObjects> {
        self.pipelines
            .get(&id.0)
            .ok_or_else(|| EngineError::Device(format!("unknown pipeline {:?}", id)))
    }

    fn insert_resource(&mut self, resource: ID3D12Resource, name: &str) -> RawResource {
        unsafe {
            let _ = resource.SetName(&HSTRING::from(name));
        }
        let id = self.alloc_id();
        self.resources.insert(id, resource);
        debug!("Created resource {} ({})", id, name);
        RawResource(id)
    }

    fn create_committed(
        &mut self,
        name: &str,
        heap: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        initial: ResourceState,
    ) -> Result<RawResource> {
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device
                .CreateCommittedResource(
                    &D3D12_HEAP_PROPERTIES {
                        Type: heap,
                        ..Default::default()
                    },
                    D3D12_HEAP_FLAG_NONE,
                    desc,
                    d3d12_state(initial),
                    None,
                    &mut resource,
                )
                .or_resource(name)?;
        }
        let resource =
            resource.ok_or_else(|| EngineError::ResourceCreateFailed(format!("{}: no resource returned", name)))?;
        Ok(self.insert_resource(resource, name))
    }

    fn record(&self, list: &ID3D12GraphicsCommandList, command: &Command) -> Result<()> {
        unsafe {
            match *command {
                Command::Barrier {
                    resource,
                    before,
                    after,
                } => {
                    let resource = self.resource(resource)?;
                    list.ResourceBarrier(&[transition_barrier(resource, before, after)]);
                }
                Command::SetDescriptorHeap(raw) => {
                    let heap = self
                        .heaps
                        .get(&raw.0)
                        .ok_or_else(|| EngineError::Device(format!("unknown heap {:?}", raw)))?;
                    list.SetDescriptorHeaps(&[Some(heap.clone())]);
                }
                Command::SetComputePipeline(id) => {
                    let pipeline = self.pipeline(id)?;
                    list.SetComputeRootSignature(&pipeline.root_signature);
                    list.SetPipelineState(&pipeline.state);
                }
                Command::SetGraphicsPipeline(id) => {
                    let pipeline = self.pipeline(id)?;
                    list.SetGraphicsRootSignature(&pipeline.root_signature);
                    list.SetPipelineState(&pipeline.state);
                    list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                }
                Command::SetComputeTable { parameter, base } => {
                    list.SetComputeRootDescriptorTable(parameter, D3D12_GPU_DESCRIPTOR_HANDLE { ptr: base.0 });
                }
                Command::Dispatch { x, y, z } => list.Dispatch(x, y, z),
                Command::ClearRenderTarget { view, color } => {
                    list.ClearRenderTargetView(cpu_handle(view), &color, None);
                }
                Command::SetViewport { width, height } => {
                    list.RSSetViewports(&[D3D12_VIEWPORT {
                        TopLeftX: 0.0,
                        TopLeftY: 0.0,
                        Width: width as f32,
                        Height: height as f32,
                        MinDepth: D3D12_MIN_DEPTH,
                        MaxDepth: D3D12_MAX_DEPTH,
                    }]);
                    list.RSSetScissorRects(&[RECT {
                        left: 0,
                        top: 0,
                        right: width as i32,
                        bottom: height as i32,
                    }]);
                }
                Command::SetRenderTarget { view } => {
                    list.OMSetRenderTargets(1, Some(&cpu_handle(view)), false, None);
                }
                Command::SetVertexBuffer { buffer, size, stride } => {
                    let buffer = self.resource(buffer)?;
                    list.IASetVertexBuffers(
                        0,
                        Some(&[D3D12_VERTEX_BUFFER_VIEW {
                            BufferLocation: buffer.GetGPUVirtualAddress(),
                            SizeInBytes: size,
                            StrideInBytes: stride,
                        }]),
                    );
                }
                Command::SetIndexBuffer { buffer, size } => {
                    let buffer = self.resource(buffer)?;
                    list.IASetIndexBuffer(Some(&D3D12_INDEX_BUFFER_VIEW {
                        BufferLocation: buffer.GetGPUVirtualAddress(),
                        SizeInBytes: size,
                        Format: DXGI_FORMAT_R16_UINT,
                    }));
                }
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                } => list.DrawIndexedInstanced(index_count, instance_count, 0, 0, 0),
                Command::CopyResource { dst, src } => {
                    list.CopyResource(self.resource(dst)?, self.resource(src)?);
                }
                Command::CopyBuffer { dst, src, size } => {
                    list.CopyBufferRegion(self.resource(dst)?, 0, self.resource(src)?, 0, size);
                }
            }
        }
        Ok(())
    }
}

impl Drop for D3d12Device {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            warn!("D3D12 device dropped with {} live resources", self.resources.len());
        }
        unsafe {
            if !self.fence_event.is_invalid() {
                let _ = CloseHandle(self.fence_event);
            }
        }
    }
}

impl GpuDevice for D3d12Device {
    fn adapter_name(&self) -> String {
        self.adapter_name.clone()
    }

    fn tearing_supported(&self) -> bool {
        self.tearing_supported
    }

    fn create_queue(&mut self, kind: QueueKind, slot_count: usize) -> Result<RawQueue> {
        let list_type = list_type(kind);
        let objects = unsafe {
            let queue: ID3D12CommandQueue = self
                .device
                .CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                    Type: list_type,
                    ..Default::default()
                })
                .or_device("CreateCommandQueue")?;

            let mut allocators = Vec::with_capacity(slot_count);
            for _ in 0..slot_count {
                let allocator: ID3D12CommandAllocator = self
                    .device
                    .CreateCommandAllocator(list_type)
                    .or_device("CreateCommandAllocator")?;
                allocators.push(allocator);
            }

            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, list_type, &allocators[0], None)
                .or_device("CreateCommandList")?;
            list.Close().or_device("Close")?;

            QueueObjects {
                kind,
                queue,
                allocators,
                list,
            }
        };

        let id = self.alloc_id();
        self.queues.insert(id, objects);
        debug!("Created {:?} queue {} with {} slots", kind, id, slot_count);
        Ok(RawQueue(id))
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<RawFence> {
        let fence: ID3D12Fence = unsafe {
            self.device
                .CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)
                .or_device("CreateFence")?
        };
        let id = self.alloc_id();
        self.fences.insert(id, fence);
        Ok(RawFence(id))
    }

    fn execute(&mut self, queue: RawQueue, slot: usize, batch: &Batch) -> Result<()> {
        let objects = self.queue(queue)?;
        let allocator = objects.allocators.get(slot).ok_or_else(|| {
            EngineError::Device(format!("{:?} queue has no slot {}", objects.kind, slot))
        })?;

        unsafe {
            allocator.Reset().or_device("ID3D12CommandAllocator::Reset")?;
            objects
                .list
                .Reset(allocator, None)
                .or_device("ID3D12GraphicsCommandList::Reset")?;
        }

        for command in &batch.commands {
            self.record(&objects.list, command)?;
        }

        unsafe {
            objects.list.Close().or_device("ID3D12GraphicsCommandList::Close")?;
            let lists = [Some(
                objects
                    .list
                    .cast::<ID3D12CommandList>()
                    .or_device("cast ID3D12CommandList")?,
            )];
            objects.queue.ExecuteCommandLists(&lists);
        }
        Ok(())
    }

    fn signal(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        unsafe { self.queue(queue)?.queue.Signal(fence, value).or_device("Signal") }
    }

    fn queue_wait(&mut self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let fence = self.fence(fence)?;
        unsafe { self.queue(queue)?.queue.Wait(fence, value).or_device("Wait") }
    }

    fn completed_value(&self, fence: RawFence) -> u64 {
        match self.fences.get(&fence.0) {
            Some(fence) => unsafe { fence.GetCompletedValue() },
            None => 0,
        }
    }

    fn wait_for_value(&mut self, fence: RawFence, value: u64, timeout: Duration) -> Result<bool> {
        let event = self.fence_event;
        let fence = self.fence(fence)?;
        wait_until_reached(
            value,
            timeout,
            || unsafe { fence.GetCompletedValue() },
            |remaining| unsafe {
                fence
                    .SetEventOnCompletion(value, event)
                    .or_device("SetEventOnCompletion")?;
                let millis = u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX).max(1);
                let _ = WaitForSingleObject(event, millis);
                Ok(())
            },
        )
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<HeapInfo> {
        let heap_type = match kind {
            DescriptorKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            DescriptorKind::ShaderResource => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        };
        let flags = if shader_visible {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };

        let (heap, increment, cpu_start, gpu_start) = unsafe {
            let heap: ID3D12DescriptorHeap = self
                .device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: heap_type,
                    NumDescriptors: capacity,
                    Flags: flags,
                    NodeMask: 0,
                })
                .or_resource("CreateDescriptorHeap")?;
            let increment = self.device.GetDescriptorHandleIncrementSize(heap_type);
            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart();
            let gpu_start = shader_visible.then(|| heap.GetGPUDescriptorHandleForHeapStart());
            (heap, increment, cpu_start, gpu_start)
        };

        let id = self.alloc_id();
        self.heaps.insert(id, heap);
        debug!("Created {:?} descriptor heap {} ({} slots)", kind, id, capacity);
        Ok(HeapInfo {
            raw: RawHeap(id),
            cpu_start: CpuDescriptor(cpu_start.ptr as u64),
            gpu_start: gpu_start.map(|handle| GpuDescriptor(handle.ptr)),
            increment,
        })
    }

    fn create_render_target_view(&mut self, resource: RawResource, dest: CpuDescriptor) {
        match self.resources.get(&resource.0) {
            Some(resource) => unsafe { self.device.CreateRenderTargetView(resource, None, cpu_handle(dest)) },
            None => warn!("render target view for unknown resource {:?}", resource),
        }
    }

    fn create_unordered_access_view(&mut self, resource: RawResource, dest: CpuDescriptor) {
        match self.resources.get(&resource.0) {
            Some(resource) => unsafe {
                let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                    ..Default::default()
                };
                self.device
                    .CreateUnorderedAccessView(resource, None, Some(&desc), cpu_handle(dest));
            },
            None => warn!("unordered access view for unknown resource {:?}", resource),
        }
    }

    fn create_constant_buffer_view(&mut self, resource: RawResource, size: u64, dest: CpuDescriptor) {
        match self.resources.get(&resource.0) {
            Some(resource) => unsafe {
                let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                    BufferLocation: resource.GetGPUVirtualAddress(),
                    SizeInBytes: size as u32,
                };
                self.device.CreateConstantBufferView(Some(&desc), cpu_handle(dest));
            },
            None => warn!("constant buffer view for unknown resource {:?}", resource),
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc, initial: ResourceState) -> Result<RawResource> {
        let flags = if desc.allow_unordered_access {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Width: u64::from(desc.width),
            Height: desc.height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
            ..Default::default()
        };
        self.create_committed(&desc.name, D3D12_HEAP_TYPE_DEFAULT, &resource_desc, initial)
    }

    fn create_buffer(&mut self, desc: &BufferDesc, initial: ResourceState) -> Result<RawResource> {
        let heap = match desc.heap {
            HeapType::Default => D3D12_HEAP_TYPE_DEFAULT,
            HeapType::Upload => D3D12_HEAP_TYPE_UPLOAD,
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: desc.size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };
        self.create_committed(&desc.name, heap, &resource_desc, initial)
    }

    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> Result<()> {
        let resource = self.resource(resource)?;
        unsafe {
            let mut mapped: *mut c_void = std::ptr::null_mut();
            // Empty read range: the CPU never reads back.
            let read_range = D3D12_RANGE { Begin: 0, End: 0 };
            resource
                .Map(0, Some(&read_range), Some(&mut mapped))
                .or_device("Map")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), (mapped as *mut u8).add(offset as usize), data.len());
            resource.Unmap(0, None);
        }
        Ok(())
    }

    fn release_resource(&mut self, resource: RawResource) {
        if self.resources.remove(&resource.0).is_some() {
            debug!("Released resource {}", resource.0);
        } else {
            warn!("Attempted to release non-existent resource {}", resource.0);
        }
    }

    fn create_swap_chain(
        &mut self,
        queue: RawQueue,
        surface: Surface,
        desc: &SwapChainDesc,
    ) -> Result<RawSwapChain> {
        let hwnd = match surface {
            Surface::Win32 { hwnd } => HWND(hwnd as *mut c_void),
            Surface::Headless => {
                return Err(EngineError::SurfaceCreateFailed(
                    "D3D12 swap chains need a window surface".to_string(),
                ))
            }
        };
        let flags = if self.tearing_supported {
            DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING
        } else {
            DXGI_SWAP_CHAIN_FLAG(0)
        };
        let format = dxgi_format(desc.format);

        let swap_chain = unsafe {
            let queue = &self.queue(queue)?.queue;
            let swap_chain: IDXGISwapChain1 = self
                .factory
                .CreateSwapChainForHwnd(
                    queue,
                    hwnd,
                    &DXGI_SWAP_CHAIN_DESC1 {
                        Width: desc.width,
                        Height: desc.height,
                        Format: format,
                        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                        BufferCount: desc.buffer_count,
                        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                        Flags: flags.0 as u32,
                        ..Default::default()
                    },
                    None,
                    None,
                )
                .map_err(|e| EngineError::SurfaceCreateFailed(format!("CreateSwapChainForHwnd: {}", e)))?;

            // Fullscreen is handled by the window as a borderless resize.
            self.factory
                .MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER)
                .or_device("MakeWindowAssociation")?;

            swap_chain
                .cast::<IDXGISwapChain3>()
                .map_err(|e| EngineError::SurfaceCreateFailed(format!("IDXGISwapChain3: {}", e)))?
        };

        let id = self.alloc_id();
        self.swap_chains.insert(
            id,
            SwapChainObjects {
                swap_chain,
                buffer_count: desc.buffer_count,
                format,
                flags,
            },
        );
        info!(
            "Created swap chain {}x{} with {} buffers",
            desc.width, desc.height, desc.buffer_count
        );
        Ok(RawSwapChain(id))
    }

    fn swap_chain_buffer(&mut self, swap_chain: RawSwapChain, index: u32) -> Result<RawResource> {
        let buffer: ID3D12Resource = unsafe {
            self.swap_chain(swap_chain)?
                .swap_chain
                .GetBuffer(index)
                .or_resource("GetBuffer")?
        };
        Ok(self.insert_resource(buffer, &format!("back buffer {}", index)))
    }

    fn resize_swap_chain(&mut self, swap_chain: RawSwapChain, width: u32, height: u32) -> Result<()> {
        let objects = self.swap_chain(swap_chain)?;
        unsafe {
            objects
                .swap_chain
                .ResizeBuffers(objects.buffer_count, width, height, objects.format, objects.flags)
                .or_device("ResizeBuffers")
        }
    }

    fn present(&mut self, swap_chain: RawSwapChain, sync_interval: u32, allow_tearing: bool) -> Result<()> {
        let flags = if allow_tearing {
            DXGI_PRESENT_ALLOW_TEARING
        } else {
            DXGI_PRESENT(0)
        };
        unsafe {
            self.swap_chain(swap_chain)?
                .swap_chain
                .Present(sync_interval, flags)
                .ok()
                .or_device("Present")
        }
    }

    fn current_back_buffer_index(&self, swap_chain: RawSwapChain) -> u32 {
        match self.swap_chains.get(&swap_chain.0) {
            Some(objects) => unsafe { objects.swap_chain.GetCurrentBackBufferIndex() },
            None => 0,
        }
    }

    fn compile_shader(&mut self, source: &ShaderSource) -> Result<ShaderBlob> {
        let compile_failed = |message: String| EngineError::ShaderCompileFailed {
            path: source.path.clone(),
            message,
        };
        let entry = CString::new(source.entry_point.as_str()).map_err(|e| compile_failed(e.to_string()))?;
        let target = CString::new(source.target.as_str()).map_err(|e| compile_failed(e.to_string()))?;
        let flags = if cfg!(debug_assertions) {
            D3DCOMPILE_DEBUG
        } else {
            D3DCOMPILE_OPTIMIZATION_LEVEL3
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        let result = unsafe {
            D3DCompileFromFile(
                &HSTRING::from(source.path.as_os_str()),
                None,
                None,
                PCSTR(entry.as_ptr() as *const u8),
                PCSTR(target.as_ptr() as *const u8),
                flags,
                0,
                &mut blob,
                Some(&mut errors),
            )
        };

        if let Err(e) = result {
            let message = match errors {
                Some(errors) => String::from_utf8_lossy(unsafe { blob_bytes(&errors) }).into_owned(),
                None => e.to_string(),
            };
            return Err(compile_failed(message));
        }
        let blob = blob.ok_or_else(|| compile_failed("compiler returned no bytecode".to_string()))?;
        Ok(ShaderBlob {
            path: source.path.clone(),
            bytecode: unsafe { blob_bytes(&blob) }.to_vec(),
        })
    }

    fn create_compute_pipeline(&mut self, shader: &ShaderBlob) -> Result<PipelineId> {
        let uav_range = D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
            NumDescriptors: 1,
            BaseShaderRegister: 0,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
        };
        let cbv_range = D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
            ..uav_range
        };
        let parameters = [table_parameter(&uav_range), table_parameter(&cbv_range)];
        let root_signature = self.create_root_signature(&D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            ..Default::default()
        })?;

        let state: ID3D12PipelineState = unsafe {
            let desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
                pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
                CS: bytecode(shader),
                ..Default::default()
            };
            let state = self.device.CreateComputePipelineState(&desc);
            drop(ManuallyDrop::into_inner(desc.pRootSignature));
            state.or_resource("CreateComputePipelineState")?
        };

        Ok(self.insert_pipeline(root_signature, state))
    }

    fn create_graphics_pipeline(
        &mut self,
        vertex: &ShaderBlob,
        pixel: &ShaderBlob,
        format: Format,
    ) -> Result<PipelineId> {
        let root_signature = self.create_root_signature(&D3D12_ROOT_SIGNATURE_DESC {
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
            ..Default::default()
        })?;

        let input_elements = [D3D12_INPUT_ELEMENT_DESC {
            SemanticName: PCSTR(b"POSITION\0".as_ptr()),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 0,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        }];

        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        rtv_formats[0] = dxgi_format(format);
        let mut blend = D3D12_BLEND_DESC::default();
        blend.RenderTarget[0].RenderTargetWriteMask = D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8;

        let state: ID3D12PipelineState = unsafe {
            let desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
                pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
                VS: bytecode(vertex),
                PS: bytecode(pixel),
                BlendState: blend,
                SampleMask: u32::MAX,
                RasterizerState: D3D12_RASTERIZER_DESC {
                    FillMode: D3D12_FILL_MODE_SOLID,
                    CullMode: D3D12_CULL_MODE_NONE,
                    DepthClipEnable: true.into(),
                    ..Default::default()
                },
                InputLayout: D3D12_INPUT_LAYOUT_DESC {
                    pInputElementDescs: input_elements.as_ptr(),
                    NumElements: input_elements.len() as u32,
                },
                PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
                NumRenderTargets: 1,
                RTVFormats: rtv_formats,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                ..Default::default()
            };
            let state = self.device.CreateGraphicsPipelineState(&desc);
            drop(ManuallyDrop::into_inner(desc.pRootSignature));
            state.or_resource("CreateGraphicsPipelineState")?
        };

        Ok(self.insert_pipeline(root_signature, state))
    }
}

impl D3d12Device {
    fn create_root_signature(&self, desc: &D3D12_ROOT_SIGNATURE_DESC) -> Result<ID3D12RootSignature> {
        let mut signature: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        unsafe {
            if let Err(e) = D3D12SerializeRootSignature(desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, Some(&mut errors)) {
                let message = match errors {
                    Some(errors) => String::from_utf8_lossy(blob_bytes(&errors)).into_owned(),
                    None => e.to_string(),
                };
                return Err(EngineError::ResourceCreateFailed(format!(
                    "D3D12SerializeRootSignature: {}",
                    message
                )));
            }
            let signature = signature.ok_or_else(|| {
                EngineError::ResourceCreateFailed("D3D12SerializeRootSignature returned no blob".to_string())
            })?;
            self.device
                .CreateRootSignature(0, blob_bytes(&signature))
                .or_resource("CreateRootSignature")
        }
    }

    fn insert_pipeline(&mut self, root_signature: ID3D12RootSignature, state: ID3D12PipelineState) -> PipelineId {
        let id = self.alloc_id();
        self.pipelines.insert(
            id,
            PipelineObjects {
                root_signature,
                state,
            },
        );
        debug!("Created pipeline {}", id);
        PipelineId(id)
    }
}

fn select_hardware_adapter(factory: &IDXGIFactory4, wanted: u32) -> Result<IDXGIAdapter1> {
    let mut hardware_index = 0;
    for i in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(i) } {
            Ok(adapter) => adapter,
            Err(_) => break,
        };
        let desc = match unsafe { adapter.GetDesc1() } {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
            continue;
        }
        let supported = unsafe {
            D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL_11_0,
                std::ptr::null_mut::<Option<ID3D12Device>>(),
            )
        }
        .is_ok();
        if !supported {
            continue;
        }
        if hardware_index == wanted {
            return Ok(adapter);
        }
        hardware_index += 1;
    }
    Err(EngineError::DeviceCreateFailed(format!(
        "no D3D12 hardware adapter at index {}",
        wanted
    )))
}

fn check_tearing_support(factory: &IDXGIFactory4) -> bool {
    let Ok(factory) = factory.cast::<IDXGIFactory5>() else {
        return false;
    };
    let mut allow = BOOL(0);
    let checked = unsafe {
        factory.CheckFeatureSupport(
            DXGI_FEATURE_PRESENT_ALLOW_TEARING,
            &mut allow as *mut BOOL as *mut c_void,
            std::mem::size_of::<BOOL>() as u32,
        )
    };
    checked.is_ok() && allow.as_bool()
}

fn utf16_name(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

fn dxgi_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
    }
}

fn d3d12_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
    }
}

fn cpu_handle(descriptor: CpuDescriptor) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE {
        ptr: descriptor.0 as usize,
    }
}

fn table_parameter(range: &D3D12_DESCRIPTOR_RANGE) -> D3D12_ROOT_PARAMETER {
    D3D12_ROOT_PARAMETER {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
        Anonymous: D3D12_ROOT_PARAMETER_0 {
            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: 1,
                pDescriptorRanges: range,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }
}

fn bytecode(blob: &ShaderBlob) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: blob.bytecode.as_ptr() as *const c_void,
        BytecodeLength: blob.bytecode.len(),
    }
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

/// Transition barrier borrowing `resource` without touching its refcount.
fn transition_barrier(
    resource: &ID3D12Resource,
    before: ResourceState,
    after: ResourceState,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
                StateBefore: d3d12_state(before),
                StateAfter: d3d12_state(after),
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}
