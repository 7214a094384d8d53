//! DirectX 12 后端实现
//!
//! 原生对象保存在以句柄为键的表中。所有表由一把锁保护，录制与提交都很短，不会成为瓶颈。
//! CPU 可见的堆在创建时放置一个覆盖整个堆的缓冲区并保持映射，堆读写直接操作映射内存。

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};
use windows::{core::*, Win32::Foundation::*, Win32::Graphics::Direct3D12::*, Win32::Graphics::Dxgi::Common::*,
    Win32::Graphics::Dxgi::*, Win32::System::Threading::*};

use super::context::Dx12Context;
use crate::core::error::{DeviceError, GpuError, MemoryError, Result};
use crate::gfx::backend::*;

struct Dx12Heap {
    heap: ID3D12Heap,
    size: u64,
    /// CPU 可见堆的整堆缓冲区与映射地址
    mapped: Option<(ID3D12Resource, *mut u8)>,
}

#[derive(Default)]
struct Dx12Objects {
    next_id: u64,
    fences: HashMap<u64, ID3D12Fence>,
    queues: HashMap<u64, ID3D12CommandQueue>,
    heaps: HashMap<u64, Dx12Heap>,
    resources: HashMap<u64, ID3D12Resource>,
    allocators: HashMap<u64, ID3D12CommandAllocator>,
    lists: HashMap<u64, ID3D12GraphicsCommandList>,
}

impl Dx12Objects {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Dx12State {
    context: Dx12Context,
    objects: Dx12Objects,
}

// DirectX 12 的设备对象是自由线程的，映射指针只在持锁时使用
unsafe impl Send for Dx12State {}

/// DirectX 12 后端
pub struct Dx12Backend {
    debug_layer: bool,
    state: Mutex<Dx12State>,
}

impl Dx12Backend {
    pub fn new(debug_layer: bool) -> Result<Self> {
        info!("Initializing DirectX 12 backend...");
        let context = Dx12Context::new(debug_layer)?;
        Ok(Self {
            debug_layer,
            state: Mutex::new(Dx12State {
                context,
                objects: Dx12Objects::default(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, Dx12State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
        QueueKind::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
    }
}

fn native_states(states: ResourceStates) -> D3D12_RESOURCE_STATES {
    D3D12_RESOURCE_STATES(states.bits() as i32)
}

fn texture_format(bytes_per_pixel: u32) -> DXGI_FORMAT {
    match bytes_per_pixel {
        1 => DXGI_FORMAT_R8_UNORM,
        2 => DXGI_FORMAT_R8G8_UNORM,
        8 => DXGI_FORMAT_R16G16B16A16_FLOAT,
        16 => DXGI_FORMAT_R32G32B32A32_FLOAT,
        _ => DXGI_FORMAT_R8G8B8A8_UNORM,
    }
}

fn native_desc(desc: &ResourceDesc) -> D3D12_RESOURCE_DESC {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if desc.render_target {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.unordered_access {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if desc.simultaneous_access {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_SIMULTANEOUS_ACCESS;
    }

    match desc.dimension {
        ResourceDimension::Buffer => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: desc.width,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        },
        ResourceDimension::Texture2d => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: desc.width,
            Height: desc.height,
            DepthOrArraySize: desc.array_size,
            MipLevels: desc.mip_levels,
            Format: texture_format(desc.bytes_per_pixel),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        },
    }
}

fn heap_type(usage: HeapUsage) -> D3D12_HEAP_TYPE {
    match usage {
        HeapUsage::Upload => D3D12_HEAP_TYPE_UPLOAD,
        HeapUsage::Readback => D3D12_HEAP_TYPE_READBACK,
        _ => D3D12_HEAP_TYPE_DEFAULT,
    }
}

fn residency_priority(priority: ResidencyPriority) -> D3D12_RESIDENCY_PRIORITY {
    match priority {
        ResidencyPriority::Low => D3D12_RESIDENCY_PRIORITY_LOW,
        ResidencyPriority::Normal => D3D12_RESIDENCY_PRIORITY_NORMAL,
        ResidencyPriority::High => D3D12_RESIDENCY_PRIORITY_HIGH,
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    subresource: Option<u32>,
    before: ResourceStates,
    after: ResourceStates,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: ManuallyDrop::new(Some(resource.clone())),
                Subresource: subresource.unwrap_or(D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES),
                StateBefore: native_states(before),
                StateAfter: native_states(after),
            }),
        },
    }
}

/// 释放屏障中持有的 COM 引用
fn release_barrier(barrier: D3D12_RESOURCE_BARRIER) {
    unsafe {
        if barrier.Type == D3D12_RESOURCE_BARRIER_TYPE_TRANSITION {
            let transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
            drop(ManuallyDrop::into_inner(transition.pResource));
        } else if barrier.Type == D3D12_RESOURCE_BARRIER_TYPE_UAV {
            let uav = ManuallyDrop::into_inner(barrier.Anonymous.UAV);
            drop(ManuallyDrop::into_inner(uav.pResource));
        } else {
            let aliasing = ManuallyDrop::into_inner(barrier.Anonymous.Aliasing);
            drop(ManuallyDrop::into_inner(aliasing.pResourceBefore));
            drop(ManuallyDrop::into_inner(aliasing.pResourceAfter));
        }
    }
}

impl Dx12Objects {
    fn resource(&self, resource: RawResource) -> Result<&ID3D12Resource> {
        self.resources
            .get(&resource.0)
            .ok_or_else(|| GpuError::call("resource", format!("unknown resource #{}", resource.0)))
    }

    fn heap(&self, heap: RawHeap) -> Result<&Dx12Heap> {
        self.heaps
            .get(&heap.0)
            .ok_or_else(|| GpuError::call("heap", format!("unknown heap #{}", heap.0)))
    }

    fn fence(&self, fence: RawFence) -> Result<&ID3D12Fence> {
        self.fences
            .get(&fence.0)
            .ok_or_else(|| GpuError::call("fence", format!("unknown fence #{}", fence.0)))
    }

    fn pageables(&self, objects: &[Pageable]) -> Result<Vec<Option<ID3D12Pageable>>> {
        objects
            .iter()
            .map(|object| {
                let pageable: ID3D12Pageable = match object {
                    Pageable::Heap(h) => self.heap(*h)?.heap.cast(),
                    Pageable::Resource(r) => self.resource(*r)?.cast(),
                }
                .map_err(|e| GpuError::call("ID3D12Pageable", e))?;
                Ok(Some(pageable))
            })
            .collect()
    }

    fn buffer_location(&self, location: &BufferLocation) -> Result<(ID3D12Resource, u64)> {
        match *location {
            BufferLocation::Heap { heap, offset } => {
                let heap = self.heap(heap)?;
                let (buffer, _) = heap.mapped.as_ref().ok_or(MemoryError::NotCpuVisible)?;
                Ok((buffer.clone(), offset))
            }
            BufferLocation::Resource { resource, offset } => Ok((self.resource(resource)?.clone(), offset)),
        }
    }

    fn texture_location(&self, location: &TextureLocation) -> Result<D3D12_TEXTURE_COPY_LOCATION> {
        match *location {
            TextureLocation::Subresource { resource, index } => Ok(D3D12_TEXTURE_COPY_LOCATION {
                pResource: ManuallyDrop::new(Some(self.resource(resource)?.clone())),
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: index },
            }),
            TextureLocation::Footprint { heap, offset, footprint } => {
                let heap = self.heap(heap)?;
                let (buffer, _) = heap.mapped.as_ref().ok_or(MemoryError::NotCpuVisible)?;
                Ok(D3D12_TEXTURE_COPY_LOCATION {
                    pResource: ManuallyDrop::new(Some(buffer.clone())),
                    Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                            Offset: offset,
                            Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                                Format: texture_format(footprint.bytes_per_pixel),
                                Width: footprint.width,
                                Height: footprint.height,
                                Depth: 1,
                                RowPitch: footprint.row_pitch,
                            },
                        },
                    },
                })
            }
        }
    }
}

impl GpuBackend for Dx12Backend {
    fn name(&self) -> &str {
        "dx12"
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence> {
        let mut state = self.state();
        let fence: ID3D12Fence = unsafe { state.context.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }
            .map_err(|e| GpuError::call("CreateFence", e))?;
        let id = state.objects.next();
        state.objects.fences.insert(id, fence);
        Ok(RawFence(id))
    }

    fn destroy_fence(&self, fence: RawFence) {
        self.state().objects.fences.remove(&fence.0);
    }

    fn fence_completed_value(&self, fence: RawFence) -> u64 {
        let state = self.state();
        match state.objects.fences.get(&fence.0) {
            Some(f) => unsafe { f.GetCompletedValue() },
            None => u64::MAX,
        }
    }

    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()> {
        let state = self.state();
        unsafe { state.objects.fence(fence)?.Signal(value) }.map_err(|e| GpuError::call("ID3D12Fence::Signal", e))
    }

    fn wait_fences(&self, fences: &[(RawFence, u64)], timeout: Option<Duration>) -> Result<bool> {
        // 在锁外等待，其他线程在此期间仍然可以提交
        let (pending, event) = {
            let state = self.state();
            let mut pending = Vec::new();
            for (fence, value) in fences {
                let native = state.objects.fence(*fence)?;
                if unsafe { native.GetCompletedValue() } < *value {
                    pending.push((native.clone(), *value));
                }
            }
            (pending, state.context.wait_event)
        };

        let start = Instant::now();
        for (fence, value) in pending {
            let millis = match timeout {
                Some(t) => t.saturating_sub(start.elapsed()).as_millis() as u32,
                None => INFINITE,
            };
            unsafe {
                fence
                    .SetEventOnCompletion(value, event)
                    .map_err(|e| GpuError::call("SetEventOnCompletion", e))?;
                if WaitForSingleObject(event, millis) != WAIT_OBJECT_0 {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn create_queue(&self, kind: QueueKind) -> Result<RawQueue> {
        let mut state = self.state();
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: list_type(kind),
            Priority: 0,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            NodeMask: 0,
        };
        let queue: ID3D12CommandQueue = unsafe { state.context.device.CreateCommandQueue(&desc) }
            .map_err(|e| GpuError::call("CreateCommandQueue", e))?;
        let id = state.objects.next();
        state.objects.queues.insert(id, queue);
        debug!(kind = kind.name(), "Command queue created");
        Ok(RawQueue(id))
    }

    fn destroy_queue(&self, queue: RawQueue) {
        self.state().objects.queues.remove(&queue.0);
    }

    fn queue_signal(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let state = self.state();
        let native = state
            .objects
            .queues
            .get(&queue.0)
            .ok_or_else(|| GpuError::call("queue", format!("unknown queue #{}", queue.0)))?;
        unsafe { native.Signal(state.objects.fence(fence)?, value) }
            .map_err(|e| GpuError::call("ID3D12CommandQueue::Signal", e))
    }

    fn queue_wait(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let state = self.state();
        let native = state
            .objects
            .queues
            .get(&queue.0)
            .ok_or_else(|| GpuError::call("queue", format!("unknown queue #{}", queue.0)))?;
        unsafe { native.Wait(state.objects.fence(fence)?, value) }
            .map_err(|e| GpuError::call("ID3D12CommandQueue::Wait", e))
    }

    fn execute_command_lists(&self, queue: RawQueue, lists: &[RawCommandList]) -> Result<()> {
        let state = self.state();
        let native = state
            .objects
            .queues
            .get(&queue.0)
            .ok_or_else(|| GpuError::call("queue", format!("unknown queue #{}", queue.0)))?;

        let mut natives = Vec::with_capacity(lists.len());
        for list in lists {
            let list = state
                .objects
                .lists
                .get(&list.0)
                .ok_or_else(|| GpuError::call("list", format!("unknown list #{}", list.0)))?;
            natives.push(Some(list.cast::<ID3D12CommandList>().map_err(|e| GpuError::call("ID3D12CommandList", e))?));
        }

        unsafe { native.ExecuteCommandLists(&natives) };
        Ok(())
    }

    fn create_heap(&self, desc: &HeapDesc) -> Result<RawHeap> {
        let mut state = self.state();
        let state = &mut *state;
        let device = &state.context.device;

        let mut flags = match desc.usage {
            HeapUsage::Upload | HeapUsage::Readback | HeapUsage::GpuBuffers => D3D12_HEAP_FLAG_ALLOW_ONLY_BUFFERS,
            HeapUsage::GpuTextures => D3D12_HEAP_FLAG_ALLOW_ONLY_NON_RT_DS_TEXTURES,
            HeapUsage::GpuTargets => D3D12_HEAP_FLAG_ALLOW_ONLY_RT_DS_TEXTURES,
        };
        if desc.create_not_resident && state.context.supports_not_resident {
            flags |= D3D12_HEAP_FLAG_CREATE_NOT_RESIDENT;
        }

        let heap_desc = D3D12_HEAP_DESC {
            SizeInBytes: desc.size,
            Properties: D3D12_HEAP_PROPERTIES {
                Type: heap_type(desc.usage),
                ..Default::default()
            },
            Alignment: 0,
            Flags: flags,
        };

        let mut heap: Option<ID3D12Heap> = None;
        unsafe { device.CreateHeap(&heap_desc, &mut heap) }
            .map_err(|e| MemoryError::HeapCreation(format!("{} heap of {} bytes: {}", desc.usage.name(), desc.size, e)))?;
        let heap = heap.ok_or_else(|| MemoryError::HeapCreation("CreateHeap returned nothing".to_string()))?;

        if let Ok(pageable) = heap.cast::<ID3D12Pageable>() {
            let priority = residency_priority(desc.usage.residency_priority());
            let _ = unsafe { device.SetResidencyPriority(1, &Some(pageable), &priority) };
        }

        let mapped = if desc.usage.is_cpu_visible() {
            let initial = if desc.usage == HeapUsage::Upload {
                D3D12_RESOURCE_STATE_GENERIC_READ
            } else {
                D3D12_RESOURCE_STATE_COPY_DEST
            };
            let mut buffer: Option<ID3D12Resource> = None;
            unsafe {
                device.CreatePlacedResource(&heap, 0, &native_desc(&ResourceDesc::buffer(desc.size)), initial, None, &mut buffer)
            }
            .map_err(|e| GpuError::call("CreatePlacedResource", e))?;
            let buffer = buffer.ok_or_else(|| GpuError::call("CreatePlacedResource", "no resource"))?;

            let mut ptr = std::ptr::null_mut();
            unsafe { buffer.Map(0, None, Some(&mut ptr)) }.map_err(|e| GpuError::call("Map", e))?;
            Some((buffer, ptr as *mut u8))
        } else {
            None
        };

        let id = state.objects.next();
        state.objects.heaps.insert(
            id,
            Dx12Heap {
                heap,
                size: desc.size,
                mapped,
            },
        );
        trace!(heap = id, usage = desc.usage.name(), size = desc.size, "Heap created");
        Ok(RawHeap(id))
    }

    fn destroy_heap(&self, heap: RawHeap) {
        if let Some(heap) = self.state().objects.heaps.remove(&heap.0) {
            if let Some((buffer, _)) = &heap.mapped {
                unsafe { buffer.Unmap(0, None) };
            }
        }
    }

    fn write_heap(&self, heap: RawHeap, offset: u64, data: &[u8]) -> Result<()> {
        let state = self.state();
        let heap = state.objects.heap(heap)?;
        let (_, ptr) = heap.mapped.as_ref().ok_or(MemoryError::NotCpuVisible)?;
        if offset + data.len() as u64 > heap.size {
            return Err(MemoryError::OutOfRange { offset, size: data.len() as u64, limit: heap.size }.into());
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len()) };
        Ok(())
    }

    fn read_heap(&self, heap: RawHeap, offset: u64, data: &mut [u8]) -> Result<()> {
        let state = self.state();
        let heap = state.objects.heap(heap)?;
        let (_, ptr) = heap.mapped.as_ref().ok_or(MemoryError::NotCpuVisible)?;
        if offset + data.len() as u64 > heap.size {
            return Err(MemoryError::OutOfRange { offset, size: data.len() as u64, limit: heap.size }.into());
        }
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset as usize), data.as_mut_ptr(), data.len()) };
        Ok(())
    }

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let state = self.state();
        let info = unsafe { state.context.device.GetResourceAllocationInfo(0, &[native_desc(desc)]) };
        AllocationInfo {
            size: info.SizeInBytes,
            alignment: info.Alignment,
        }
    }

    fn create_placed_resource(
        &self,
        heap: RawHeap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<RawResource> {
        let mut state = self.state();
        let native_heap = state.objects.heap(heap)?.heap.clone();
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            state.context.device.CreatePlacedResource(
                &native_heap,
                offset,
                &native_desc(desc),
                native_states(initial_state),
                None,
                &mut resource,
            )
        }
        .map_err(|e| DeviceError::ResourceCreation(format!("placed at {}: {}", offset, e)))?;
        let resource = resource.ok_or_else(|| DeviceError::ResourceCreation("no resource".to_string()))?;

        let id = state.objects.next();
        state.objects.resources.insert(id, resource);
        Ok(RawResource(id))
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        create_not_resident: bool,
    ) -> Result<RawResource> {
        let mut state = self.state();
        let props = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let flags = if create_not_resident && state.context.supports_not_resident {
            D3D12_HEAP_FLAG_CREATE_NOT_RESIDENT
        } else {
            D3D12_HEAP_FLAG_NONE
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            state.context.device.CreateCommittedResource(
                &props,
                flags,
                &native_desc(desc),
                native_states(initial_state),
                None,
                &mut resource,
            )
        }
        .map_err(|e| DeviceError::ResourceCreation(format!("committed: {}", e)))?;
        let resource = resource.ok_or_else(|| DeviceError::ResourceCreation("no resource".to_string()))?;

        let id = state.objects.next();
        state.objects.resources.insert(id, resource);
        Ok(RawResource(id))
    }

    fn destroy_resource(&self, resource: RawResource) {
        self.state().objects.resources.remove(&resource.0);
    }

    fn supports_create_not_resident(&self) -> bool {
        self.state().context.supports_not_resident
    }

    fn video_memory_info(&self) -> VideoMemoryInfo {
        let state = self.state();
        match unsafe { state.context.adapter.QueryVideoMemoryInfo(0, DXGI_MEMORY_SEGMENT_GROUP_LOCAL) } {
            Ok(info) => VideoMemoryInfo {
                budget: info.Budget,
                current_usage: info.CurrentUsage,
            },
            Err(e) => {
                error!(error = %e, "QueryVideoMemoryInfo failed");
                VideoMemoryInfo::default()
            }
        }
    }

    fn enqueue_make_resident(&self, objects: &[Pageable], fence: RawFence, value: u64) -> Result<()> {
        let state = self.state();
        let pageables = state.objects.pageables(objects)?;
        let fence = state.objects.fence(fence)?;
        unsafe {
            state.context.device.EnqueueMakeResident(
                D3D12_RESIDENCY_FLAG_NONE,
                pageables.len() as u32,
                pageables.as_ptr(),
                fence,
                value,
            )
        }
        .map_err(|e| GpuError::call("EnqueueMakeResident", e))
    }

    fn evict(&self, objects: &[Pageable]) -> Result<()> {
        let state = self.state();
        let pageables = state.objects.pageables(objects)?;
        unsafe { state.context.device.Evict(pageables.len() as u32, pageables.as_ptr()) }
            .map_err(|e| GpuError::call("Evict", e))
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<RawCommandAllocator> {
        let mut state = self.state();
        let allocator: ID3D12CommandAllocator = unsafe { state.context.device.CreateCommandAllocator(list_type(kind)) }
            .map_err(|e| GpuError::call("CreateCommandAllocator", e))?;
        let id = state.objects.next();
        state.objects.allocators.insert(id, allocator);
        Ok(RawCommandAllocator(id))
    }

    fn reset_command_allocator(&self, allocator: RawCommandAllocator) -> Result<()> {
        let native = self
            .state()
            .objects
            .allocators
            .get(&allocator.0)
            .cloned()
            .ok_or_else(|| GpuError::call("allocator", format!("unknown allocator #{}", allocator.0)))?;
        unsafe { native.Reset() }.map_err(|e| GpuError::call("ID3D12CommandAllocator::Reset", e))
    }

    fn destroy_command_allocator(&self, allocator: RawCommandAllocator) {
        self.state().objects.allocators.remove(&allocator.0);
    }

    fn create_command_list(&self, kind: QueueKind, allocator: RawCommandAllocator) -> Result<RawCommandList> {
        let mut state = self.state();
        let native_allocator = state
            .objects
            .allocators
            .get(&allocator.0)
            .cloned()
            .ok_or_else(|| GpuError::call("allocator", format!("unknown allocator #{}", allocator.0)))?;
        let list: ID3D12GraphicsCommandList =
            unsafe { state.context.device.CreateCommandList(0, list_type(kind), &native_allocator, None) }
                .map_err(|e| GpuError::call("CreateCommandList", e))?;
        let id = state.objects.next();
        state.objects.lists.insert(id, list);
        Ok(RawCommandList(id))
    }

    fn reset_command_list(&self, list: RawCommandList, allocator: RawCommandAllocator) -> Result<()> {
        let state = self.state();
        let native = state
            .objects
            .lists
            .get(&list.0)
            .ok_or_else(|| GpuError::call("list", format!("unknown list #{}", list.0)))?;
        let native_allocator = state
            .objects
            .allocators
            .get(&allocator.0)
            .ok_or_else(|| GpuError::call("allocator", format!("unknown allocator #{}", allocator.0)))?;
        unsafe { native.Reset(native_allocator, None) }.map_err(|e| GpuError::call("ID3D12GraphicsCommandList::Reset", e))
    }

    fn close_command_list(&self, list: RawCommandList) -> Result<()> {
        let state = self.state();
        let native = state
            .objects
            .lists
            .get(&list.0)
            .ok_or_else(|| GpuError::call("list", format!("unknown list #{}", list.0)))?;
        unsafe { native.Close() }.map_err(|e| GpuError::call("ID3D12GraphicsCommandList::Close", e))
    }

    fn destroy_command_list(&self, list: RawCommandList) {
        self.state().objects.lists.remove(&list.0);
    }

    fn record(&self, list: RawCommandList, command: &GpuCommand) -> Result<()> {
        let state = self.state();
        let objects = &state.objects;
        let native = objects
            .lists
            .get(&list.0)
            .ok_or_else(|| GpuError::call("list", format!("unknown list #{}", list.0)))?;

        match command {
            GpuCommand::Barriers(barriers) => {
                let mut natives = Vec::with_capacity(barriers.len());
                for barrier in barriers {
                    let native_barrier = match *barrier {
                        ResourceBarrier::Transition { resource, subresource, before, after } => {
                            transition_barrier(objects.resource(resource)?, subresource, before, after)
                        }
                        ResourceBarrier::Uav { resource } => D3D12_RESOURCE_BARRIER {
                            Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
                            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                                UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                                    pResource: ManuallyDrop::new(match resource {
                                        Some(r) => Some(objects.resource(r)?.clone()),
                                        None => None,
                                    }),
                                }),
                            },
                        },
                        ResourceBarrier::Aliasing { before, after } => {
                            let before = match before {
                                Some(r) => Some(objects.resource(r)?.clone()),
                                None => None,
                            };
                            let after = match after {
                                Some(r) => Some(objects.resource(r)?.clone()),
                                None => None,
                            };
                            D3D12_RESOURCE_BARRIER {
                                Type: D3D12_RESOURCE_BARRIER_TYPE_ALIASING,
                                Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                                    Aliasing: ManuallyDrop::new(D3D12_RESOURCE_ALIASING_BARRIER {
                                        pResourceBefore: ManuallyDrop::new(before),
                                        pResourceAfter: ManuallyDrop::new(after),
                                    }),
                                },
                            }
                        }
                    };
                    natives.push(native_barrier);
                }

                if !natives.is_empty() {
                    unsafe { native.ResourceBarrier(&natives) };
                }
                natives.into_iter().for_each(release_barrier);
            }
            GpuCommand::CopyBuffer { dst, src, size } => {
                let (dst, dst_offset) = objects.buffer_location(dst)?;
                let (src, src_offset) = objects.buffer_location(src)?;
                unsafe { native.CopyBufferRegion(&dst, dst_offset, &src, src_offset, *size) };
            }
            GpuCommand::CopyTexture { dst, src } => {
                let dst = objects.texture_location(dst)?;
                let src = objects.texture_location(src)?;
                unsafe { native.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
                drop(ManuallyDrop::into_inner(dst.pResource));
                drop(ManuallyDrop::into_inner(src.pResource));
            }
            GpuCommand::BeginEvent(name) => {
                // PIX 事件元数据 1 表示 ANSI 字符串
                let bytes = std::ffi::CString::new(name.as_str()).unwrap_or_default();
                let data = bytes.as_bytes_with_nul();
                unsafe { native.BeginEvent(1, Some(data.as_ptr() as *const _), data.len() as u32) };
            }
            GpuCommand::EndEvent => unsafe { native.EndEvent() },
        }
        Ok(())
    }

    fn device_removed_reason(&self) -> Option<String> {
        let state = self.state();
        match unsafe { state.context.device.GetDeviceRemovedReason() } {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    fn recreate(&self) -> Result<()> {
        info!("Recreating DirectX 12 device");
        let context = Dx12Context::new(self.debug_layer)?;
        let mut state = self.state();
        for heap in state.objects.heaps.values() {
            if let Some((buffer, _)) = &heap.mapped {
                unsafe { buffer.Unmap(0, None) };
            }
        }
        let next_id = state.objects.next_id;
        state.objects = Dx12Objects {
            next_id,
            ..Default::default()
        };
        state.context = context;
        Ok(())
    }
}
