//! 分配器
//!
//! `MemAllocatorBase` 管理一串后备块：只从最后一个块分配，失败时新建一个更大的块
//! （大小翻倍，空闲链表分配器有上限，环形分配器没有）。每帧结束时删除已经空闲的块，至少保留一个。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::heap::Heap;
use super::range::{MemBuffer, MemRange};
use crate::core::error::{MemoryError, Result};
use crate::gfx::backend::{HeapUsage, DEFAULT_PLACEMENT_ALIGNMENT, TEXTURE_PLACEMENT_ALIGNMENT};
use crate::renderer::device::Device;
use crate::renderer::sync::FenceValue;

/// 常量缓冲区在 CPU 堆中的对齐
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Ring,
    FreeList,
}

pub struct MemAllocatorBase {
    device: Arc<Device>,
    usage: HeapUsage,
    strategy: Strategy,
    initial_size: u64,
    /// 0 表示不设上限
    max_size: u64,
    buffers: Mutex<Vec<Arc<MemBuffer>>>,
}

impl MemAllocatorBase {
    fn new(device: &Arc<Device>, initial_size: u64, max_size: u64, usage: HeapUsage, strategy: Strategy) -> Self {
        let initial_size = initial_size.next_power_of_two().max(1024);
        let max_size = if max_size == 0 { 0 } else { max_size.next_power_of_two().max(initial_size) };

        Self {
            device: device.clone(),
            usage,
            strategy,
            initial_size,
            max_size,
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Vec<Arc<MemBuffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn usage(&self) -> HeapUsage {
        self.usage
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers().len()
    }

    pub fn alloc_bytes(&self, size: u64, align: u64, fence: &FenceValue) -> Result<MemRange> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { size, limit: self.max_size }.into());
        }

        let mut buffers = self.buffers();
        if let Some(range) = buffers.last().and_then(|b| b.alloc_bytes(size, align, fence)) {
            return Ok(range);
        }

        let mut heap_size = size.next_power_of_two().max(self.initial_size);
        if let Some(last) = buffers.last() {
            let grown = last.heap().size() * 2;
            let grown = if self.max_size == 0 { grown } else { grown.min(self.max_size) };
            heap_size = heap_size.max(grown);
        }

        let heap = Heap::new(&self.device, heap_size, self.usage)?;
        let buffer = Arc::new(match self.strategy {
            Strategy::Ring => MemBuffer::ring(heap),
            Strategy::FreeList => MemBuffer::free_list(heap),
        });
        debug!(
            usage = self.usage.name(),
            heap_size,
            buffers = buffers.len() + 1,
            "Allocator grew a new heap"
        );

        let range = buffer.alloc_bytes(size, align, fence);
        buffers.push(buffer);
        range.ok_or_else(|| MemoryError::Exhausted { size, align }.into())
    }

    /// 删除空闲的块，至少保留一个
    pub fn frame_complete(&self) {
        let mut buffers = self.buffers();
        let mut i = 0;
        while i < buffers.len() {
            if !buffers[i].frame_complete() && buffers.len() > 1 {
                buffers.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

/// 环形分配器：上传、读回与每帧的动态数据
pub struct MemAllocatorRing {
    base: MemAllocatorBase,
}

impl MemAllocatorRing {
    pub fn new(device: &Arc<Device>, initial_size: u64, usage: HeapUsage) -> Self {
        Self { base: MemAllocatorBase::new(device, initial_size, 0, usage, Strategy::Ring) }
    }

    pub fn base(&self) -> &MemAllocatorBase {
        &self.base
    }

    pub fn usage(&self) -> HeapUsage {
        self.base.usage
    }

    pub fn alloc_bytes(&self, size: u64, align: u64, fence: &FenceValue) -> Result<MemRange> {
        self.base.alloc_bytes(size, align, fence)
    }

    pub fn alloc_buffer(&self, size: u64, fence: &FenceValue) -> Result<MemRange> {
        let align = if self.usage().is_cpu_visible() { CONSTANT_BUFFER_ALIGNMENT } else { DEFAULT_PLACEMENT_ALIGNMENT };
        self.base.alloc_bytes(size, align, fence)
    }

    pub fn alloc_texture(&self, size: u64, fence: &FenceValue) -> Result<MemRange> {
        let align = if self.usage().is_cpu_visible() { TEXTURE_PLACEMENT_ALIGNMENT } else { DEFAULT_PLACEMENT_ALIGNMENT };
        self.base.alloc_bytes(size, align, fence)
    }

    pub fn frame_complete(&self) {
        self.base.frame_complete();
    }
}

/// 空闲链表分配器：长期存在的缓冲区、纹理与渲染目标
pub struct MemAllocatorFreeList {
    base: MemAllocatorBase,
}

impl MemAllocatorFreeList {
    pub fn new(device: &Arc<Device>, initial_size: u64, max_size: u64, usage: HeapUsage) -> Self {
        Self { base: MemAllocatorBase::new(device, initial_size, max_size, usage, Strategy::FreeList) }
    }

    pub fn base(&self) -> &MemAllocatorBase {
        &self.base
    }

    pub fn usage(&self) -> HeapUsage {
        self.base.usage
    }

    /// `align` 为 0 时使用默认的 64 KiB 放置对齐
    pub fn alloc_bytes(&self, size: u64, align: u64) -> Result<MemRange> {
        let align = if align == 0 { DEFAULT_PLACEMENT_ALIGNMENT } else { align };
        self.base.alloc_bytes(size, align, &FenceValue::default())
    }

    pub fn frame_complete(&self) {
        self.base.frame_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::{SoftBackend, SoftConfig};
    use crate::renderer::sync::Fence;

    const ONE_MEG: u64 = 1024 * 1024;

    fn device() -> Arc<Device> {
        Device::new(Config::default(), Arc::new(SoftBackend::new(SoftConfig::default())))
    }

    #[test]
    fn test_ring_alloc() {
        let device = device();
        let allocator = MemAllocatorRing::new(&device, ONE_MEG, HeapUsage::Upload);
        let fence = Fence::new(&device, "ring", None).unwrap();

        let mut range = allocator.alloc_buffer(1024, &fence.next_value()).unwrap();
        assert_eq!(range.size(), 1024);

        range = allocator.alloc_texture(64, &fence.next_value()).unwrap();
        assert_eq!(range.start() % TEXTURE_PLACEMENT_ALIGNMENT, 0);

        range = allocator.alloc_buffer(128, &fence.next_value()).unwrap();
        assert_eq!(range.start() % CONSTANT_BUFFER_ALIGNMENT, 0);

        // 回绕时旧记录未完成，分配器新建一个翻倍的堆
        range = allocator.alloc_buffer(ONE_MEG, &fence.next_value()).unwrap();
        assert_eq!(range.size(), ONE_MEG);
        assert_eq!(range.heap().size(), 2 * ONE_MEG);
        assert_eq!(allocator.base().buffer_count(), 2);

        fence.signal(None);
        allocator.frame_complete();
        assert_eq!(allocator.base().buffer_count(), 1);

        let next = allocator.alloc_buffer(ONE_MEG, &fence.next_value()).unwrap();
        assert_eq!(next.start(), ONE_MEG);
        drop(range);
    }

    #[test]
    fn test_free_list_alloc() {
        let device = device();
        let allocator = MemAllocatorFreeList::new(&device, ONE_MEG, ONE_MEG, HeapUsage::GpuTextures);

        let mut range = allocator.alloc_bytes(1024, 0).unwrap();
        assert_eq!((range.start(), range.allocated_start(), range.allocated_size()), (0, 0, 1024));

        range = allocator.alloc_bytes(64, 0).unwrap();
        assert_eq!(range.size(), 64);
        assert_eq!(range.allocated_size(), 64576);
        assert_eq!(range.start(), 65536);
        assert_eq!(range.allocated_start(), 1024);

        range = allocator.alloc_bytes(128, 0).unwrap();
        assert_eq!((range.start(), range.allocated_start(), range.allocated_size()), (0, 0, 128));

        // 上限 1 MiB，新堆不再翻倍
        range = allocator.alloc_bytes(ONE_MEG, 0).unwrap();
        assert_eq!((range.start(), range.allocated_size()), (0, ONE_MEG));
        assert_eq!(range.heap().size(), ONE_MEG);

        allocator.frame_complete();
        assert_eq!(allocator.base().buffer_count(), 1);

        range = allocator.alloc_bytes(ONE_MEG, 0).unwrap();
        assert_eq!((range.start(), range.allocated_size()), (0, ONE_MEG));
        assert_eq!(allocator.base().buffer_count(), 2);
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = device();
        let allocator = MemAllocatorFreeList::new(&device, ONE_MEG, 0, HeapUsage::GpuBuffers);
        assert!(allocator.alloc_bytes(0, 0).is_err());
        assert_eq!(allocator.base().buffer_count(), 0);
    }

    #[test]
    fn test_heap_failure_is_fatal() {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());
        let allocator = MemAllocatorRing::new(&device, ONE_MEG, HeapUsage::Upload);

        soft.simulate_device_removed("test");
        assert!(allocator.alloc_buffer(16, &FenceValue::default()).is_err());
        assert!(device.removed_reason().is_some());
    }
}
