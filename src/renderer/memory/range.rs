//! 堆内的内存块与分配记录
//!
//! `MemBuffer` 是分配器的一个后备堆，带一种分配策略：
//!
//! - 环形：按分配顺序回收，记录带栅栏值，栅栏完成且没有存活的 `MemRange` 时回收。
//!   相邻且栅栏值相同的分配合并成一条记录，限制记录数量。只有最旧的记录之前有足够空间时才回绕到 0，
//!   已经回绕过的环只在最新与最旧记录之间分配
//! - 空闲链表：按起点排序的空闲区间，首次适配，释放时与左右邻居合并
//!
//! `MemRange` 是调用方看到的对齐后子区间，析构时归还给所属的块。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::{MemoryError, Result};
use crate::gfx::backend::{align_up, BufferLocation, HeapUsage};
use crate::renderer::memory::heap::Heap;
use crate::renderer::residency::ResidencyKey;
use crate::renderer::sync::FenceValue;

struct RingRecord {
    id: u64,
    start: u64,
    size: u64,
    fence: FenceValue,
    live: usize,
}

impl RingRecord {
    fn after_end(&self) -> u64 {
        self.start + self.size
    }

    fn reclaimable(&self) -> bool {
        self.live == 0 && self.fence.complete()
    }
}

#[derive(Default)]
struct RingState {
    records: VecDeque<RingRecord>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeRange {
    pub start: u64,
    pub size: u64,
}

impl FreeRange {
    fn after_end(&self) -> u64 {
        self.start + self.size
    }
}

enum Strategy {
    Ring(Mutex<RingState>),
    FreeList(Mutex<Vec<FreeRange>>),
}

/// 分配器的一个后备堆
pub(crate) struct MemBuffer {
    heap: Heap,
    strategy: Strategy,
    live_ranges: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemBuffer {
    pub fn ring(heap: Heap) -> Self {
        Self {
            heap,
            strategy: Strategy::Ring(Mutex::new(RingState::default())),
            live_ranges: AtomicUsize::new(0),
        }
    }

    pub fn free_list(heap: Heap) -> Self {
        let size = heap.size();
        Self {
            heap,
            strategy: Strategy::FreeList(Mutex::new(vec![FreeRange { start: 0, size }])),
            live_ranges: AtomicUsize::new(0),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn live_ranges(&self) -> usize {
        self.live_ranges.load(Ordering::Acquire)
    }

    /// 分配失败返回 `None`，调用方需要换一个更大的块
    pub fn alloc_bytes(self: &Arc<Self>, size: u64, align: u64, fence: &FenceValue) -> Option<MemRange> {
        if size == 0 || size > self.heap.size() {
            return None;
        }

        let align = align.max(1);
        let (start, allocated_start, allocated_size, record) = match &self.strategy {
            Strategy::Ring(state) => self.ring_alloc(&mut lock(state), size, align, fence)?,
            Strategy::FreeList(ranges) => {
                let (start, allocated_start, allocated_size) = Self::free_list_alloc(&mut lock(ranges), size, align)?;
                (start, allocated_start, allocated_size, 0)
            }
        };

        self.live_ranges.fetch_add(1, Ordering::AcqRel);
        Some(MemRange {
            buffer: self.clone(),
            start,
            size,
            allocated_start,
            allocated_size,
            record,
            active_resource: Mutex::new(None),
        })
    }

    fn ring_alloc(
        &self,
        state: &mut RingState,
        size: u64,
        align: u64,
        fence: &FenceValue,
    ) -> Option<(u64, u64, u64, u64)> {
        let heap_size = self.heap.size();
        while state.records.front().is_some_and(RingRecord::reclaimable) {
            state.records.pop_front();
        }

        // 在用的区间：未回绕时是 [front, back)，回绕后是 [front, 堆尾) 加上 [0, back)
        let (allocated_start, aligned_start) = match (state.records.front(), state.records.back()) {
            (Some(front), Some(back)) => {
                let tail = back.after_end();
                let aligned = align_up(tail, align);
                let wrapped = back.start < front.start;

                if wrapped {
                    if aligned + size > front.start {
                        return None;
                    }
                    (tail, aligned)
                } else if aligned + size <= heap_size {
                    (tail, aligned)
                } else if size <= front.start {
                    (0, 0)
                } else {
                    return None;
                }
            }
            _ => (0, 0),
        };

        let end = aligned_start + size;
        let allocated_size = end - allocated_start;
        let merge = state
            .records
            .back()
            .is_some_and(|back| allocated_start != 0 && back.after_end() == allocated_start && back.fence == *fence);

        let record = match state.records.back_mut() {
            Some(back) if merge => {
                back.size += allocated_size;
                back.live += 1;
                back.id
            }
            _ => {
                let id = state.next_id;
                state.next_id += 1;
                state.records.push_back(RingRecord {
                    id,
                    start: allocated_start,
                    size: allocated_size,
                    fence: fence.clone(),
                    live: 1,
                });
                id
            }
        };

        Some((aligned_start, allocated_start, allocated_size, record))
    }

    fn free_list_alloc(ranges: &mut Vec<FreeRange>, size: u64, align: u64) -> Option<(u64, u64, u64)> {
        let index = ranges
            .iter()
            .position(|r| r.size >= size && r.after_end() >= align_up(r.start, align) + size)?;

        let range = &mut ranges[index];
        let allocated_start = range.start;
        let aligned_start = align_up(range.start, align);
        let allocated_size = aligned_start + size - allocated_start;

        range.start += allocated_size;
        range.size -= allocated_size;
        if range.size == 0 {
            ranges.remove(index);
        }

        Some((aligned_start, allocated_start, allocated_size))
    }

    fn free(&self, range: &MemRange) {
        match &self.strategy {
            Strategy::Ring(state) => {
                let mut state = lock(state);
                if let Some(record) = state.records.iter_mut().find(|r| r.id == range.record) {
                    record.live = record.live.saturating_sub(1);
                }
            }
            Strategy::FreeList(ranges) => {
                Self::free_list_insert(
                    &mut lock(ranges),
                    FreeRange { start: range.allocated_start, size: range.allocated_size },
                );
            }
        }

        let old = self.live_ranges.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    fn free_list_insert(ranges: &mut Vec<FreeRange>, freed: FreeRange) {
        let index = ranges.partition_point(|r| r.start < freed.start);
        debug_assert!(index == ranges.len() || freed.after_end() <= ranges[index].start);

        if index > 0 && ranges[index - 1].after_end() == freed.start {
            ranges[index - 1].size += freed.size;
            if index < ranges.len() && ranges[index].start == ranges[index - 1].after_end() {
                ranges[index - 1].size += ranges[index].size;
                ranges.remove(index);
            }
            return;
        }

        if index < ranges.len() && ranges[index].start == freed.after_end() {
            ranges[index].start = freed.start;
            ranges[index].size += freed.size;
            return;
        }

        ranges.insert(index, freed);
    }

    /// 回收已完成的环形记录，返回块内是否还有在用的内存
    pub fn frame_complete(&self) -> bool {
        match &self.strategy {
            Strategy::Ring(state) => {
                let mut state = lock(state);
                while state.records.front().is_some_and(RingRecord::reclaimable) {
                    state.records.pop_front();
                }
                !state.records.is_empty()
            }
            Strategy::FreeList(ranges) => {
                let ranges = lock(ranges);
                ranges.len() != 1 || ranges[0].size != self.heap.size()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn free_ranges(&self) -> Vec<FreeRange> {
        match &self.strategy {
            Strategy::FreeList(ranges) => lock(ranges).clone(),
            Strategy::Ring(_) => Vec::new(),
        }
    }
}

/// 堆内的一段内存，析构时归还
pub struct MemRange {
    buffer: Arc<MemBuffer>,
    start: u64,
    size: u64,
    allocated_start: u64,
    allocated_size: u64,
    record: u64,
    active_resource: Mutex<Option<u64>>,
}

impl std::fmt::Debug for MemRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRange")
            .field("usage", &self.buffer.heap.usage())
            .field("start", &self.start)
            .field("size", &self.size)
            .finish()
    }
}

impl MemRange {
    /// 在堆内的起点（已对齐）
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn allocated_start(&self) -> u64 {
        self.allocated_start
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn heap(&self) -> &Heap {
        &self.buffer.heap
    }

    pub fn usage(&self) -> HeapUsage {
        self.buffer.heap.usage()
    }

    pub fn heap_offset(&self) -> u64 {
        self.start
    }

    pub fn residency_key(&self) -> Option<ResidencyKey> {
        self.buffer.heap.residency_key()
    }

    pub fn location(&self, offset: u64) -> Option<BufferLocation> {
        let heap = self.buffer.heap.raw()?;
        Some(BufferLocation::Heap { heap, offset: self.start + offset })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.size {
            return Err(MemoryError::OutOfRange { offset, size: len as u64, limit: self.size }.into());
        }

        Ok(())
    }

    pub fn cpu_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        self.buffer.heap.write(self.start + offset, data)
    }

    pub fn cpu_read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        self.buffer.heap.read(self.start + offset, data)
    }

    /// 当前放置在这段内存上的资源
    pub fn active_resource(&self) -> Option<u64> {
        *self.active_resource.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 设置新的占用者，返回之前的占用者（需要别名屏障）
    pub(crate) fn set_active_resource(&self, resource: Option<u64>) -> Option<u64> {
        let mut active = self.active_resource.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, resource)
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &Arc<MemBuffer> {
        &self.buffer
    }
}

impl Drop for MemRange {
    fn drop(&mut self) {
        debug_assert!(
            self.active_resource().is_none(),
            "memory range freed while a resource is still placed on it"
        );
        self.buffer.free(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::{SoftBackend, SoftConfig};
    use crate::renderer::device::Device;
    use crate::renderer::sync::Fence;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn device() -> Arc<Device> {
        Device::new(Config::default(), Arc::new(SoftBackend::new(SoftConfig::default())))
    }

    #[test]
    fn test_ring_merge_and_wrap() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = Arc::new(MemBuffer::ring(Heap::new(&device, 4096, HeapUsage::Upload).unwrap()));

        let first = fence.signal_later();
        let a = buffer.alloc_bytes(1000, 256, &first).unwrap();
        let b = buffer.alloc_bytes(100, 256, &first).unwrap();
        assert_eq!((a.start(), b.start()), (0, 1024));
        assert_eq!(b.allocated_start(), 1000);

        // 同一栅栏值的相邻分配合并成一条记录
        let second = fence.signal_later();
        let c = buffer.alloc_bytes(2048, 256, &second).unwrap();
        assert_eq!(c.start(), 1280);
        drop((a, b, c));

        // 回绕时最旧的记录还没完成
        assert!(buffer.alloc_bytes(1024, 256, &fence.next_value()).is_none());

        first.signal(None);
        let d = buffer.alloc_bytes(1024, 256, &fence.next_value()).unwrap();
        assert_eq!(d.start(), 0);
        assert!(buffer.frame_complete());
    }

    #[test]
    fn test_ring_live_range_blocks_reuse() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = Arc::new(MemBuffer::ring(Heap::new(&device, 1024, HeapUsage::Readback).unwrap()));

        let held = buffer.alloc_bytes(1024, 256, &fence.signal(None)).unwrap();
        assert!(buffer.alloc_bytes(256, 256, &fence.next_value()).is_none());

        drop(held);
        assert!(!buffer.frame_complete());
        assert!(buffer.alloc_bytes(256, 256, &fence.next_value()).is_some());
    }

    fn ring(device: &Arc<Device>, size: u64) -> Arc<MemBuffer> {
        Arc::new(MemBuffer::ring(Heap::new(device, size, HeapUsage::Upload).unwrap()))
    }

    fn disjoint(a: &MemRange, b: &MemRange) -> bool {
        a.start() + a.size() <= b.start() || b.start() + b.size() <= a.start()
    }

    #[test]
    fn test_ring_wrap_reclaims_front() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = ring(&device, 65536);

        let v1 = fence.signal_later();
        let a = buffer.alloc_bytes(60000, 1, &v1).unwrap();
        let b = buffer.alloc_bytes(4000, 1, &fence.signal_later()).unwrap();
        assert_eq!(b.start(), 60000);

        drop(a);
        v1.signal(None);
        let c = buffer.alloc_bytes(10000, 1, &fence.signal_later()).unwrap();
        assert_eq!(c.start(), 0);
        assert!(disjoint(&b, &c));
    }

    #[test]
    fn test_ring_wrap_blocked_by_live_front() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = ring(&device, 65536);

        let v1 = fence.signal_later();
        let a = buffer.alloc_bytes(60000, 1, &v1).unwrap();
        let _b = buffer.alloc_bytes(4000, 1, &fence.signal_later()).unwrap();

        // 栅栏完成但范围仍然存活
        v1.signal(None);
        assert!(buffer.alloc_bytes(10000, 1, &fence.signal_later()).is_none());

        drop(a);
        assert_eq!(buffer.alloc_bytes(10000, 1, &fence.signal_later()).unwrap().start(), 0);
    }

    #[test]
    fn test_ring_second_wrap_stays_behind_oldest() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = ring(&device, 65536);

        let v1 = fence.signal_later();
        let a = buffer.alloc_bytes(60000, 1, &v1).unwrap();
        let b = buffer.alloc_bytes(4000, 1, &fence.signal_later()).unwrap();
        drop(a);
        v1.signal(None);

        let c = buffer.alloc_bytes(10000, 1, &fence.signal_later()).unwrap();
        assert_eq!(c.start(), 0);

        // 已经回绕，只能用 c 与 b 之间的空间
        assert!(buffer.alloc_bytes(56000, 1, &fence.signal_later()).is_none());

        let d = buffer.alloc_bytes(50000, 1, &fence.signal_later()).unwrap();
        assert_eq!(d.start(), 10000);
        assert!(disjoint(&d, &b) && disjoint(&d, &c));
        assert!(buffer.alloc_bytes(1, 1, &fence.signal_later()).is_none());
    }

    #[test]
    fn test_ring_no_merge_across_wrap() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = ring(&device, 65536);

        let v1 = fence.signal_later();
        let v2 = fence.signal_later();
        let a = buffer.alloc_bytes(60000, 1, &v1).unwrap();
        let b = buffer.alloc_bytes(4000, 1, &v2).unwrap();
        drop(a);
        v1.signal(None);

        // 与 b 同一个栅栏值，但回绕到 0 后是一条新记录
        let c = buffer.alloc_bytes(10000, 1, &v2).unwrap();
        assert_eq!(c.start(), 0);

        drop(b);
        v2.signal(None);
        assert!(buffer.frame_complete());

        // b 的记录单独回收，c 仍然存活
        let d = buffer.alloc_bytes(50000, 1, &fence.signal_later()).unwrap();
        assert_eq!(d.start(), 10000);
        assert!(disjoint(&c, &d));
    }

    #[test]
    fn test_ring_never_overlaps_live_ranges() {
        let device = device();
        let fence = Fence::new(&device, "ring", None).unwrap();
        let buffer = Arc::new(MemBuffer::ring(Heap::new(&device, 64 * 1024, HeapUsage::Upload).unwrap()));
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<(MemRange, FenceValue)> = Vec::new();
        let mut current = fence.signal_later();

        for _ in 0..2000 {
            if rng.random_bool(0.2) {
                current = fence.signal_later();
            }
            if rng.random_bool(0.1) {
                fence.value(fence.next_value().value() - 1).signal(None);
            }

            live.retain(|(_, value)| !value.complete() || rng.random_bool(0.5));

            let size = rng.random_range(1..4096u64);
            let align = 1u64 << rng.random_range(0..10u32);
            if let Some(range) = buffer.alloc_bytes(size, align, &current) {
                assert_eq!(range.start() % align, 0);
                for (other, _) in &live {
                    let disjoint = range.start() + range.size() <= other.start()
                        || other.start() + other.size() <= range.start();
                    assert!(disjoint, "{:?} overlaps {:?}", range, other);
                }
                live.push((range, current.clone()));
            }
        }
    }

    #[test]
    fn test_free_list_round_trip() {
        let device = device();
        let buffer = Arc::new(MemBuffer::free_list(Heap::new(&device, 1 << 20, HeapUsage::GpuBuffers).unwrap()));
        let whole = vec![FreeRange { start: 0, size: 1 << 20 }];
        let mut rng = StdRng::seed_from_u64(11);

        for round in 0..20 {
            let mut ranges = Vec::new();
            for _ in 0..rng.random_range(1..24) {
                let size = rng.random_range(1..32 * 1024u64);
                let align = 1u64 << rng.random_range(0..17u32);
                if let Some(range) = buffer.alloc_bytes(size, align, &FenceValue::default()) {
                    ranges.push(range);
                }
            }

            if round % 2 == 1 {
                ranges.reverse();
            } else if round % 4 == 2 {
                while !ranges.is_empty() {
                    let i = rng.random_range(0..ranges.len());
                    ranges.swap_remove(i);
                }
            }
            drop(ranges);

            assert_eq!(buffer.free_ranges(), whole);
            assert!(!buffer.frame_complete());
            assert_eq!(buffer.live_ranges(), 0);
        }
    }

    #[test]
    fn test_free_list_coalesce() {
        let device = device();
        let buffer = Arc::new(MemBuffer::free_list(Heap::new(&device, 4096, HeapUsage::GpuBuffers).unwrap()));
        let none = FenceValue::default();

        let a = buffer.alloc_bytes(1024, 1, &none).unwrap();
        let b = buffer.alloc_bytes(1024, 1, &none).unwrap();
        let c = buffer.alloc_bytes(1024, 1, &none).unwrap();
        assert_eq!(c.start(), 2048);

        drop(b);
        assert_eq!(buffer.free_ranges(), vec![
            FreeRange { start: 1024, size: 1024 },
            FreeRange { start: 3072, size: 1024 },
        ]);

        drop(c);
        assert_eq!(buffer.free_ranges(), vec![FreeRange { start: 1024, size: 3072 }]);

        drop(a);
        assert_eq!(buffer.free_ranges(), vec![FreeRange { start: 0, size: 4096 }]);
    }

    #[test]
    fn test_cpu_access_bounds() {
        let device = device();
        let buffer = Arc::new(MemBuffer::ring(Heap::new(&device, 4096, HeapUsage::Upload).unwrap()));
        let range = buffer.alloc_bytes(16, 256, &FenceValue::default()).unwrap();

        range.cpu_write(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        range.cpu_read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(range.cpu_write(14, &[0; 4]).is_err());
    }
}
