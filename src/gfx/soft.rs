//! 软件模拟设备
//!
//! 一个确定性的 `GpuBackend` 实现，供测试和非 Windows 平台使用。
//!
//! # 模型
//!
//! - 每个队列是一条按顺序处理的时间线（signal、wait、execute）
//! - 堆和资源拥有真实的字节存储，拷贝命令会真正搬运数据
//! - 驻留按字节记账，`current_usage` 是所有驻留对象的大小之和
//! - 暂停模式下排队的 GPU 工作不会推进，直到调用 `resume` 或 `pump`
//! - 执行日志记录每个提交的命令列表，便于检查屏障与拷贝
//! - 访问非驻留内存的命令会被计入 `residency_violations`

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace};

use super::backend::*;
use crate::core::error::{DeviceError, GpuError, MemoryError, Result};

/// 软件设备配置
#[derive(Debug, Clone, Copy)]
pub struct SoftConfig {
    /// 显存预算（字节）
    pub budget: u64,
    /// 是否支持以非驻留方式创建
    pub supports_not_resident: bool,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            budget: 256 * 1024 * 1024,
            supports_not_resident: true,
        }
    }
}

/// 一次已提交命令列表的记录
#[derive(Debug, Clone)]
pub struct ExecutedList {
    pub queue: QueueKind,
    pub list: RawCommandList,
    pub commands: Vec<GpuCommand>,
}

impl ExecutedList {
    /// 该列表中所有的屏障
    pub fn barriers(&self) -> Vec<ResourceBarrier> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Barriers(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// 统计计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub make_resident_calls: u64,
    pub made_resident: u64,
    pub evicted: u64,
    pub residency_violations: u64,
    pub executed_lists: u64,
    pub device_recreations: u64,
}

enum QueueOp {
    Signal { fence: u64, value: u64 },
    Wait { fence: u64, value: u64 },
    Execute(Vec<Vec<GpuCommand>>),
}

struct SoftQueue {
    kind: QueueKind,
    ops: VecDeque<QueueOp>,
}

struct SoftHeap {
    desc: HeapDesc,
    bytes: Vec<u8>,
    resident: bool,
}

enum Backing {
    Placed { heap: u64, offset: u64 },
    Committed { bytes: Vec<u8>, resident: bool },
}

struct SoftResource {
    desc: ResourceDesc,
    size: u64,
    backing: Backing,
}

#[derive(Clone, Copy)]
enum Storage {
    Heap(u64),
    Resource(u64),
}

struct SoftList {
    kind: QueueKind,
    open: bool,
    commands: Vec<GpuCommand>,
}

#[derive(Default)]
struct SoftState {
    next_id: u64,
    removed: Option<String>,
    paused: bool,
    budget: u64,
    fences: HashMap<u64, u64>,
    queues: HashMap<u64, SoftQueue>,
    heaps: HashMap<u64, SoftHeap>,
    resources: HashMap<u64, SoftResource>,
    allocators: HashMap<u64, QueueKind>,
    lists: HashMap<u64, SoftList>,
    residency_signals: Vec<(u64, u64)>,
    faults: Vec<&'static str>,
    log: Vec<ExecutedList>,
    stats: SoftStats,
}

/// 软件设备
pub struct SoftBackend {
    config: SoftConfig,
    state: Mutex<SoftState>,
}

fn unknown(call: &'static str, id: u64) -> GpuError {
    GpuError::call(call, format!("unknown handle {}", id))
}

impl SoftBackend {
    pub fn new(config: SoftConfig) -> Self {
        info!(budget = config.budget, "Software device created");

        Self {
            config,
            state: Mutex::new(SoftState {
                next_id: 1,
                budget: config.budget,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 暂停 GPU 时间线
    pub fn pause(&self) {
        self.state().paused = true;
    }

    /// 恢复 GPU 时间线并处理积压的工作
    pub fn resume(&self) {
        let mut state = self.state();
        state.paused = false;
        state.pump();
    }

    /// 即使处于暂停状态也推进一次积压的工作
    pub fn pump(&self) {
        self.state().pump();
    }

    pub fn set_budget(&self, budget: u64) {
        self.state().budget = budget;
    }

    /// 模拟设备移除（驱动崩溃、TDR）
    pub fn simulate_device_removed(&self, reason: &str) {
        info!(reason, "Simulating device removal");
        self.state().removed = Some(reason.to_string());
    }

    /// 下一次名为 `call` 的调用失败（只生效一次）
    pub fn fail_next(&self, call: &'static str) {
        self.state().faults.push(call);
    }

    pub fn executed_lists(&self) -> Vec<ExecutedList> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn stats(&self) -> SoftStats {
        self.state().stats
    }

    pub fn is_resident(&self, pageable: Pageable) -> bool {
        let state = self.state();
        match pageable {
            Pageable::Heap(h) => state.heaps.get(&h.0).is_some_and(|h| h.resident),
            Pageable::Resource(r) => state.resource_resident(r.0),
        }
    }

    /// 资源当前的全部字节（测试检查用）
    pub fn resource_bytes(&self, resource: RawResource) -> Option<Vec<u8>> {
        let state = self.state();
        let res = state.resources.get(&resource.0)?;
        let size = res.desc.footprint_total_size() as usize;
        match &res.backing {
            Backing::Committed { bytes, .. } => Some(bytes[..size].to_vec()),
            Backing::Placed { heap, offset } => {
                let heap = state.heaps.get(heap)?;
                let start = *offset as usize;
                Some(heap.bytes[start..start + size].to_vec())
            }
        }
    }

    /// 存活的原生对象数量：(栅栏, 堆, 资源, 命令列表)
    pub fn live_objects(&self) -> (usize, usize, usize, usize) {
        let state = self.state();
        (state.fences.len(), state.heaps.len(), state.resources.len(), state.lists.len())
    }
}

impl SoftState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_removed(&self, call: &'static str) -> Result<()> {
        match &self.removed {
            Some(reason) => Err(GpuError::Device(DeviceError::Removed(format!("{}: {}", call, reason)))),
            None => Ok(()),
        }
    }

    fn check_fault(&mut self, call: &'static str) -> Result<()> {
        match self.faults.iter().position(|f| *f == call) {
            Some(index) => {
                self.faults.remove(index);
                Err(GpuError::call(call, "injected failure"))
            }
            None => Ok(()),
        }
    }

    fn current_usage(&self) -> u64 {
        let heaps: u64 = self.heaps.values().filter(|h| h.resident).map(|h| h.desc.size).sum();
        let committed: u64 = self
            .resources
            .values()
            .filter(|r| matches!(r.backing, Backing::Committed { resident: true, .. }))
            .map(|r| r.size)
            .sum();
        heaps + committed
    }

    fn resource_resident(&self, id: u64) -> bool {
        match self.resources.get(&id).map(|r| &r.backing) {
            Some(Backing::Placed { heap, .. }) => self.heaps.get(heap).is_some_and(|h| h.resident),
            Some(Backing::Committed { resident, .. }) => *resident,
            None => false,
        }
    }

    fn signal(&mut self, fence: u64, value: u64) {
        if let Some(current) = self.fences.get_mut(&fence) {
            *current = (*current).max(value);
        }
    }

    fn fences_complete(&self, fences: &[(RawFence, u64)]) -> bool {
        fences.iter().all(|(f, v)| self.fences.get(&f.0).map_or(true, |c| *c >= *v))
    }

    /// 推进所有队列，直到没有任何进展
    fn pump(&mut self) {
        for (fence, value) in std::mem::take(&mut self.residency_signals) {
            self.signal(fence, value);
        }

        loop {
            let mut progress = false;
            let ids: Vec<u64> = self.queues.keys().copied().collect();

            for id in ids {
                loop {
                    let Some(queue) = self.queues.get(&id) else { break };
                    let ready = match queue.ops.front() {
                        Some(QueueOp::Wait { fence, value }) => {
                            self.fences.get(fence).map_or(true, |c| *c >= *value)
                        }
                        Some(_) => true,
                        None => false,
                    };

                    if !ready {
                        break;
                    }

                    match self.queues.get_mut(&id).and_then(|q| q.ops.pop_front()) {
                        Some(QueueOp::Signal { fence, value }) => self.signal(fence, value),
                        Some(QueueOp::Wait { .. }) => {}
                        Some(QueueOp::Execute(lists)) => {
                            for commands in lists {
                                for command in &commands {
                                    self.run(command);
                                }
                            }
                        }
                        None => break,
                    }

                    progress = true;
                }
            }

            if !progress {
                break;
            }
        }
    }

    fn run(&mut self, command: &GpuCommand) {
        match command {
            GpuCommand::CopyBuffer { dst, src, size } => {
                if !self.buffer_resident(dst) || !self.buffer_resident(src) {
                    self.stats.residency_violations += 1;
                }

                match self.read_buffer(src, *size) {
                    Some(data) => self.write_buffer(dst, &data),
                    None => debug!("Copy source out of range"),
                }
            }
            GpuCommand::CopyTexture { dst, src } => {
                if !self.texture_resident(dst) || !self.texture_resident(src) {
                    self.stats.residency_violations += 1;
                }

                self.copy_texture(dst, src);
            }
            GpuCommand::Barriers(barriers) => {
                for barrier in barriers {
                    if let ResourceBarrier::Transition { resource, .. } = barrier {
                        if !self.resource_resident(resource.0) {
                            self.stats.residency_violations += 1;
                        }
                    }
                }
            }
            GpuCommand::BeginEvent(_) | GpuCommand::EndEvent => {}
        }
    }

    fn buffer_resident(&self, location: &BufferLocation) -> bool {
        match location {
            BufferLocation::Heap { heap, .. } => self.heaps.get(&heap.0).is_some_and(|h| h.resident),
            BufferLocation::Resource { resource, .. } => self.resource_resident(resource.0),
        }
    }

    fn texture_resident(&self, location: &TextureLocation) -> bool {
        match location {
            TextureLocation::Footprint { heap, .. } => self.heaps.get(&heap.0).is_some_and(|h| h.resident),
            TextureLocation::Subresource { resource, .. } => self.resource_resident(resource.0),
        }
    }

    /// 资源存储的 (字节, 基址)
    fn resource_storage(&mut self, id: u64) -> Option<(&mut Vec<u8>, usize)> {
        let placed = match &self.resources.get(&id)?.backing {
            Backing::Placed { heap, offset } => Some((*heap, *offset as usize)),
            Backing::Committed { .. } => None,
        };

        match placed {
            Some((heap, offset)) => Some((&mut self.heaps.get_mut(&heap)?.bytes, offset)),
            None => match &mut self.resources.get_mut(&id)?.backing {
                Backing::Committed { bytes, .. } => Some((bytes, 0)),
                Backing::Placed { .. } => None,
            },
        }
    }

    fn buffer_storage(&mut self, location: &BufferLocation) -> Option<(&mut Vec<u8>, usize)> {
        match location {
            BufferLocation::Heap { heap, offset } => {
                Some((&mut self.heaps.get_mut(&heap.0)?.bytes, *offset as usize))
            }
            BufferLocation::Resource { resource, offset } => {
                let (bytes, base) = self.resource_storage(resource.0)?;
                Some((bytes, base + *offset as usize))
            }
        }
    }

    fn read_buffer(&mut self, location: &BufferLocation, size: u64) -> Option<Vec<u8>> {
        let (bytes, start) = self.buffer_storage(location)?;
        bytes.get(start..start + size as usize).map(<[u8]>::to_vec)
    }

    fn write_buffer(&mut self, location: &BufferLocation, data: &[u8]) {
        if let Some((bytes, start)) = self.buffer_storage(location) {
            if let Some(dst) = bytes.get_mut(start..start + data.len()) {
                dst.copy_from_slice(data);
            }
        }
    }

    /// 把纹理位置解析为 (存储, 起点, 行间距, 行字节数, 行数)
    fn texture_rows(&self, location: &TextureLocation) -> Option<(Storage, usize, usize, usize, usize)> {
        let (storage, offset, footprint) = match location {
            TextureLocation::Footprint { heap, offset, footprint } => (Storage::Heap(heap.0), *offset, *footprint),
            TextureLocation::Subresource { resource, index } => {
                let (offset, footprint) = self.resources.get(&resource.0)?.desc.footprint(*index as usize);
                (Storage::Resource(resource.0), offset, footprint)
            }
        };

        Some((
            storage,
            offset as usize,
            footprint.row_pitch as usize,
            footprint.row_bytes() as usize,
            footprint.height as usize,
        ))
    }

    fn storage(&mut self, storage: Storage) -> Option<(&mut Vec<u8>, usize)> {
        match storage {
            Storage::Heap(id) => Some((&mut self.heaps.get_mut(&id)?.bytes, 0)),
            Storage::Resource(id) => self.resource_storage(id),
        }
    }

    fn copy_texture(&mut self, dst: &TextureLocation, src: &TextureLocation) {
        let (Some(s), Some(d)) = (self.texture_rows(src), self.texture_rows(dst)) else {
            debug!("Texture copy with unknown location");
            return;
        };

        let (src_storage, src_start, src_pitch, src_row, rows) = s;
        let (dst_storage, dst_start, dst_pitch, dst_row, _) = d;
        let row_bytes = src_row.min(dst_row);

        let mut staging = Vec::with_capacity(row_bytes * rows);
        if let Some((bytes, base)) = self.storage(src_storage) {
            for r in 0..rows {
                let start = base + src_start + r * src_pitch;
                match bytes.get(start..start + row_bytes) {
                    Some(row) => staging.extend_from_slice(row),
                    None => return,
                }
            }
        }

        if let Some((bytes, base)) = self.storage(dst_storage) {
            for (r, row) in staging.chunks(row_bytes.max(1)).enumerate() {
                let start = base + dst_start + r * dst_pitch;
                if let Some(dst) = bytes.get_mut(start..start + row.len()) {
                    dst.copy_from_slice(row);
                }
            }
        }
    }

    fn set_resident(&mut self, pageable: &Pageable, resident: bool) -> Result<()> {
        match pageable {
            Pageable::Heap(h) => {
                let heap = self.heaps.get_mut(&h.0).ok_or_else(|| unknown("MakeResident", h.0))?;
                heap.resident = resident;
            }
            Pageable::Resource(r) => {
                let res = self.resources.get_mut(&r.0).ok_or_else(|| unknown("MakeResident", r.0))?;
                match &mut res.backing {
                    Backing::Committed { resident: flag, .. } => *flag = resident,
                    Backing::Placed { .. } => {
                        return Err(GpuError::call("MakeResident", "placed resources page with their heap"));
                    }
                }
            }
        }

        Ok(())
    }

    fn auto_pump(&mut self) {
        if !self.paused {
            self.pump();
        }
    }
}

impl GpuBackend for SoftBackend {
    fn name(&self) -> &str {
        "Software"
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence> {
        let mut state = self.state();
        state.check_removed("CreateFence")?;
        let id = state.next_id();
        state.fences.insert(id, initial_value);
        Ok(RawFence(id))
    }

    fn destroy_fence(&self, fence: RawFence) {
        self.state().fences.remove(&fence.0);
    }

    fn fence_completed_value(&self, fence: RawFence) -> u64 {
        let state = self.state();
        if state.removed.is_some() {
            return u64::MAX;
        }

        state.fences.get(&fence.0).copied().unwrap_or(u64::MAX)
    }

    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        state.check_removed("Signal")?;
        if !state.fences.contains_key(&fence.0) {
            return Err(unknown("Signal", fence.0));
        }

        state.signal(fence.0, value);
        state.auto_pump();
        Ok(())
    }

    fn wait_fences(&self, fences: &[(RawFence, u64)], timeout: Option<Duration>) -> Result<bool> {
        let mut state = self.state();
        if state.removed.is_some() || state.fences_complete(fences) {
            return Ok(true);
        }

        if !state.paused {
            state.pump();
            if state.fences_complete(fences) {
                return Ok(true);
            }
        }

        match timeout {
            Some(_) => Ok(false),
            None => Err(GpuError::Device(DeviceError::WaitNeverCompletes(format!(
                "{} fence(s) pending on an idle software timeline",
                fences.len()
            )))),
        }
    }

    fn create_queue(&self, kind: QueueKind) -> Result<RawQueue> {
        let mut state = self.state();
        state.check_removed("CreateCommandQueue")?;
        let id = state.next_id();
        state.queues.insert(id, SoftQueue { kind, ops: VecDeque::new() });
        Ok(RawQueue(id))
    }

    fn destroy_queue(&self, queue: RawQueue) {
        self.state().queues.remove(&queue.0);
    }

    fn queue_signal(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        state.check_removed("ID3D12CommandQueue::Signal")?;
        let q = state.queues.get_mut(&queue.0).ok_or_else(|| unknown("Signal", queue.0))?;
        q.ops.push_back(QueueOp::Signal { fence: fence.0, value });
        state.auto_pump();
        Ok(())
    }

    fn queue_wait(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        state.check_removed("ID3D12CommandQueue::Wait")?;
        state.check_fault("ID3D12CommandQueue::Wait")?;
        let q = state.queues.get_mut(&queue.0).ok_or_else(|| unknown("Wait", queue.0))?;
        q.ops.push_back(QueueOp::Wait { fence: fence.0, value });
        state.auto_pump();
        Ok(())
    }

    fn execute_command_lists(&self, queue: RawQueue, lists: &[RawCommandList]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.check_removed("ExecuteCommandLists")?;
        state.check_fault("ExecuteCommandLists")?;

        let kind = state.queues.get(&queue.0).ok_or_else(|| unknown("ExecuteCommandLists", queue.0))?.kind;
        let mut batch = Vec::with_capacity(lists.len());

        for list in lists {
            let soft = state.lists.get(&list.0).ok_or_else(|| unknown("ExecuteCommandLists", list.0))?;
            if soft.open {
                return Err(GpuError::call("ExecuteCommandLists", "command list is still open"));
            }

            batch.push(soft.commands.clone());
            state.log.push(ExecutedList { queue: kind, list: *list, commands: soft.commands.clone() });
        }

        state.stats.executed_lists += lists.len() as u64;
        trace!(queue = kind.name(), count = lists.len(), "ExecuteCommandLists");

        if let Some(q) = state.queues.get_mut(&queue.0) {
            q.ops.push_back(QueueOp::Execute(batch));
        }

        state.auto_pump();
        Ok(())
    }

    fn create_heap(&self, desc: &HeapDesc) -> Result<RawHeap> {
        let mut state = self.state();
        state.check_removed("CreateHeap")?;
        if desc.size == 0 {
            return Err(MemoryError::HeapCreation("zero sized heap".to_string()).into());
        }

        let id = state.next_id();
        let resident = !(desc.create_not_resident && self.config.supports_not_resident);
        state.heaps.insert(id, SoftHeap { desc: *desc, bytes: vec![0; desc.size as usize], resident });
        Ok(RawHeap(id))
    }

    fn destroy_heap(&self, heap: RawHeap) {
        self.state().heaps.remove(&heap.0);
    }

    fn write_heap(&self, heap: RawHeap, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let heap = state.heaps.get_mut(&heap.0).ok_or_else(|| unknown("Map", heap.0))?;
        if !heap.desc.usage.is_cpu_visible() {
            return Err(MemoryError::NotCpuVisible.into());
        }

        let start = offset as usize;
        let limit = heap.bytes.len() as u64;
        let dst = heap.bytes.get_mut(start..start + data.len()).ok_or(MemoryError::OutOfRange {
            offset,
            size: data.len() as u64,
            limit,
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_heap(&self, heap: RawHeap, offset: u64, data: &mut [u8]) -> Result<()> {
        let state = self.state();
        let heap = state.heaps.get(&heap.0).ok_or_else(|| unknown("Map", heap.0))?;
        if !heap.desc.usage.is_cpu_visible() {
            return Err(MemoryError::NotCpuVisible.into());
        }

        let start = offset as usize;
        let src = heap.bytes.get(start..start + data.len()).ok_or(MemoryError::OutOfRange {
            offset,
            size: data.len() as u64,
            limit: heap.bytes.len() as u64,
        })?;
        data.copy_from_slice(src);
        Ok(())
    }

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        AllocationInfo {
            size: align_up(desc.footprint_total_size().max(1), DEFAULT_PLACEMENT_ALIGNMENT),
            alignment: DEFAULT_PLACEMENT_ALIGNMENT,
        }
    }

    fn create_placed_resource(
        &self,
        heap: RawHeap,
        offset: u64,
        desc: &ResourceDesc,
        _initial_state: ResourceStates,
    ) -> Result<RawResource> {
        let size = self.resource_allocation_info(desc).size;
        let mut state = self.state();
        state.check_removed("CreatePlacedResource")?;

        let heap_size = state.heaps.get(&heap.0).ok_or_else(|| unknown("CreatePlacedResource", heap.0))?.desc.size;
        if offset + desc.footprint_total_size() > heap_size {
            return Err(DeviceError::ResourceCreation(format!(
                "placed resource [{}, {}) exceeds heap size {}",
                offset,
                offset + size,
                heap_size
            ))
            .into());
        }

        let id = state.next_id();
        state.resources.insert(id, SoftResource {
            desc: *desc,
            size,
            backing: Backing::Placed { heap: heap.0, offset },
        });
        Ok(RawResource(id))
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        _initial_state: ResourceStates,
        create_not_resident: bool,
    ) -> Result<RawResource> {
        let size = self.resource_allocation_info(desc).size;
        let mut state = self.state();
        state.check_removed("CreateCommittedResource")?;

        let id = state.next_id();
        let resident = !(create_not_resident && self.config.supports_not_resident);
        state.resources.insert(id, SoftResource {
            desc: *desc,
            size,
            backing: Backing::Committed { bytes: vec![0; size as usize], resident },
        });
        Ok(RawResource(id))
    }

    fn destroy_resource(&self, resource: RawResource) {
        self.state().resources.remove(&resource.0);
    }

    fn supports_create_not_resident(&self) -> bool {
        self.config.supports_not_resident
    }

    fn video_memory_info(&self) -> VideoMemoryInfo {
        let state = self.state();
        VideoMemoryInfo {
            budget: state.budget,
            current_usage: state.current_usage(),
        }
    }

    fn enqueue_make_resident(&self, objects: &[Pageable], fence: RawFence, value: u64) -> Result<()> {
        let mut state = self.state();
        state.check_removed("EnqueueMakeResident")?;

        for object in objects {
            state.set_resident(object, true)?;
        }

        state.stats.make_resident_calls += 1;
        state.stats.made_resident += objects.len() as u64;
        state.residency_signals.push((fence.0, value));
        state.auto_pump();
        Ok(())
    }

    fn evict(&self, objects: &[Pageable]) -> Result<()> {
        let mut state = self.state();
        state.check_removed("Evict")?;

        for object in objects {
            state.set_resident(object, false)?;
        }

        state.stats.evicted += objects.len() as u64;
        Ok(())
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<RawCommandAllocator> {
        let mut state = self.state();
        state.check_removed("CreateCommandAllocator")?;
        let id = state.next_id();
        state.allocators.insert(id, kind);
        Ok(RawCommandAllocator(id))
    }

    fn reset_command_allocator(&self, allocator: RawCommandAllocator) -> Result<()> {
        let state = self.state();
        state.check_removed("ID3D12CommandAllocator::Reset")?;
        if state.allocators.contains_key(&allocator.0) {
            Ok(())
        } else {
            Err(unknown("ID3D12CommandAllocator::Reset", allocator.0))
        }
    }

    fn destroy_command_allocator(&self, allocator: RawCommandAllocator) {
        self.state().allocators.remove(&allocator.0);
    }

    fn create_command_list(&self, kind: QueueKind, allocator: RawCommandAllocator) -> Result<RawCommandList> {
        let mut state = self.state();
        state.check_removed("CreateCommandList")?;
        if !state.allocators.contains_key(&allocator.0) {
            return Err(unknown("CreateCommandList", allocator.0));
        }

        let id = state.next_id();
        state.lists.insert(id, SoftList { kind, open: true, commands: Vec::new() });
        Ok(RawCommandList(id))
    }

    fn reset_command_list(&self, list: RawCommandList, allocator: RawCommandAllocator) -> Result<()> {
        let mut state = self.state();
        state.check_removed("ID3D12GraphicsCommandList::Reset")?;
        let kind = state.allocators.get(&allocator.0).copied().ok_or_else(|| unknown("Reset", allocator.0))?;
        let soft = state.lists.get_mut(&list.0).ok_or_else(|| unknown("Reset", list.0))?;
        if soft.kind != kind {
            return Err(GpuError::call("ID3D12GraphicsCommandList::Reset", "allocator type mismatch"));
        }

        soft.open = true;
        soft.commands.clear();
        Ok(())
    }

    fn close_command_list(&self, list: RawCommandList) -> Result<()> {
        let mut state = self.state();
        let soft = state.lists.get_mut(&list.0).ok_or_else(|| unknown("Close", list.0))?;
        soft.open = false;
        Ok(())
    }

    fn destroy_command_list(&self, list: RawCommandList) {
        self.state().lists.remove(&list.0);
    }

    fn record(&self, list: RawCommandList, command: &GpuCommand) -> Result<()> {
        let mut state = self.state();
        let soft = state.lists.get_mut(&list.0).ok_or_else(|| unknown("record", list.0))?;
        if !soft.open {
            return Err(GpuError::call("record", "command list is closed"));
        }

        soft.commands.push(command.clone());
        Ok(())
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state().removed.clone()
    }

    fn recreate(&self) -> Result<()> {
        let mut state = self.state();
        let next_id = state.next_id;
        let stats = state.stats;
        let budget = state.budget;

        *state = SoftState {
            next_id,
            budget,
            stats: SoftStats {
                device_recreations: stats.device_recreations + 1,
                ..stats
            },
            ..Default::default()
        };

        info!("Software device recreated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SoftBackend {
        SoftBackend::new(SoftConfig { budget: 1 << 20, supports_not_resident: true })
    }

    #[test]
    fn test_queue_timeline_order() {
        let gpu = backend();
        let queue = gpu.create_queue(QueueKind::Direct).unwrap();
        let fence = gpu.create_fence(0).unwrap();
        let other = gpu.create_fence(0).unwrap();

        gpu.queue_wait(queue, other, 1).unwrap();
        gpu.queue_signal(queue, fence, 5).unwrap();
        assert_eq!(gpu.fence_completed_value(fence), 0);

        gpu.signal_fence(other, 1).unwrap();
        assert_eq!(gpu.fence_completed_value(fence), 5);
    }

    #[test]
    fn test_paused_wait() {
        let gpu = backend();
        let queue = gpu.create_queue(QueueKind::Copy).unwrap();
        let fence = gpu.create_fence(0).unwrap();

        gpu.pause();
        gpu.queue_signal(queue, fence, 1).unwrap();
        assert!(!gpu.wait_fences(&[(fence, 1)], Some(Duration::from_millis(1))).unwrap());
        assert!(gpu.wait_fences(&[(fence, 1)], None).is_err());

        gpu.resume();
        assert!(gpu.wait_fences(&[(fence, 1)], None).unwrap());
    }

    #[test]
    fn test_copy_moves_bytes() {
        let gpu = backend();
        let queue = gpu.create_queue(QueueKind::Copy).unwrap();
        let upload = gpu.create_heap(&HeapDesc { size: 1024, usage: HeapUsage::Upload, create_not_resident: false }).unwrap();
        let readback = gpu.create_heap(&HeapDesc { size: 1024, usage: HeapUsage::Readback, create_not_resident: false }).unwrap();
        let resource = gpu.create_committed_resource(&ResourceDesc::buffer(16), ResourceStates::COMMON, false).unwrap();

        gpu.write_heap(upload, 8, &[1, 2, 3, 4]).unwrap();

        let allocator = gpu.create_command_allocator(QueueKind::Copy).unwrap();
        let list = gpu.create_command_list(QueueKind::Copy, allocator).unwrap();
        gpu.record(list, &GpuCommand::CopyBuffer {
            dst: BufferLocation::Resource { resource, offset: 4 },
            src: BufferLocation::Heap { heap: upload, offset: 8 },
            size: 4,
        }).unwrap();
        gpu.record(list, &GpuCommand::CopyBuffer {
            dst: BufferLocation::Heap { heap: readback, offset: 0 },
            src: BufferLocation::Resource { resource, offset: 0 },
            size: 8,
        }).unwrap();
        gpu.close_command_list(list).unwrap();
        gpu.execute_command_lists(queue, &[list]).unwrap();

        let mut out = [0u8; 8];
        gpu.read_heap(readback, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(gpu.stats().residency_violations, 0);
    }

    #[test]
    fn test_residency_accounting() {
        let gpu = backend();
        let fence = gpu.create_fence(0).unwrap();
        let heap = gpu.create_heap(&HeapDesc { size: 4096, usage: HeapUsage::GpuBuffers, create_not_resident: true }).unwrap();
        assert_eq!(gpu.video_memory_info().current_usage, 0);

        gpu.enqueue_make_resident(&[Pageable::Heap(heap)], fence, 3).unwrap();
        assert_eq!(gpu.video_memory_info().current_usage, 4096);
        assert_eq!(gpu.fence_completed_value(fence), 3);

        gpu.evict(&[Pageable::Heap(heap)]).unwrap();
        assert!(!gpu.is_resident(Pageable::Heap(heap)));
    }

    #[test]
    fn test_device_removal_and_recreate() {
        let gpu = backend();
        let fence = gpu.create_fence(0).unwrap();
        gpu.simulate_device_removed("test");

        assert!(gpu.device_removed_reason().is_some());
        assert_eq!(gpu.fence_completed_value(fence), u64::MAX);
        assert!(gpu.create_fence(0).is_err());

        gpu.recreate().unwrap();
        assert!(gpu.device_removed_reason().is_none());
        assert_eq!(gpu.live_objects(), (0, 0, 0, 0));
        assert_eq!(gpu.stats().device_recreations, 1);
    }
}
