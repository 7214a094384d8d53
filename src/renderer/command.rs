//! 命令列表
//!
//! `Commands` 是从队列的池中借出的一组对象：一个命令列表及其分配器、一个只在提交时使用的
//! "前置列表"、一个私有的 `ResourceTracker`，以及本列表引用的驻留对象集合。
//!
//! 录制期间资源只在追踪器中记录本列表内的状态；真正的前一状态在 `Queue::execute`
//! 按提交顺序关闭列表时才确定，需要的转换屏障录制到前置列表，在本列表之前执行。
//!
//! 每个 `Commands` 有自己的栅栏，`next_fence_value` 就是本列表执行完成时的值，
//! 录制期间就可以交给资源作为读写依赖。
//!
//! 命令列表 API 的失败只记录日志，录制继续进行。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{trace, warn};

use super::device::Device;
use super::memory::MemRange;
use super::queue::Queue;
use super::residency::ResidencyKey;
use super::resource::Resource;
use super::sync::{Fence, FenceValue, FenceValues};
use super::tracker::{DecayBatch, ResourceTracker, SubResourceRange};
use crate::core::error::Result;
use crate::gfx::backend::{
    BufferLocation, GpuBackend, GpuCommand, QueueKind, RawCommandAllocator, RawCommandList, ResourceBarrier,
    ResourceStates, TextureFootprint, TextureLocation,
};

/// 命令列表与它的分配器
struct NativeList {
    backend: Arc<dyn GpuBackend>,
    allocator: RawCommandAllocator,
    list: RawCommandList,
}

impl NativeList {
    fn new(backend: &Arc<dyn GpuBackend>, kind: QueueKind) -> Result<Self> {
        let allocator = backend.create_command_allocator(kind)?;
        let list = match backend.create_command_list(kind, allocator) {
            Ok(list) => list,
            Err(e) => {
                backend.destroy_command_allocator(allocator);
                return Err(e);
            }
        };

        Ok(Self { backend: backend.clone(), allocator, list })
    }

    fn record(&self, command: &GpuCommand) {
        if let Err(e) = self.backend.record(self.list, command) {
            warn!(list = self.list.0, error = %e, "Failed to record command");
        }
    }

    fn close(&self) {
        if let Err(e) = self.backend.close_command_list(self.list) {
            warn!(list = self.list.0, error = %e, "Failed to close command list");
        }
    }

    /// GPU 用完之后才能调用
    fn reset(&self) -> Result<()> {
        self.backend.reset_command_allocator(self.allocator)?;
        self.backend.reset_command_list(self.list, self.allocator)
    }
}

impl Drop for NativeList {
    fn drop(&mut self) {
        self.backend.destroy_command_list(self.list);
        self.backend.destroy_command_allocator(self.allocator);
    }
}

/// 池中复用的部分
pub(crate) struct CommandsData {
    fence: Fence,
    main: NativeList,
    before: NativeList,
    tracker: ResourceTracker,
    residency_set: HashSet<ResidencyKey>,
    generation: u64,
    has_before: bool,
    recorded: usize,
}

impl CommandsData {
    pub(crate) fn new(device: &Device, queue_name: &str, kind: QueueKind, queue_id: u64) -> Result<Self> {
        let fence = Fence::with_queue_id(device, format!("{} commands", queue_name), Some(queue_id))?;
        let main = NativeList::new(device.backend(), kind)?;
        let before = NativeList::new(device.backend(), kind)?;

        Ok(Self {
            fence,
            main,
            before,
            tracker: ResourceTracker::new(),
            residency_set: HashSet::new(),
            generation: device.generation(),
            has_before: false,
            recorded: 0,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn fence(&self) -> &Fence {
        &self.fence
    }

    pub(crate) fn residency_set(&self) -> &HashSet<ResidencyKey> {
        &self.residency_set
    }

    /// 按执行顺序排列的原生列表
    pub(crate) fn lists(&self) -> impl Iterator<Item = RawCommandList> + '_ {
        self.has_before.then_some(self.before.list).into_iter().chain(std::iter::once(self.main.list))
    }

    /// GPU 完成之后重置，重新进入录制状态
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.main.reset()?;
        self.before.reset()?;
        self.tracker.reset();
        self.residency_set.clear();
        self.has_before = false;
        self.recorded = 0;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.recorded == 0 && self.tracker.is_empty() && self.residency_set.is_empty()
    }

    fn flush_barriers(&mut self) {
        if let Some(command) = self.tracker.flush() {
            self.main.record(&command);
            self.recorded += 1;
        }
    }

    fn record(&mut self, command: GpuCommand) {
        self.flush_barriers();
        trace!(list = self.main.list.0, ?command, "Record");
        self.main.record(&command);
        self.recorded += 1;
    }
}

/// 正在录制的命令列表
///
/// 析构时如果还没有提交，会自动提交到所属队列。
pub struct Commands {
    queue: Arc<Queue>,
    data: Option<CommandsData>,
    wait_before_execute: FenceValues,
}

impl Commands {
    pub(crate) fn new(queue: Arc<Queue>, data: CommandsData) -> Self {
        Self { queue, data: Some(data), wait_before_execute: FenceValues::default() }
    }

    pub fn kind(&self) -> QueueKind {
        self.queue.kind()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// 设备重置之后，之前借出的命令列表失效
    pub fn is_valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.generation == self.queue.device().generation())
    }

    /// 本列表执行完成时的栅栏值
    pub fn next_fence_value(&self) -> FenceValue {
        self.data.as_ref().map(|d| d.fence.next_value()).unwrap_or_default()
    }

    /// 执行之前需要等待的栅栏值
    pub fn pending_waits(&self) -> &FenceValues {
        &self.wait_before_execute
    }

    /// 本列表之前必须完成的 GPU 工作（可以来自其他队列）
    pub fn wait_before_execute(&mut self, value: FenceValue) {
        self.wait_before_execute.add(value);
    }

    /// 没有录制任何内容
    pub fn is_empty(&self) -> bool {
        self.wait_before_execute.is_empty() && self.data.as_ref().map_or(true, CommandsData::is_empty)
    }

    pub fn begin_event(&mut self, name: &str) {
        self.record(GpuCommand::BeginEvent(name.to_string()));
    }

    pub fn end_event(&mut self) {
        self.record(GpuCommand::EndEvent);
    }

    /// 录制一条命令，之前积累的屏障先录制
    pub fn record(&mut self, command: GpuCommand) {
        if let Some(data) = self.data.as_mut() {
            data.record(command);
        }
    }

    /// 把整个资源转换到 `state`
    pub fn resource_state(&mut self, resource: &Resource, state: ResourceStates) {
        self.resource_state_range(resource, state, SubResourceRange::all(resource.desc()));
    }

    pub fn resource_state_sub_index(&mut self, resource: &Resource, state: ResourceStates, sub_index: usize) {
        self.resource_state_range(resource, state, SubResourceRange::sub_index(resource.desc(), sub_index));
    }

    pub fn resource_state_range(&mut self, resource: &Resource, state: ResourceStates, range: SubResourceRange) {
        let Some(data) = self.data.as_mut() else { return };

        if let Some(key) = resource.residency_key() {
            data.residency_set.insert(key);
        }

        let shared = resource.shared();
        if let Some(mem_range) = shared.placed_range() {
            let previous = mem_range.set_active_resource(Some(shared.storage_id()));
            if previous.is_some_and(|id| id != shared.storage_id()) {
                data.tracker.alias_barrier(None, Some(shared));
            }
        }

        let value = data.fence.next_value();
        resource.prepare_state(&mut self.wait_before_execute, &value, &mut data.tracker, state, range);
    }

    pub fn uav_barrier(&mut self, resource: Option<&Resource>) {
        if let Some(data) = self.data.as_mut() {
            data.tracker.uav_barrier(resource.map(|r| r.shared().as_ref()));
        }
    }

    /// 两个放置在同一段内存上的资源之间切换
    pub fn resource_alias(&mut self, before: Option<&Resource>, after: Option<&Resource>) {
        let Some(data) = self.data.as_mut() else { return };

        if let Some(after) = after {
            if let Some(range) = after.mem_range() {
                range.set_active_resource(Some(after.shared().storage_id()));
            }
        }

        data.tracker.alias_barrier(before.map(|r| r.shared().as_ref()), after.map(|r| r.shared().as_ref()));
    }

    /// 保证这块内存在本列表执行时驻留
    pub fn keep_resident(&mut self, key: ResidencyKey) {
        if let Some(data) = self.data.as_mut() {
            data.residency_set.insert(key);
        }
    }

    pub fn keep_resident_range(&mut self, range: &MemRange) {
        if let Some(key) = range.residency_key() {
            self.keep_resident(key);
        }
    }

    pub fn copy_buffer(&mut self, dst: &Resource, dst_offset: u64, src: &Resource, src_offset: u64, size: u64) {
        self.resource_state(dst, ResourceStates::COPY_DEST);
        self.resource_state(src, ResourceStates::COPY_SOURCE);

        let (Some(dst), Some(src)) = (dst.raw(), src.raw()) else { return };
        self.record(GpuCommand::CopyBuffer {
            dst: BufferLocation::Resource { resource: dst, offset: dst_offset },
            src: BufferLocation::Resource { resource: src, offset: src_offset },
            size,
        });
    }

    /// 从上传内存拷贝到缓冲区
    pub fn update_buffer(&mut self, dst: &Resource, dst_offset: u64, src: &MemRange, size: u64) {
        self.resource_state(dst, ResourceStates::COPY_DEST);
        self.keep_resident_range(src);

        let (Some(dst), Some(src)) = (dst.raw(), src.location(0)) else { return };
        self.record(GpuCommand::CopyBuffer {
            dst: BufferLocation::Resource { resource: dst, offset: dst_offset },
            src,
            size,
        });
    }

    /// 从缓冲区拷贝到读回内存
    pub fn readback_buffer(&mut self, dst: &MemRange, src: &Resource, src_offset: u64, size: u64) {
        self.resource_state(src, ResourceStates::COPY_SOURCE);
        self.keep_resident_range(dst);

        let (Some(dst), Some(src)) = (dst.location(0), src.raw()) else { return };
        self.record(GpuCommand::CopyBuffer {
            dst,
            src: BufferLocation::Resource { resource: src, offset: src_offset },
            size,
        });
    }

    pub fn update_texture(&mut self, dst: &Resource, sub_index: usize, src: &MemRange, footprint: TextureFootprint) {
        self.resource_state_sub_index(dst, ResourceStates::COPY_DEST, sub_index);
        self.keep_resident_range(src);

        let (Some(dst), Some(heap)) = (dst.raw(), src.heap().raw()) else { return };
        self.record(GpuCommand::CopyTexture {
            dst: TextureLocation::Subresource { resource: dst, index: sub_index as u32 },
            src: TextureLocation::Footprint { heap, offset: src.heap_offset(), footprint },
        });
    }

    pub fn readback_texture(&mut self, dst: &MemRange, footprint: TextureFootprint, src: &Resource, sub_index: usize) {
        self.resource_state_sub_index(src, ResourceStates::COPY_SOURCE, sub_index);
        self.keep_resident_range(dst);

        let (Some(src), Some(heap)) = (src.raw(), dst.heap().raw()) else { return };
        self.record(GpuCommand::CopyTexture {
            dst: TextureLocation::Footprint { heap, offset: dst.heap_offset(), footprint },
            src: TextureLocation::Subresource { resource: src, index: sub_index as u32 },
        });
    }

    pub fn copy_texture(&mut self, dst: &Resource, dst_sub: usize, src: &Resource, src_sub: usize) {
        self.resource_state_sub_index(dst, ResourceStates::COPY_DEST, dst_sub);
        self.resource_state_sub_index(src, ResourceStates::COPY_SOURCE, src_sub);

        let (Some(dst), Some(src)) = (dst.raw(), src.raw()) else { return };
        self.record(GpuCommand::CopyTexture {
            dst: TextureLocation::Subresource { resource: dst, index: dst_sub as u32 },
            src: TextureLocation::Subresource { resource: src, index: src_sub as u32 },
        });
    }

    /// 拷贝整个资源，两个资源的描述必须兼容
    pub fn copy_resource(&mut self, dst: &Resource, src: &Resource) {
        if dst.desc().is_buffer() {
            let size = dst.desc().width.min(src.desc().width);
            self.copy_buffer(dst, 0, src, 0, size);
            return;
        }

        self.resource_state(dst, ResourceStates::COPY_DEST);
        self.resource_state(src, ResourceStates::COPY_SOURCE);

        let (Some(dst_raw), Some(src_raw)) = (dst.raw(), src.raw()) else { return };
        let count = dst.desc().sub_resource_count().min(src.desc().sub_resource_count());
        for index in 0..count as u32 {
            self.record(GpuCommand::CopyTexture {
                dst: TextureLocation::Subresource { resource: dst_raw, index },
                src: TextureLocation::Subresource { resource: src_raw, index },
            });
        }
    }

    /// 按提交顺序关闭，由 `Queue::execute` 调用
    ///
    /// 追踪器的待定转换与资源的全局状态比较，真正需要的屏障录制到前置列表。
    pub(crate) fn close(&mut self, waits: &mut FenceValues, batch: &mut DecayBatch) {
        waits.add_all(&self.wait_before_execute);
        self.wait_before_execute.clear();

        let Some(data) = self.data.as_mut() else { return };
        data.flush_barriers();

        let mut before: Vec<ResourceBarrier> = Vec::new();
        data.tracker.close(&mut before, batch);

        data.has_before = !before.is_empty();
        if data.has_before {
            data.before.record(&GpuCommand::Barriers(before));
        }

        data.main.close();
        data.before.close();
    }

    pub(crate) fn take_data(&mut self) -> Option<CommandsData> {
        self.data.take()
    }

    /// 提交到所属队列
    pub fn execute(mut self) -> Result<FenceValue> {
        let queue = self.queue.clone();
        queue.execute_one(&mut self)
    }
}

impl Drop for Commands {
    fn drop(&mut self) {
        if self.data.is_none() {
            return;
        }

        let queue = self.queue.clone();
        if let Err(e) = queue.execute_one(self) {
            warn!(queue = queue.name(), error = %e, "Failed to execute dropped commands");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::backend::ResourceDesc;
    use crate::gfx::{SoftBackend, SoftConfig};
    use crate::renderer::context::GraphicsContext;

    fn context() -> (Arc<SoftBackend>, GraphicsContext) {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let ctx = GraphicsContext::new(Config::default(), soft.clone()).unwrap();
        (soft, ctx)
    }

    #[test]
    fn test_empty_commands_complete() {
        let (soft, ctx) = context();
        soft.clear_log();

        let commands = ctx.direct_queue().new_commands().unwrap();
        assert!(commands.is_empty());
        let value = commands.execute().unwrap();

        assert!(value.complete());
        assert!(soft.executed_lists().is_empty());
    }

    #[test]
    fn test_explicit_barrier_goes_before_list() {
        let (soft, ctx) = context();
        let texture =
            Resource::new(&ctx, "target", ResourceDesc::texture_2d(16, 16, 4, 1, 1).with_render_target(), ResourceStates::COMMON)
                .unwrap();

        soft.clear_log();
        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&texture, ResourceStates::RENDER_TARGET);
        commands.begin_event("draw");
        commands.end_event();
        commands.execute().unwrap();

        let lists = soft.executed_lists();
        assert_eq!(lists.len(), 2);
        assert_eq!(
            lists[0].barriers(),
            vec![ResourceBarrier::Transition {
                resource: texture.raw().unwrap(),
                subresource: None,
                before: ResourceStates::COMMON,
                after: ResourceStates::RENDER_TARGET,
            }]
        );
        assert_eq!(lists[1].commands.len(), 2);
        assert_eq!(texture.state(0), ResourceStates::RENDER_TARGET);
    }

    #[test]
    fn test_barriers_within_list() {
        let (soft, ctx) = context();
        let texture = Resource::new(&ctx, "texture", ResourceDesc::texture_2d(8, 8, 4, 1, 1), ResourceStates::COMMON)
            .unwrap();

        soft.clear_log();
        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&texture, ResourceStates::COPY_DEST);
        commands.resource_state(&texture, ResourceStates::PIXEL_SHADER_RESOURCE);
        commands.uav_barrier(None);
        commands.execute().unwrap();

        // 第一次转换是隐式提升，第二次在本列表中录制
        let lists = soft.executed_lists();
        assert_eq!(lists.len(), 1);
        assert_eq!(
            lists[0].barriers(),
            vec![
                ResourceBarrier::Transition {
                    resource: texture.raw().unwrap(),
                    subresource: None,
                    before: ResourceStates::COPY_DEST,
                    after: ResourceStates::PIXEL_SHADER_RESOURCE,
                },
                ResourceBarrier::Uav { resource: None },
            ]
        );
        assert_eq!(texture.state(0), ResourceStates::PIXEL_SHADER_RESOURCE);
    }

    #[test]
    fn test_dropped_commands_execute() {
        let (soft, ctx) = context();
        let buffer = Resource::new(&ctx, "buffer", ResourceDesc::buffer(256), ResourceStates::COMMON).unwrap();

        soft.clear_log();
        let value = {
            let mut commands = ctx.compute_queue().new_commands().unwrap();
            commands.resource_state(&buffer, ResourceStates::UNORDERED_ACCESS);
            commands.uav_barrier(Some(&buffer));
            commands.next_fence_value()
        };

        assert!(value.complete());
        assert_eq!(soft.executed_lists().len(), 1);
        assert_eq!(soft.executed_lists()[0].queue, QueueKind::Compute);
    }

    #[test]
    fn test_commands_are_recycled() {
        let (soft, ctx) = context();
        let first = ctx.copy_queue().new_commands().unwrap();
        let fence = first.data.as_ref().unwrap().fence.key();
        first.execute().unwrap();
        ctx.copy_queue().wait_for_idle().unwrap();
        let (_, _, _, lists) = soft.live_objects();

        let second = ctx.copy_queue().new_commands().unwrap();
        assert_eq!(second.data.as_ref().unwrap().fence.key(), fence);
        assert_eq!(soft.live_objects().3, lists);
    }
}
