//! GPU 资源
//!
//! `Resource` 是对外的句柄，`ResourceShared` 是一次具体的分配：原生资源、放置方式
//! （堆内的 `MemRange` 或提交资源）、两次执行之间的全局状态以及仍在使用它的 GPU 工作。
//!
//! 句柄销毁或 `replace_storage` 时，旧的分配连同它的读写栅栏值交给 `KeepAlive`，
//! GPU 用完之后才真正释放。命令列表追踪器也持有分配的引用，直到列表提交。
//!
//! # 读写栅栏
//!
//! - 进入写状态：等待之前所有的读者与写者，本次执行成为唯一的写者
//! - 进入读状态：等待之前的写者，本次执行加入读者集合

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use super::command::Commands;
use super::context::GraphicsContext;
use super::device::Device;
use super::device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
use super::memory::MemRange;
use super::residency::{ResidencyHandle, ResidencyKey};
use super::state::{ResourceState, StateType};
use super::sync::{FenceValue, FenceValues};
use super::tracker::{ResourceTracker, SubResourceRange};
use crate::core::error::{DeviceError, MemoryError, Result};
use crate::gfx::backend::{Pageable, RawResource, ResourceDesc, ResourceStates, TextureFootprint};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// 只允许在提交线程上修改
pub(crate) struct ResourceTracking {
    pub global_state: ResourceState,
    pub reads: FenceValues,
    pub write: FenceValue,
}

impl ResourceTracking {
    fn new(desc: &ResourceDesc, state: ResourceStates) -> Self {
        Self {
            global_state: ResourceState::new(
                state,
                StateType::Global,
                desc.array_size as usize,
                desc.mip_levels as usize,
            ),
            reads: FenceValues::default(),
            write: FenceValue::default(),
        }
    }

    /// 所有尚未完成的读写
    fn fence_values(&self) -> FenceValues {
        let mut values = self.reads.clone();
        values.add(self.write.clone());
        values
    }
}

enum Placement {
    Placed(Arc<MemRange>),
    Committed { residency: ResidencyHandle, not_resident: bool },
}

/// 资源的一次分配
pub struct ResourceShared {
    storage_id: u64,
    device: Arc<Device>,
    name: String,
    desc: ResourceDesc,
    initial_state: ResourceStates,
    placement: Placement,
    raw: Mutex<Option<RawResource>>,
    tracking: Mutex<ResourceTracking>,
    _child: DeviceChildHandle,
}

enum StorageSource {
    Range(Arc<MemRange>),
    Committed,
}

impl ResourceShared {
    fn create(
        device: &Arc<Device>,
        name: &str,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        source: StorageSource,
    ) -> Result<Arc<Self>> {
        let size = device.backend().resource_allocation_info(&desc).size;

        let (raw, placement) = match Self::create_raw(device, name, &desc, initial_state, size, source) {
            Ok(created) => created,
            Err(e) => {
                warn!(resource = name, size, error = %e, "Failed to create resource");
                return Err(e);
            }
        };

        debug!(resource = name, size, placed = matches!(placement, Placement::Placed(_)), "Resource created");

        Ok(Arc::new_cyclic(|weak: &Weak<ResourceShared>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            Self {
                storage_id: next_id(),
                device: device.clone(),
                name: name.to_string(),
                desc,
                initial_state,
                placement,
                raw: Mutex::new(Some(raw)),
                tracking: Mutex::new(ResourceTracking::new(&desc, initial_state)),
                _child: device.children().register(child, ResetPriority::Resource),
            }
        }))
    }

    fn create_raw(
        device: &Arc<Device>,
        name: &str,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        size: u64,
        source: StorageSource,
    ) -> Result<(RawResource, Placement)> {
        let backend = device.backend();
        match source {
            StorageSource::Range(range) => {
                let heap = range
                    .heap()
                    .raw()
                    .ok_or_else(|| DeviceError::ResourceCreation(format!("{}: heap is released", name)))?;
                let raw = backend
                    .create_placed_resource(heap, range.heap_offset(), desc, initial_state)
                    .map_err(|e| DeviceError::ResourceCreation(format!("{}: {}", name, e)))?;
                Ok((raw, Placement::Placed(range)))
            }
            StorageSource::Committed => {
                let not_resident = device.create_not_resident();
                let raw = backend
                    .create_committed_resource(desc, initial_state, not_resident)
                    .map_err(|e| DeviceError::ResourceCreation(format!("{}: {}", name, e)))?;
                let residency =
                    ResidencyHandle::new(device.residency(), Some(Pageable::Resource(raw)), size, !not_resident);
                Ok((raw, Placement::Committed { residency, not_resident }))
            }
        }
    }

    /// 每次分配唯一
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn raw(&self) -> Option<RawResource> {
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tracking(&self) -> MutexGuard<'_, ResourceTracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn placed_range(&self) -> Option<&Arc<MemRange>> {
        match &self.placement {
            Placement::Placed(range) => Some(range),
            Placement::Committed { .. } => None,
        }
    }

    pub fn residency_key(&self) -> Option<ResidencyKey> {
        match &self.placement {
            Placement::Placed(range) => range.residency_key(),
            Placement::Committed { residency, .. } => Some(residency.key()),
        }
    }

    fn destroy_raw(&self) {
        if let Some(raw) = self.raw.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.device.backend().destroy_resource(raw);
        }
    }
}

impl DeviceChild for ResourceShared {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
        self.destroy_raw();
        *self.tracking() = ResourceTracking::new(&self.desc, self.initial_state);

        if let Placement::Committed { residency, .. } = &self.placement {
            residency.update(None, false);
        }

        None
    }

    fn reset(&self, _data: Option<Box<dyn Any + Send>>) -> bool {
        let backend = self.device.backend();
        let result = match &self.placement {
            Placement::Placed(range) => match range.heap().raw() {
                Some(heap) => backend.create_placed_resource(heap, range.heap_offset(), &self.desc, self.initial_state),
                None => Err(DeviceError::ResourceCreation("heap is released".to_string()).into()),
            },
            Placement::Committed { not_resident, .. } => {
                backend.create_committed_resource(&self.desc, self.initial_state, *not_resident)
            }
        };

        match result {
            Ok(raw) => {
                *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
                if let Placement::Committed { residency, not_resident } = &self.placement {
                    residency.update(Some(Pageable::Resource(raw)), !*not_resident);
                }
                true
            }
            Err(e) => {
                warn!(resource = %self.name, error = %e, "Failed to recreate resource");
                false
            }
        }
    }
}

impl Drop for ResourceShared {
    fn drop(&mut self) {
        if let Placement::Placed(range) = &self.placement {
            if range.active_resource() == Some(self.storage_id) {
                range.set_active_resource(None);
            }
        }

        self.destroy_raw();
    }
}

/// GPU 资源句柄
pub struct Resource {
    id: u64,
    shared: Arc<ResourceShared>,
    keep_alive: Arc<super::keep_alive::KeepAlive>,
}

impl Resource {
    /// 从上下文的分配器中放置一个资源
    pub fn new(ctx: &GraphicsContext, name: &str, desc: ResourceDesc, initial_state: ResourceStates) -> Result<Self> {
        let range = Self::allocate(ctx, &desc)?;
        Self::from_source(ctx, name, desc, initial_state, StorageSource::Range(range))
    }

    /// 放置在给定的内存上（别名）；对齐或大小不满足时退回到分配器
    pub fn with_range(
        ctx: &GraphicsContext,
        name: &str,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        range: Arc<MemRange>,
    ) -> Result<Self> {
        let info = ctx.device().backend().resource_allocation_info(&desc);
        let range = if range.start() % info.alignment != 0 || range.size() < info.size {
            warn!(
                resource = name,
                start = range.start(),
                size = range.size(),
                required = info.size,
                "Memory range cannot hold resource, allocating new memory"
            );
            Self::allocate(ctx, &desc)?
        } else {
            range
        };

        Self::from_source(ctx, name, desc, initial_state, StorageSource::Range(range))
    }

    /// 拥有独立分配的提交资源
    pub fn committed(ctx: &GraphicsContext, name: &str, desc: ResourceDesc, initial_state: ResourceStates) -> Result<Self> {
        Self::from_source(ctx, name, desc, initial_state, StorageSource::Committed)
    }

    fn allocate(ctx: &GraphicsContext, desc: &ResourceDesc) -> Result<Arc<MemRange>> {
        let info = ctx.device().backend().resource_allocation_info(desc);
        let allocator = if desc.is_buffer() {
            ctx.static_buffer_allocator()
        } else if desc.render_target {
            ctx.target_allocator()
        } else {
            ctx.texture_allocator()
        };

        Ok(Arc::new(allocator.alloc_bytes(info.size, info.alignment)?))
    }

    fn from_source(
        ctx: &GraphicsContext,
        name: &str,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        source: StorageSource,
    ) -> Result<Self> {
        let shared = ResourceShared::create(ctx.device(), name, desc, initial_state, source)?;
        Ok(Self { id: next_id(), shared, keep_alive: ctx.keep_alive().clone() })
    }

    /// 以 `other` 的内容创建一个新资源，拷贝在 GPU 上完成
    pub fn clone_from(ctx: &GraphicsContext, other: &Resource, commands: Option<&mut Commands>) -> Result<Self> {
        let name = format!("{} (copy)", other.name());
        let desc = *other.desc();
        let resource = match other.shared.placement {
            Placement::Placed(_) => Self::new(ctx, &name, desc, other.shared.initial_state)?,
            Placement::Committed { .. } => Self::committed(ctx, &name, desc, other.shared.initial_state)?,
        };

        with_commands(ctx, commands, |commands| {
            commands.copy_resource(&resource, other);
            Ok(())
        })?;

        Ok(resource)
    }

    /// 换成新的分配，句柄标识不变；旧内容不保留
    pub fn replace_storage(&mut self, ctx: &GraphicsContext, desc: ResourceDesc) -> Result<()> {
        let name = self.shared.name.clone();
        let initial_state = self.shared.initial_state;
        let source = match self.shared.placement {
            Placement::Placed(_) => StorageSource::Range(Self::allocate(ctx, &desc)?),
            Placement::Committed { .. } => StorageSource::Committed,
        };

        let shared = ResourceShared::create(ctx.device(), &name, desc, initial_state, source)?;
        let old = std::mem::replace(&mut self.shared, shared);
        self.retire(old);
        Ok(())
    }

    fn retire(&self, shared: Arc<ResourceShared>) {
        let fences = shared.tracking().fence_values();
        self.keep_alive.add(shared, fences);
    }

    /// 句柄标识，`replace_storage` 之后不变
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn desc(&self) -> &ResourceDesc {
        self.shared.desc()
    }

    pub fn raw(&self) -> Option<RawResource> {
        self.shared.raw()
    }

    pub fn shared(&self) -> &Arc<ResourceShared> {
        &self.shared
    }

    pub fn mem_range(&self) -> Option<&Arc<MemRange>> {
        self.shared.placed_range()
    }

    pub fn residency_key(&self) -> Option<ResidencyKey> {
        self.shared.residency_key()
    }

    /// 两次执行之间子资源的状态
    pub fn state(&self, sub_index: usize) -> ResourceStates {
        self.shared.tracking().global_state.get(sub_index, None).0
    }

    /// 仍在读写这个资源的 GPU 工作
    pub fn fence_values(&self) -> FenceValues {
        self.shared.tracking().fence_values()
    }

    pub fn write_fence_value(&self) -> FenceValue {
        self.shared.tracking().write.clone()
    }

    /// 记录新的读写者，然后交给追踪器
    pub(crate) fn prepare_state(
        &self,
        wait_before_execute: &mut FenceValues,
        fence_value: &FenceValue,
        tracker: &mut ResourceTracker,
        state: ResourceStates,
        range: SubResourceRange,
    ) {
        {
            let mut tracking = self.shared.tracking();
            if state.is_write() {
                wait_before_execute.add_all(&tracking.reads);
                wait_before_execute.add(tracking.write.clone());
                tracking.reads.clear();
                tracking.write = fence_value.clone();
            } else {
                wait_before_execute.add(tracking.write.clone());
                tracking.reads.add(fence_value.clone());
            }
        }

        tracker.state_barrier(&self.shared, state, range);
    }

    fn check_buffer_range(&self, offset: u64, size: u64) -> Result<()> {
        let limit = self.desc().width;
        if !self.desc().is_buffer() || offset + size > limit {
            return Err(MemoryError::OutOfRange { offset, size, limit }.into());
        }

        Ok(())
    }

    /// 上传缓冲区数据；没有给出命令列表时使用拷贝队列并立即提交
    pub fn update_buffer(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        offset: u64,
        data: &[u8],
    ) -> Result<FenceValue> {
        if data.is_empty() {
            return Ok(FenceValue::default());
        }
        self.check_buffer_range(offset, data.len() as u64)?;

        with_commands(ctx, commands, |commands| {
            let range = ctx.upload_allocator().alloc_buffer(data.len() as u64, &commands.next_fence_value())?;
            range.cpu_write(0, data)?;
            commands.update_buffer(self, offset, &range, data.len() as u64);
            Ok(commands.next_fence_value())
        })
    }

    pub fn update_buffer_typed<T: bytemuck::Pod>(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        offset: u64,
        data: &[T],
    ) -> Result<FenceValue> {
        self.update_buffer(ctx, commands, offset, bytemuck::cast_slice(data))
    }

    /// 上传一个子资源，`data` 为紧凑排列的行
    pub fn update_texture(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        sub_index: usize,
        data: &[u8],
    ) -> Result<FenceValue> {
        let footprint = self.texture_footprint(sub_index, data.len())?;

        with_commands(ctx, commands, |commands| {
            let range = ctx.upload_allocator().alloc_texture(footprint.size(), &commands.next_fence_value())?;
            let row = footprint.row_bytes() as usize;
            for (y, chunk) in data.chunks(row).enumerate() {
                range.cpu_write(y as u64 * footprint.row_pitch as u64, chunk)?;
            }

            commands.update_texture(self, sub_index, &range, footprint);
            Ok(commands.next_fence_value())
        })
    }

    fn texture_footprint(&self, sub_index: usize, len: usize) -> Result<TextureFootprint> {
        let desc = self.desc();
        if desc.is_buffer() || sub_index >= desc.sub_resource_count() {
            return Err(MemoryError::OutOfRange {
                offset: sub_index as u64,
                size: 1,
                limit: desc.sub_resource_count() as u64,
            }
            .into());
        }

        let (_, footprint) = desc.footprint(sub_index);
        let expected = footprint.row_bytes() * footprint.height as u64;
        if len as u64 != expected {
            return Err(MemoryError::InvalidSize { size: len as u64, limit: expected }.into());
        }

        Ok(footprint)
    }

    /// 把缓冲区拷贝到读回内存，返回完成时的栅栏值
    pub fn readback_buffer(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        offset: u64,
        size: u64,
    ) -> Result<(FenceValue, MemRange)> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { size, limit: self.desc().width }.into());
        }
        self.check_buffer_range(offset, size)?;

        with_commands(ctx, commands, |commands| {
            let range = ctx.readback_allocator().alloc_buffer(size, &commands.next_fence_value())?;
            commands.readback_buffer(&range, self, offset, size);
            Ok((commands.next_fence_value(), range))
        })
    }

    /// 读回并在 CPU 上等待结果
    pub fn capture_buffer(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let (fence_value, range) = self.readback_buffer(ctx, commands, offset, size)?;
        fence_value.wait(None)?;

        let mut bytes = vec![0; size as usize];
        range.cpu_read(0, &mut bytes)?;
        Ok(bytes)
    }

    /// 有时限的读回，超时返回 `None`；`timeout` 为空时使用配置中的时限
    pub fn capture_buffer_timeout(
        &self,
        ctx: &GraphicsContext,
        offset: u64,
        size: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(ctx.device().config().submission.capture_timeout_ms));
        let (fence_value, range) = self.readback_buffer(ctx, None, offset, size)?;

        if !fence_value.wait_timeout(timeout) {
            debug!(resource = self.name(), timeout_ms = timeout.as_millis() as u64, "Capture timed out");
            return Ok(None);
        }

        let mut bytes = vec![0; size as usize];
        range.cpu_read(0, &mut bytes)?;
        Ok(Some(bytes))
    }

    /// 把一个子资源拷贝到读回内存
    pub fn readback_texture(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        sub_index: usize,
    ) -> Result<(FenceValue, MemRange, TextureFootprint)> {
        let desc = self.desc();
        if desc.is_buffer() || sub_index >= desc.sub_resource_count() {
            return Err(MemoryError::OutOfRange {
                offset: sub_index as u64,
                size: 1,
                limit: desc.sub_resource_count() as u64,
            }
            .into());
        }

        let (_, footprint) = desc.footprint(sub_index);
        with_commands(ctx, commands, |commands| {
            let range = ctx.readback_allocator().alloc_texture(footprint.size(), &commands.next_fence_value())?;
            commands.readback_texture(&range, footprint, self, sub_index);
            Ok((commands.next_fence_value(), range, footprint))
        })
    }

    /// 读回一个子资源，返回紧凑排列的行
    pub fn capture_texture(
        &self,
        ctx: &GraphicsContext,
        commands: Option<&mut Commands>,
        sub_index: usize,
    ) -> Result<Vec<u8>> {
        let (fence_value, range, footprint) = self.readback_texture(ctx, commands, sub_index)?;
        fence_value.wait(None)?;

        let row = footprint.row_bytes() as usize;
        let mut bytes = vec![0; row * footprint.height as usize];
        for (y, chunk) in bytes.chunks_mut(row).enumerate() {
            range.cpu_read(y as u64 * footprint.row_pitch as u64, chunk)?;
        }

        Ok(bytes)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.retire(self.shared.clone());
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("desc", self.desc())
            .finish()
    }
}

/// 使用调用方的命令列表，或者新建一个拷贝队列命令列表并立即提交
fn with_commands<T>(
    ctx: &GraphicsContext,
    commands: Option<&mut Commands>,
    record: impl FnOnce(&mut Commands) -> Result<T>,
) -> Result<T> {
    match commands {
        Some(commands) => record(commands),
        None => {
            let mut commands = ctx.copy_queue().new_commands()?;
            let result = record(&mut commands)?;
            commands.execute()?;
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::{SoftBackend, SoftConfig};

    fn context() -> (Arc<SoftBackend>, GraphicsContext) {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let ctx = GraphicsContext::new(Config::default(), soft.clone()).unwrap();
        (soft, ctx)
    }

    #[test]
    fn test_buffer_round_trip() {
        let (_soft, ctx) = context();
        let buffer = Resource::new(&ctx, "buffer", ResourceDesc::buffer(1024), ResourceStates::COMMON).unwrap();

        let data: Vec<u8> = (0..=255).collect();
        let written = buffer.update_buffer(&ctx, None, 128, &data).unwrap();
        assert!(written.is_set());

        let bytes = buffer.capture_buffer(&ctx, None, 128, 256).unwrap();
        assert_eq!(bytes, data);

        // 拷贝队列上的缓冲区在执行结束后衰减回 COMMON
        assert_eq!(buffer.state(0), ResourceStates::COMMON);
    }

    #[test]
    fn test_typed_update() {
        let (_soft, ctx) = context();
        let buffer = Resource::committed(&ctx, "typed", ResourceDesc::buffer(64), ResourceStates::COMMON).unwrap();

        buffer.update_buffer_typed(&ctx, None, 0, &[1u32, 2, 3, 4]).unwrap();
        let bytes = buffer.capture_buffer(&ctx, None, 0, 16).unwrap();
        let values: Vec<u32> = bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_update() {
        let (_soft, ctx) = context();
        let buffer = Resource::new(&ctx, "small", ResourceDesc::buffer(16), ResourceStates::COMMON).unwrap();
        assert!(buffer.update_buffer(&ctx, None, 8, &[0; 16]).is_err());
        assert!(buffer.readback_buffer(&ctx, None, 0, 0).is_err());
        assert!(buffer.update_buffer(&ctx, None, 0, &[]).unwrap().complete());
    }

    #[test]
    fn test_texture_round_trip() {
        let (_soft, ctx) = context();
        let desc = ResourceDesc::texture_2d(8, 4, 4, 2, 2);
        let texture = Resource::new(&ctx, "texture", desc, ResourceStates::COMMON).unwrap();

        let (_, footprint) = desc.footprint(3);
        let size = (footprint.row_bytes() * footprint.height as u64) as usize;
        let pixels: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();

        texture.update_texture(&ctx, None, 3, &pixels).unwrap();
        assert_eq!(texture.capture_texture(&ctx, None, 3).unwrap(), pixels);
        assert!(texture.update_texture(&ctx, None, 3, &pixels[1..]).is_err());
    }

    #[test]
    fn test_clone_from() {
        let (_soft, ctx) = context();
        let source = Resource::new(&ctx, "source", ResourceDesc::buffer(256), ResourceStates::COMMON).unwrap();
        source.update_buffer(&ctx, None, 0, &[9; 256]).unwrap();

        let copy = Resource::clone_from(&ctx, &source, None).unwrap();
        assert_ne!(copy.id(), source.id());
        assert_eq!(copy.capture_buffer(&ctx, None, 0, 256).unwrap(), vec![9; 256]);
    }

    #[test]
    fn test_replace_storage_keeps_identity() {
        let (_soft, ctx) = context();
        let mut buffer = Resource::new(&ctx, "dynamic", ResourceDesc::buffer(64), ResourceStates::COMMON).unwrap();
        let id = buffer.id();
        let old_storage = buffer.shared().storage_id();

        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&buffer, ResourceStates::UNORDERED_ACCESS);

        buffer.replace_storage(&ctx, ResourceDesc::buffer(4096)).unwrap();
        assert_eq!(buffer.id(), id);
        assert_ne!(buffer.shared().storage_id(), old_storage);
        assert_eq!(buffer.desc().width, 4096);

        // 旧分配仍被未提交的命令列表引用，留在 keep-alive 中
        assert_eq!(ctx.keep_alive().len(), 1);
        commands.execute().unwrap();
        ctx.keep_alive().flush();
        assert!(ctx.keep_alive().is_empty());
    }

    #[test]
    fn test_write_waits_for_readers() {
        let (_soft, ctx) = context();
        let buffer = Resource::new(&ctx, "shared", ResourceDesc::buffer(256), ResourceStates::COMMON).unwrap();

        let mut reader = ctx.compute_queue().new_commands().unwrap();
        reader.resource_state(&buffer, ResourceStates::NON_PIXEL_SHADER_RESOURCE);
        let read_value = reader.next_fence_value();

        let mut writer = ctx.direct_queue().new_commands().unwrap();
        writer.resource_state(&buffer, ResourceStates::UNORDERED_ACCESS);
        assert!(writer.pending_waits().values().contains(&read_value));
        assert_eq!(buffer.write_fence_value(), writer.next_fence_value());

        reader.execute().unwrap();
        writer.execute().unwrap();
        assert!(buffer.fence_values().complete());
    }

    #[test]
    fn test_placed_alias_barrier() {
        let (soft, ctx) = context();
        let info = ctx.device().backend().resource_allocation_info(&ResourceDesc::buffer(256));
        let range = Arc::new(ctx.static_buffer_allocator().alloc_bytes(info.size, info.alignment).unwrap());

        let first = Resource::with_range(&ctx, "first", ResourceDesc::buffer(256), ResourceStates::COMMON, range.clone())
            .unwrap();
        let second =
            Resource::with_range(&ctx, "second", ResourceDesc::buffer(128), ResourceStates::COMMON, range.clone())
                .unwrap();
        assert!(Arc::ptr_eq(first.mem_range().unwrap(), &range));

        soft.clear_log();
        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&first, ResourceStates::UNORDERED_ACCESS);
        commands.resource_state(&second, ResourceStates::UNORDERED_ACCESS);
        commands.uav_barrier(None);
        commands.execute().unwrap();

        let barriers: Vec<_> = soft.executed_lists().iter().flat_map(|l| l.barriers()).collect();
        assert!(barriers.contains(&crate::gfx::backend::ResourceBarrier::Aliasing {
            before: None,
            after: second.raw(),
        }));
        assert_eq!(range.active_resource(), Some(second.shared().storage_id()));

        drop(first);
        drop(second);
        ctx.keep_alive().drain();
        assert_eq!(range.active_resource(), None);
    }
}
