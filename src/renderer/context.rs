//! 图形上下文
//!
//! `GraphicsContext` 拥有一个设备上的所有子系统：三个队列、共享的驻留栅栏、六个内存分配器、
//! 延迟销毁列表、管线缓存以及当前帧的命令列表。组件都通过它取得队列和分配器。
//!
//! # 帧循环
//!
//! ```text
//! begin_frame()      释放已完成的延迟对象，刷新显存信息，取得本帧的直接队列命令
//! frame_complete()   提交本帧命令，修剪分配器；设备失效时执行重置
//! ```

use std::sync::Arc;

use super::command::Commands;
use super::device::Device;
use super::keep_alive::KeepAlive;
use super::memory::{MemAllocatorFreeList, MemAllocatorRing};
use super::pipeline_cache::PipelineCache;
use super::queue::Queue;
use super::sync::Fence;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::gfx::backend::{GpuBackend, HeapUsage, QueueKind};

pub struct GraphicsContext {
    frame_commands: Option<Commands>,
    direct: Arc<Queue>,
    copy: Arc<Queue>,
    compute: Arc<Queue>,
    upload: MemAllocatorRing,
    readback: MemAllocatorRing,
    dynamic_buffers: MemAllocatorRing,
    static_buffers: MemAllocatorFreeList,
    textures: MemAllocatorFreeList,
    targets: MemAllocatorFreeList,
    keep_alive: Arc<KeepAlive>,
    pipeline_cache: PipelineCache,
    residency_fence: Arc<Fence>,
    device: Arc<Device>,
}

impl GraphicsContext {
    pub fn new(config: Config, backend: Arc<dyn GpuBackend>) -> Result<Self> {
        let device = Device::new(config, backend);
        let config = device.config();

        let residency_fence = Arc::new(Fence::new(&device, "residency", None)?);
        let direct = Queue::new(&device, "direct", QueueKind::Direct, residency_fence.clone())?;
        let copy = Queue::new(&device, "copy", QueueKind::Copy, residency_fence.clone())?;
        let compute = Queue::new(&device, "compute", QueueKind::Compute, residency_fence.clone())?;

        let memory = &config.memory;
        let upload = MemAllocatorRing::new(&device, memory.upload_ring, HeapUsage::Upload);
        let readback = MemAllocatorRing::new(&device, memory.readback_ring, HeapUsage::Readback);
        let dynamic_buffers = MemAllocatorRing::new(&device, memory.dynamic_buffer_ring, HeapUsage::GpuBuffers);
        let static_buffers = MemAllocatorFreeList::new(
            &device,
            memory.static_buffer_initial,
            memory.static_buffer_max,
            HeapUsage::GpuBuffers,
        );
        let textures =
            MemAllocatorFreeList::new(&device, memory.texture_initial, memory.texture_max, HeapUsage::GpuTextures);
        let targets =
            MemAllocatorFreeList::new(&device, memory.target_initial, memory.target_max, HeapUsage::GpuTargets);

        let pipeline_cache = match &config.cache.pipeline_cache {
            Some(path) => PipelineCache::load(path),
            None => PipelineCache::new(),
        };

        device.refresh_memory_info();
        crate::device_info!(backend = device.backend().name(), "Graphics context created");

        Ok(Self {
            frame_commands: None,
            direct,
            copy,
            compute,
            upload,
            readback,
            dynamic_buffers,
            static_buffers,
            textures,
            targets,
            keep_alive: Arc::new(KeepAlive::new()),
            pipeline_cache,
            residency_fence,
            device,
        })
    }

    /// 开始一帧，返回本帧的直接队列命令列表
    pub fn begin_frame(&mut self) -> Result<&mut Commands> {
        let _span = crate::span_trace!("begin_frame").entered();
        self.keep_alive.flush();
        self.device.refresh_memory_info();

        let commands = match self.frame_commands.take() {
            Some(commands) if commands.is_valid() => commands,
            _ => self.direct.new_commands()?,
        };

        Ok(self.frame_commands.insert(commands))
    }

    /// 当前帧的命令列表（`begin_frame` 之后）
    pub fn frame_commands(&mut self) -> Option<&mut Commands> {
        self.frame_commands.as_mut()
    }

    /// 结束一帧；设备失效时重置，返回设备是否仍然可用
    pub fn frame_complete(&mut self) -> bool {
        let _span = crate::span_trace!("frame_complete").entered();

        if let Some(commands) = self.frame_commands.take() {
            if let Err(e) = commands.execute() {
                crate::device_warn!(error = %e, "Failed to execute frame commands");
            }
        }

        let frame = self.device.advance_frame();
        self.upload.frame_complete();
        self.readback.frame_complete();
        self.dynamic_buffers.frame_complete();
        self.static_buffers.frame_complete();
        self.textures.frame_complete();
        self.targets.frame_complete();
        self.keep_alive.flush();

        if !self.device_valid() {
            crate::device_warn!(frame, reason = ?self.device.removed_reason(), "Device lost");
            return self.reset_device(true);
        }

        true
    }

    /// 在 CPU 上等待所有队列空闲
    pub fn wait_for_idle(&self) -> Result<()> {
        let _span = crate::span_trace!("wait_for_idle").entered();
        self.direct.wait_for_idle()?;
        self.copy.wait_for_idle()?;
        self.compute.wait_for_idle()?;
        Ok(())
    }

    /// 重建设备上的所有对象
    ///
    /// 设备有效且不强制时什么也不做。失败的子对象不会中断其他对象的重建。
    pub fn reset_device(&mut self, force: bool) -> bool {
        if self.device_valid() && !force {
            return true;
        }

        let _span = crate::span_trace!("reset_device").entered();
        crate::device_warn!(reason = ?self.device.removed_reason(), force, "Resetting device");

        // 重置之前录制的命令不再提交
        if let Some(mut commands) = self.frame_commands.take() {
            drop(commands.take_data());
        }

        if let Err(e) = self.wait_for_idle() {
            crate::device_warn!(error = %e, "Wait for idle before reset failed");
        }

        let released = self.keep_alive.drain();
        let generation = self.device.advance_generation();

        let backend = self.device.backend().clone();
        let status = self.device.children().reset_all(|| match backend.recreate() {
            Ok(()) => true,
            Err(e) => {
                crate::device_error!(error = %e, "Failed to recreate device");
                false
            }
        });

        let info = self.device.refresh_memory_info();
        if status {
            self.device.clear_fatal();
            crate::device_info!(generation, released, budget = info.budget, "Device reset complete");
        } else {
            crate::device_error!(generation, "Device reset failed");
        }

        status
    }

    pub fn device_valid(&self) -> bool {
        self.device.is_valid()
    }

    /// 标记致命错误，下一次 `frame_complete` 时恢复
    pub fn device_fatal_error(&self, reason: &str) {
        self.device.fatal_error(reason);
    }

    /// 释放所有可以释放的内存并保存管线缓存
    pub fn trim_device(&self) -> Result<()> {
        self.wait_for_idle()?;
        let released = self.keep_alive.drain();
        crate::device_info!(released, "Device trimmed");
        self.save_pipeline_cache()
    }

    /// 模拟设备丢失（TDR），下一次 `frame_complete` 时恢复
    pub fn simulate_device_lost(&self) {
        self.device.fatal_error("simulated device loss");
    }

    fn save_pipeline_cache(&self) -> Result<()> {
        match &self.device.config().cache.pipeline_cache {
            Some(path) if self.pipeline_cache.is_dirty() => self.pipeline_cache.save(path),
            _ => Ok(()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn keep_alive(&self) -> &Arc<KeepAlive> {
        &self.keep_alive
    }

    pub fn residency_fence(&self) -> &Arc<Fence> {
        &self.residency_fence
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }

    pub fn queue(&self, kind: QueueKind) -> &Arc<Queue> {
        match kind {
            QueueKind::Direct => &self.direct,
            QueueKind::Copy => &self.copy,
            QueueKind::Compute => &self.compute,
        }
    }

    pub fn direct_queue(&self) -> &Arc<Queue> {
        &self.direct
    }

    pub fn copy_queue(&self) -> &Arc<Queue> {
        &self.copy
    }

    pub fn compute_queue(&self) -> &Arc<Queue> {
        &self.compute
    }

    pub fn upload_allocator(&self) -> &MemAllocatorRing {
        &self.upload
    }

    pub fn readback_allocator(&self) -> &MemAllocatorRing {
        &self.readback
    }

    pub fn dynamic_buffer_allocator(&self) -> &MemAllocatorRing {
        &self.dynamic_buffers
    }

    pub fn static_buffer_allocator(&self) -> &MemAllocatorFreeList {
        &self.static_buffers
    }

    pub fn texture_allocator(&self) -> &MemAllocatorFreeList {
        &self.textures
    }

    pub fn target_allocator(&self) -> &MemAllocatorFreeList {
        &self.targets
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Some(commands) = self.frame_commands.take() {
            if let Err(e) = commands.execute() {
                crate::device_warn!(error = %e, "Failed to execute frame commands");
            }
        }

        if let Err(e) = self.wait_for_idle() {
            crate::device_warn!(error = %e, "Wait for idle on shutdown failed");
        }

        self.keep_alive.drain();

        if let Err(e) = self.save_pipeline_cache() {
            crate::device_warn!(error = %e, "Failed to save pipeline cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::backend::{Pageable, ResourceBarrier, ResourceDesc, ResourceStates};
    use crate::gfx::{SoftBackend, SoftConfig};
    use crate::renderer::device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
    use crate::renderer::pipeline_cache::PipelineKey;
    use crate::renderer::resource::Resource;
    use std::any::Any;
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    fn context_with_budget(budget: u64) -> (Arc<SoftBackend>, GraphicsContext) {
        let soft = Arc::new(SoftBackend::new(SoftConfig { budget, supports_not_resident: true }));
        let ctx = GraphicsContext::new(Config::default(), soft.clone()).unwrap();
        (soft, ctx)
    }

    #[test]
    fn test_scenario_a_lru_eviction() {
        let (soft, ctx) = context_with_budget(3 * MIB);
        let first = Resource::committed(&ctx, "first", ResourceDesc::buffer(2 * MIB), ResourceStates::COMMON).unwrap();
        let second =
            Resource::committed(&ctx, "second", ResourceDesc::buffer(2 * MIB), ResourceStates::COMMON).unwrap();

        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&first, ResourceStates::UNORDERED_ACCESS);
        commands.resource_state(&second, ResourceStates::UNORDERED_ACCESS);
        commands.execute().unwrap();

        let first_raw = Pageable::Resource(first.raw().unwrap());
        let second_raw = Pageable::Resource(second.raw().unwrap());
        assert!(soft.is_resident(first_raw));
        assert!(soft.is_resident(second_raw));

        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&second, ResourceStates::NON_PIXEL_SHADER_RESOURCE);
        commands.execute().unwrap();

        assert!(!soft.is_resident(first_raw));
        assert!(soft.is_resident(second_raw));
        assert!(!ctx.device().residency().is_resident(first.residency_key().unwrap()));
        assert_eq!(soft.stats().residency_violations, 0);

        // 再次使用时重新调入，驱逐 second
        let mut commands = ctx.direct_queue().new_commands().unwrap();
        commands.resource_state(&first, ResourceStates::COPY_SOURCE);
        commands.execute().unwrap();
        assert!(soft.is_resident(first_raw));
        assert!(!soft.is_resident(second_raw));
    }

    #[test]
    fn test_scenario_b_barrier_between_lists() {
        let (soft, ctx) = context_with_budget(256 * MIB);
        let buffer = Resource::new(&ctx, "buffer", ResourceDesc::buffer(4096), ResourceStates::COMMON).unwrap();
        let raw = buffer.raw().unwrap();

        let mut first = ctx.direct_queue().new_commands().unwrap();
        first.resource_state(&buffer, ResourceStates::COPY_DEST);
        let mut second = ctx.direct_queue().new_commands().unwrap();
        second.resource_state(&buffer, ResourceStates::PIXEL_SHADER_RESOURCE);

        soft.clear_log();
        ctx.direct_queue().execute(&mut [first, second]).unwrap();

        let lists = soft.executed_lists();
        let barriers: Vec<ResourceBarrier> = lists.iter().flat_map(|l| l.barriers()).collect();
        assert_eq!(
            barriers,
            vec![ResourceBarrier::Transition {
                resource: raw,
                subresource: None,
                before: ResourceStates::COPY_DEST,
                after: ResourceStates::PIXEL_SHADER_RESOURCE,
            }]
        );

        // 前置列表位于两个列表之间
        assert_eq!(lists.len(), 3);
        assert!(lists[0].barriers().is_empty());
        assert_eq!(lists[1].barriers().len(), 1);
        assert!(lists[2].barriers().is_empty());

        // 缓冲区在执行结束后衰减
        assert_eq!(buffer.state(0), ResourceStates::COMMON);
    }

    struct Recorder {
        id: usize,
        priority: ResetPriority,
        log: Arc<Mutex<Vec<(bool, ResetPriority, usize)>>>,
    }

    impl DeviceChild for Recorder {
        fn name(&self) -> String {
            format!("recorder {}", self.id)
        }

        fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
            self.log.lock().unwrap().push((false, self.priority, self.id));
            Some(Box::new(self.id))
        }

        fn reset(&self, data: Option<Box<dyn Any + Send>>) -> bool {
            assert_eq!(data.and_then(|d| d.downcast::<usize>().ok()).map(|d| *d), Some(self.id));
            self.log.lock().unwrap().push((true, self.priority, self.id));
            true
        }
    }

    #[test]
    fn test_scenario_c_device_reset_order() {
        let (soft, mut ctx) = context_with_budget(256 * MIB);
        let buffer = Resource::new(&ctx, "buffer", ResourceDesc::buffer(256), ResourceStates::COMMON).unwrap();
        buffer.update_buffer(&ctx, None, 0, &[5; 256]).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let priorities = [
            ResetPriority::Normal,
            ResetPriority::Fence,
            ResetPriority::TargetWindow,
            ResetPriority::Resource,
            ResetPriority::Heap,
            ResetPriority::Commands,
        ];
        let recorders: Vec<Arc<Recorder>> = priorities
            .iter()
            .enumerate()
            .map(|(id, &priority)| {
                Arc::new(Recorder { id, priority, log: log.clone() })
            })
            .collect();
        let _handles: Vec<DeviceChildHandle> = recorders
            .iter()
            .map(|recorder| {
                let weak = Arc::downgrade(recorder);
                ctx.device().children().register(weak, recorder.priority)
            })
            .collect();

        soft.simulate_device_removed("TDR");
        assert!(!ctx.device_valid());
        assert!(ctx.frame_complete());
        assert!(ctx.device_valid());
        assert_eq!(soft.stats().device_recreations, 1);

        let log = log.lock().unwrap().clone();
        let before: Vec<ResetPriority> = log.iter().filter(|(reset, ..)| !reset).map(|(_, p, _)| *p).collect();
        let reset: Vec<ResetPriority> = log.iter().filter(|(reset, ..)| *reset).map(|(_, p, _)| *p).collect();

        assert_eq!(before.len(), recorders.len());
        assert_eq!(reset.len(), recorders.len());
        assert!(before.windows(2).all(|w| w[0] >= w[1]));
        assert!(reset.windows(2).all(|w| w[0] <= w[1]));
        let last_before = log.iter().rposition(|(reset, ..)| !reset).unwrap();
        let first_reset = log.iter().position(|(reset, ..)| *reset).unwrap();
        assert!(last_before < first_reset);

        // 资源在新设备上重建，内容需要重新上传
        assert!(buffer.raw().is_some());
        assert_eq!(buffer.state(0), ResourceStates::COMMON);
        buffer.update_buffer(&ctx, None, 0, &[6; 256]).unwrap();
        assert_eq!(buffer.capture_buffer(&ctx, None, 0, 256).unwrap(), vec![6; 256]);
    }

    #[test]
    fn test_frame_loop() {
        let (soft, mut ctx) = context_with_budget(256 * MIB);
        let buffer = Resource::new(&ctx, "buffer", ResourceDesc::buffer(1024), ResourceStates::COMMON).unwrap();

        for frame in 0..3u8 {
            let done = ctx.begin_frame().unwrap().next_fence_value();
            let upload = ctx.upload_allocator().alloc_buffer(1024, &done).unwrap();
            upload.cpu_write(0, &[frame; 1024]).unwrap();

            ctx.frame_commands().unwrap().update_buffer(&buffer, 0, &upload, 1024);
            assert!(ctx.frame_complete());
        }

        assert_eq!(ctx.device().frame_count(), 3);
        assert_eq!(buffer.capture_buffer(&ctx, None, 0, 1024).unwrap(), vec![2; 1024]);
        assert_eq!(soft.stats().residency_violations, 0);
    }

    #[test]
    fn test_simulated_loss_recovers() {
        let (soft, mut ctx) = context_with_budget(256 * MIB);
        ctx.simulate_device_lost();
        assert!(!ctx.device_valid());
        assert!(ctx.frame_complete());
        assert!(ctx.device_valid());
        assert_eq!(soft.stats().device_recreations, 1);

        // 设备有效时不强制就不重置
        assert!(ctx.reset_device(false));
        assert_eq!(soft.stats().device_recreations, 1);
    }

    #[test]
    fn test_pipeline_cache_persisted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipelines.bin");
        let mut config = Config::default();
        config.cache.pipeline_cache = Some(path.to_string_lossy().into_owned());

        {
            let ctx = GraphicsContext::new(config.clone(), Arc::new(SoftBackend::new(SoftConfig::default()))).unwrap();
            ctx.pipeline_cache().insert(PipelineKey::new(b"desc", b"root"), vec![1, 2, 3]);
        }

        let ctx = GraphicsContext::new(config, Arc::new(SoftBackend::new(SoftConfig::default()))).unwrap();
        assert_eq!(ctx.pipeline_cache().get(&PipelineKey::new(b"desc", b"root")), Some(vec![1, 2, 3]));
    }
}
