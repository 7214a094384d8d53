//! 图形后端的统一抽象接口
//!
//! 驻留与提交核心只通过 `GpuBackend` 访问硬件。这个 trait 暴露的正好是核心需要的原生调用：
//! 栅栏、队列、堆、资源、驻留、命令录制以及设备移除查询。
//!
//! 所有原生对象都以不透明的句柄表示，句柄可以自由复制；设备重建（`recreate`）之后，
//! 之前发出的所有句柄都失效，持有者必须在 `reset` 阶段重新创建。

use bitflags::bitflags;
use std::fmt;
use std::time::Duration;

use crate::core::error::Result;

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

raw_handle! {
    /// 原生栅栏
    RawFence,
    /// 原生命令队列
    RawQueue,
    /// 原生堆
    RawHeap,
    /// 原生资源
    RawResource,
    /// 原生命令分配器
    RawCommandAllocator,
    /// 原生命令列表
    RawCommandList,
}

/// 队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Copy,
    Compute,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Direct => "direct",
            QueueKind::Copy => "copy",
            QueueKind::Compute => "compute",
        }
    }
}

/// 堆用途，决定放置标志与驻留优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapUsage {
    Upload,
    Readback,
    GpuBuffers,
    GpuTextures,
    GpuTargets,
}

/// 驻留优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResidencyPriority {
    Low,
    Normal,
    High,
}

impl HeapUsage {
    pub fn residency_priority(&self) -> ResidencyPriority {
        match self {
            HeapUsage::Upload | HeapUsage::Readback => ResidencyPriority::Low,
            HeapUsage::GpuBuffers | HeapUsage::GpuTextures => ResidencyPriority::Normal,
            HeapUsage::GpuTargets => ResidencyPriority::High,
        }
    }

    /// 上传与读回堆可以被 CPU 映射
    pub fn is_cpu_visible(&self) -> bool {
        matches!(self, HeapUsage::Upload | HeapUsage::Readback)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HeapUsage::Upload => "upload",
            HeapUsage::Readback => "readback",
            HeapUsage::GpuBuffers => "gpu_buffers",
            HeapUsage::GpuTextures => "gpu_textures",
            HeapUsage::GpuTargets => "gpu_targets",
        }
    }
}

/// 堆描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDesc {
    pub size: u64,
    pub usage: HeapUsage,
    pub create_not_resident: bool,
}

/// 可以进行驻留操作的对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pageable {
    Heap(RawHeap),
    Resource(RawResource),
}

/// 显存预算信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMemoryInfo {
    pub budget: u64,
    pub current_usage: u64,
}

impl VideoMemoryInfo {
    pub fn available(&self) -> u64 {
        self.budget.saturating_sub(self.current_usage)
    }
}

bitflags! {
    /// D3D12 资源状态位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStates: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

impl ResourceStates {
    /// 空集合即 COMMON
    pub const COMMON: ResourceStates = ResourceStates::empty();

    /// PREDICATION 与 INDIRECT_ARGUMENT 共用同一位
    pub const PREDICATION: ResourceStates = ResourceStates::INDIRECT_ARGUMENT;

    pub const WRITE_STATES: ResourceStates = ResourceStates::RENDER_TARGET
        .union(ResourceStates::UNORDERED_ACCESS)
        .union(ResourceStates::DEPTH_WRITE)
        .union(ResourceStates::STREAM_OUT)
        .union(ResourceStates::COPY_DEST)
        .union(ResourceStates::RESOLVE_DEST);

    pub fn is_write(&self) -> bool {
        self.intersects(Self::WRITE_STATES)
    }
}

/// 资源维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture2d,
}

/// 资源描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    /// 缓冲区的字节数，或纹理宽度（像素）
    pub width: u64,
    pub height: u32,
    pub array_size: u16,
    pub mip_levels: u16,
    pub bytes_per_pixel: u32,
    pub simultaneous_access: bool,
    pub render_target: bool,
    pub unordered_access: bool,
}

/// 纹理子资源在线性内存中的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureFootprint {
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
    pub bytes_per_pixel: u32,
}

/// 行间距对齐（D3D12_TEXTURE_DATA_PITCH_ALIGNMENT）
pub const TEXTURE_PITCH_ALIGNMENT: u64 = 256;
/// 子资源起点对齐（D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT）
pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 512;
/// 默认放置对齐（D3D12_DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT）
pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

impl TextureFootprint {
    /// 紧凑行的字节数
    pub fn row_bytes(&self) -> u64 {
        self.width as u64 * self.bytes_per_pixel as u64
    }

    pub fn size(&self) -> u64 {
        self.row_pitch as u64 * self.height as u64
    }
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            bytes_per_pixel: 1,
            simultaneous_access: false,
            render_target: false,
            unordered_access: false,
        }
    }

    pub fn texture_2d(width: u32, height: u32, bytes_per_pixel: u32, array_size: u16, mip_levels: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2d,
            width: width as u64,
            height,
            array_size: array_size.max(1),
            mip_levels: mip_levels.max(1),
            bytes_per_pixel,
            simultaneous_access: false,
            render_target: false,
            unordered_access: false,
        }
    }

    pub fn with_render_target(mut self) -> Self {
        self.render_target = true;
        self
    }

    pub fn with_simultaneous_access(mut self) -> Self {
        self.simultaneous_access = true;
        self
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn sub_resource_count(&self) -> usize {
        self.array_size as usize * self.mip_levels as usize
    }

    /// 子资源索引，mip 变化最快
    pub fn sub_resource_index(&self, array: usize, mip: usize) -> usize {
        array * self.mip_levels as usize + mip
    }

    /// 子资源在线性拷贝布局中的偏移与形状
    pub fn footprint(&self, sub_index: usize) -> (u64, TextureFootprint) {
        let mips = self.mip_levels as usize;
        let mut offset = 0;
        for i in 0..sub_index {
            offset = align_up(offset, TEXTURE_PLACEMENT_ALIGNMENT) + self.mip_footprint(i % mips).size();
        }

        (align_up(offset, TEXTURE_PLACEMENT_ALIGNMENT), self.mip_footprint(sub_index % mips))
    }

    /// 所有子资源按拷贝布局排列后的总字节数
    pub fn footprint_total_size(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer => self.width,
            ResourceDimension::Texture2d => {
                let last = self.sub_resource_count() - 1;
                let (offset, footprint) = self.footprint(last);
                offset + footprint.size()
            }
        }
    }

    fn mip_footprint(&self, mip: usize) -> TextureFootprint {
        let width = ((self.width as u32) >> mip).max(1);
        let height = (self.height >> mip).max(1);
        let row_bytes = width as u64 * self.bytes_per_pixel as u64;

        TextureFootprint {
            width,
            height,
            row_pitch: align_up(row_bytes, TEXTURE_PITCH_ALIGNMENT) as u32,
            bytes_per_pixel: self.bytes_per_pixel,
        }
    }
}

/// 资源需要的大小与对齐
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

/// 缓冲区拷贝的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLocation {
    /// CPU 可见堆中的原始字节
    Heap { heap: RawHeap, offset: u64 },
    Resource { resource: RawResource, offset: u64 },
}

/// 纹理拷贝的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureLocation {
    Subresource { resource: RawResource, index: u32 },
    Footprint { heap: RawHeap, offset: u64, footprint: TextureFootprint },
}

/// 资源屏障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBarrier {
    Transition {
        resource: RawResource,
        /// `None` 表示所有子资源
        subresource: Option<u32>,
        before: ResourceStates,
        after: ResourceStates,
    },
    Uav {
        resource: Option<RawResource>,
    },
    Aliasing {
        before: Option<RawResource>,
        after: Option<RawResource>,
    },
}

/// 录制到命令列表中的命令
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    Barriers(Vec<ResourceBarrier>),
    CopyBuffer { dst: BufferLocation, src: BufferLocation, size: u64 },
    CopyTexture { dst: TextureLocation, src: TextureLocation },
    BeginEvent(String),
    EndEvent,
}

impl fmt::Display for Pageable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pageable::Heap(h) => write!(f, "heap#{}", h.0),
            Pageable::Resource(r) => write!(f, "resource#{}", r.0),
        }
    }
}

/// 硬件抽象接口
///
/// 实现必须是线程安全的：后台线程会重置命令分配器，录制线程和提交线程可能不同。
pub trait GpuBackend: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &str;

    // 栅栏

    fn create_fence(&self, initial_value: u64) -> Result<RawFence>;
    fn destroy_fence(&self, fence: RawFence);
    /// 设备移除后返回 `u64::MAX`
    fn fence_completed_value(&self, fence: RawFence) -> u64;
    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()>;
    /// 阻塞直到所有栅栏都到达对应的值；超时返回 `Ok(false)`
    fn wait_fences(&self, fences: &[(RawFence, u64)], timeout: Option<Duration>) -> Result<bool>;

    // 队列

    fn create_queue(&self, kind: QueueKind) -> Result<RawQueue>;
    fn destroy_queue(&self, queue: RawQueue);
    fn queue_signal(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()>;
    fn queue_wait(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<()>;
    fn execute_command_lists(&self, queue: RawQueue, lists: &[RawCommandList]) -> Result<()>;

    // 堆

    fn create_heap(&self, desc: &HeapDesc) -> Result<RawHeap>;
    fn destroy_heap(&self, heap: RawHeap);
    fn write_heap(&self, heap: RawHeap, offset: u64, data: &[u8]) -> Result<()>;
    fn read_heap(&self, heap: RawHeap, offset: u64, data: &mut [u8]) -> Result<()>;

    // 资源

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo;
    fn create_placed_resource(
        &self,
        heap: RawHeap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<RawResource>;
    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        create_not_resident: bool,
    ) -> Result<RawResource>;
    fn destroy_resource(&self, resource: RawResource);

    // 驻留

    fn supports_create_not_resident(&self) -> bool;
    fn video_memory_info(&self) -> VideoMemoryInfo;
    /// 异步驻留，完成时把 `fence` 设为 `value`
    fn enqueue_make_resident(&self, objects: &[Pageable], fence: RawFence, value: u64) -> Result<()>;
    fn evict(&self, objects: &[Pageable]) -> Result<()>;

    // 命令录制

    fn create_command_allocator(&self, kind: QueueKind) -> Result<RawCommandAllocator>;
    fn reset_command_allocator(&self, allocator: RawCommandAllocator) -> Result<()>;
    fn destroy_command_allocator(&self, allocator: RawCommandAllocator);
    /// 新建的命令列表处于打开状态
    fn create_command_list(&self, kind: QueueKind, allocator: RawCommandAllocator) -> Result<RawCommandList>;
    fn reset_command_list(&self, list: RawCommandList, allocator: RawCommandAllocator) -> Result<()>;
    fn close_command_list(&self, list: RawCommandList) -> Result<()>;
    fn destroy_command_list(&self, list: RawCommandList);
    fn record(&self, list: RawCommandList, command: &GpuCommand) -> Result<()>;

    // 设备

    fn device_removed_reason(&self) -> Option<String>;
    /// 重建设备、适配器与工厂；之前的所有句柄失效
    fn recreate(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_usage_priority() {
        assert_eq!(HeapUsage::Upload.residency_priority(), ResidencyPriority::Low);
        assert_eq!(HeapUsage::GpuTextures.residency_priority(), ResidencyPriority::Normal);
        assert_eq!(HeapUsage::GpuTargets.residency_priority(), ResidencyPriority::High);
        assert!(HeapUsage::Readback.is_cpu_visible());
        assert!(!HeapUsage::GpuBuffers.is_cpu_visible());
    }

    #[test]
    fn test_write_states() {
        assert!(ResourceStates::COPY_DEST.is_write());
        assert!(!ResourceStates::GENERIC_READ.is_write());
        assert!(!ResourceStates::COMMON.is_write());
    }

    #[test]
    fn test_texture_footprint() {
        let desc = ResourceDesc::texture_2d(100, 10, 4, 2, 2);
        assert_eq!(desc.sub_resource_count(), 4);

        let (offset0, fp0) = desc.footprint(0);
        assert_eq!(offset0, 0);
        assert_eq!(fp0.row_pitch, 512);
        assert_eq!(fp0.size(), 5120);

        let (offset1, fp1) = desc.footprint(1);
        assert_eq!(offset1, 5120);
        assert_eq!((fp1.width, fp1.height), (50, 5));
        assert_eq!(fp1.row_pitch, 256);

        let (offset2, _) = desc.footprint(2);
        assert_eq!(offset2, align_up(5120 + 256 * 5, TEXTURE_PLACEMENT_ALIGNMENT));
        assert_eq!(desc.sub_resource_index(1, 0), 2);
    }
}
