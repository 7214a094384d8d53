//! 渲染器模块
//!
//! 本模块是与具体图形 API 无关的资源驻留与命令提交管线，所有硬件调用都经过
//! `gfx::GpuBackend`。
//!
//! # 架构设计
//!
//! - `context`：`GraphicsContext`，持有队列、分配器和延迟销毁列表，负责帧循环和设备重置
//! - `device` / `device_child`：设备状态与按优先级重建的子对象注册表
//! - `sync`：栅栏与栅栏值
//! - `memory`：堆、环形分配器和空闲链表分配器
//! - `residency`：MRU 驻留列表与显存预算下的调入调出
//! - `state` / `tracker`：资源状态机与命令列表内的状态跟踪
//! - `resource` / `command` / `queue`：资源、命令列表和队列提交
//! - `pipeline_cache`：磁盘上的管线缓存

pub mod command;
pub mod context;
pub mod device;
pub mod device_child;
pub mod keep_alive;
pub mod memory;
pub mod pipeline_cache;
pub mod queue;
pub mod residency;
pub mod resource;
pub mod state;
pub mod sync;
pub mod tracker;

pub use command::Commands;
pub use context::GraphicsContext;
pub use device::Device;
pub use device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
pub use keep_alive::KeepAlive;
pub use memory::{Heap, MemAllocatorFreeList, MemAllocatorRing, MemRange};
pub use pipeline_cache::{PipelineCache, PipelineKey};
pub use queue::Queue;
pub use residency::{ResidencyKey, ResidencyList, ResidencyOutcome};
pub use resource::Resource;
pub use sync::{Fence, FenceValue, FenceValues};
