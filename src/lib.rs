//! DistGpu - GPU 资源驻留与命令提交
//!
//! 本库在 DirectX 12 之上管理资源的同步状态、显存驻留、堆内存分配和设备重置。
//! 没有 Windows 时使用确定性的软件后端，测试也运行在软件后端上。
//!
//! # 模块结构
//!
//! - `core`: 核心功能模块（日志、配置、错误处理）
//! - `gfx`: 图形后端抽象层（软件设备与 DirectX 12）
//! - `renderer`: 驻留与提交管线
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use dist_gpu::core::Config;
//! use dist_gpu::gfx::{SoftBackend, SoftConfig};
//! use dist_gpu::gfx::backend::{ResourceDesc, ResourceStates};
//! use dist_gpu::renderer::{GraphicsContext, Resource};
//!
//! let backend = Arc::new(SoftBackend::new(SoftConfig::default()));
//! let ctx = GraphicsContext::new(Config::default(), backend)?;
//! let buffer = Resource::new(&ctx, "vertices", ResourceDesc::buffer(1024), ResourceStates::COMMON)?;
//! buffer.update_buffer(&ctx, None, 0, &[0u8; 1024])?;
//! # Ok::<(), dist_gpu::core::GpuError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
