//! 图形后端模块
//!
//! 本模块封装了硬件访问层：
//! - `backend`：核心依赖的 `GpuBackend` trait 与原生句柄、描述类型
//! - `soft`：确定性的软件设备，用于测试与非 Windows 平台
//! - `dx12`：基于 `windows` crate 的 DirectX 12 实现（仅 Windows）

pub mod backend;
pub mod soft;
#[cfg(target_os = "windows")]
pub mod dx12;

use std::sync::Arc;

pub use backend::GpuBackend;
pub use soft::{SoftBackend, SoftConfig};
#[cfg(target_os = "windows")]
pub use dx12::Dx12Backend;

use crate::core::config::{BackendKind, Config};
use crate::core::error::{ConfigError, Result};

/// 按配置创建后端
pub fn create_backend(config: &Config) -> Result<Arc<dyn GpuBackend>> {
    match config.device.backend {
        BackendKind::Soft => Ok(Arc::new(SoftBackend::new(SoftConfig {
            budget: config.device.soft_budget,
            supports_not_resident: true,
        }))),
        #[cfg(target_os = "windows")]
        BackendKind::Dx12 => Ok(Arc::new(Dx12Backend::new(config.device.debug_layer)?)),
        #[cfg(not(target_os = "windows"))]
        BackendKind::Dx12 => Err(ConfigError::InvalidValue {
            field: "device.backend".to_string(),
            reason: "DirectX 12 is only available on Windows".to_string(),
        }
        .into()),
    }
}
