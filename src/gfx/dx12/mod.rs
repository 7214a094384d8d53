//! DirectX 12 后端（仅 Windows）
//!
//! - `context`：工厂、适配器与设备的创建
//! - `backend`：以句柄表实现 `GpuBackend`

pub mod backend;
pub mod context;

pub use backend::Dx12Backend;
pub use context::Dx12Context;
