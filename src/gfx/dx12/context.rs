//! DirectX 12 设备上下文
//!
//! 负责 DXGI 工厂、适配器和 D3D12 设备的创建。设备重置时整个上下文被丢弃并重新创建。
//!
//! # 初始化流程
//!
//! 1. 启用调试层（可选）
//! 2. 创建 DXGI 工厂
//! 3. 选择第一个可用的硬件适配器
//! 4. 创建 D3D12 设备（需要 `ID3D12Device3` 以使用 `EnqueueMakeResident`）

use tracing::{debug, info, warn};
use windows::{
    core::*, Win32::Foundation::*, Win32::Graphics::Direct3D::*, Win32::Graphics::Direct3D12::*,
    Win32::Graphics::Dxgi::*, Win32::System::Threading::*,
};

use crate::core::error::{DeviceError, GpuError, Result};

/// DirectX 12 设备上下文
pub struct Dx12Context {
    pub factory: IDXGIFactory4,
    pub adapter: IDXGIAdapter3,
    pub device: ID3D12Device3,
    /// CPU 等待栅栏时复用的事件
    pub wait_event: HANDLE,
    pub supports_not_resident: bool,
}

impl Dx12Context {
    pub fn new(debug_layer: bool) -> Result<Self> {
        unsafe {
            if debug_layer {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to enable DX12 Debug Layer"),
                }
            }

            let flags = if debug_layer { DXGI_CREATE_FACTORY_DEBUG } else { DXGI_CREATE_FACTORY_FLAGS(0) };
            let factory: IDXGIFactory4 = CreateDXGIFactory2(flags)
                .map_err(|e| DeviceError::Creation(format!("CreateDXGIFactory2: {}", e)))?;

            let (adapter, device) = Self::create_device(&factory)?;

            let mut options = D3D12_FEATURE_DATA_D3D12_OPTIONS7::default();
            let supports_not_resident = device
                .CheckFeatureSupport(
                    D3D12_FEATURE_D3D12_OPTIONS7,
                    &mut options as *mut _ as *mut _,
                    std::mem::size_of::<D3D12_FEATURE_DATA_D3D12_OPTIONS7>() as u32,
                )
                .is_ok();

            let wait_event = CreateEventW(None, false, false, None)
                .map_err(|e| DeviceError::Creation(format!("CreateEventW: {}", e)))?;

            info!(supports_not_resident, "D3D12 device created");

            Ok(Self {
                factory,
                adapter,
                device,
                wait_event,
                supports_not_resident,
            })
        }
    }

    unsafe fn create_device(factory: &IDXGIFactory4) -> Result<(IDXGIAdapter3, ID3D12Device3)> {
        let mut index = 0;
        loop {
            let adapter = factory
                .EnumAdapters1(index)
                .map_err(|e| DeviceError::Creation(format!("No usable adapter: {}", e)))?;
            index += 1;

            let desc = adapter.GetDesc1().map_err(|e| GpuError::call("GetDesc1", e))?;
            if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
                continue;
            }

            let mut device: Option<ID3D12Device3> = None;
            if D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).is_err() {
                continue;
            }

            if let Some(device) = device {
                let adapter: IDXGIAdapter3 = adapter.cast().map_err(|e| GpuError::call("IDXGIAdapter3", e))?;
                let name = String::from_utf16_lossy(&desc.Description);
                info!(adapter = %name.trim_end_matches('\0'), "Using adapter");
                return Ok((adapter, device));
            }
        }
    }
}

impl Drop for Dx12Context {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.wait_event);
        }
    }
}
