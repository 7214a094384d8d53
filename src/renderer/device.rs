//! 设备
//!
//! `Device` 持有后端、配置以及所有跨对象共享的注册表：栅栏槽位表、设备子对象注册表和驻留列表。
//! 所有 GPU 对象都以 `Arc<Device>` 引用设备，设备本身不反向引用它们。
//!
//! 致命错误（创建失败、执行失败、设备移除）不会立即恢复，只在这里打上标记，
//! 由上下文在下一帧开始时统一重置。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::device_child::DeviceChildren;
use super::residency::ResidencyList;
use super::sync::FenceRegistry;
use crate::core::config::Config;
use crate::gfx::backend::{GpuBackend, VideoMemoryInfo};

pub struct Device {
    backend: Arc<dyn GpuBackend>,
    config: Config,
    fences: Arc<FenceRegistry>,
    children: Arc<DeviceChildren>,
    residency: Arc<ResidencyList>,
    fatal: Mutex<Option<String>>,
    frame_count: AtomicU64,
    generation: AtomicU64,
    supports_not_resident: bool,
}

impl Device {
    pub fn new(config: Config, backend: Arc<dyn GpuBackend>) -> Arc<Self> {
        let supports_not_resident = backend.supports_create_not_resident();
        let residency = ResidencyList::new(backend.clone());
        crate::device_info!(
            backend = backend.name(),
            supports_not_resident,
            "Device created"
        );

        Arc::new(Self {
            backend,
            config,
            fences: FenceRegistry::new(),
            children: DeviceChildren::new(),
            residency,
            fatal: Mutex::new(None),
            frame_count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            supports_not_resident,
        })
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fences(&self) -> &Arc<FenceRegistry> {
        &self.fences
    }

    pub fn children(&self) -> &Arc<DeviceChildren> {
        &self.children
    }

    pub fn residency(&self) -> &Arc<ResidencyList> {
        &self.residency
    }

    /// 标记设备进入致命错误状态，只记录第一次的原因
    pub fn fatal_error(&self, reason: &str) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            crate::device_error!(reason, "Device fatal error");
            *fatal = Some(reason.to_string());
        }
    }

    pub(crate) fn clear_fatal(&self) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 设备不可用的原因：致命错误标记或底层设备移除
    pub fn removed_reason(&self) -> Option<String> {
        let fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone();
        fatal.or_else(|| self.backend.device_removed_reason())
    }

    pub fn is_valid(&self) -> bool {
        self.removed_reason().is_none()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    pub(crate) fn advance_frame(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 每次设备重置加一，重置之前录制的命令全部作废
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// GPU 堆与提交资源是否以非驻留方式创建
    pub fn create_not_resident(&self) -> bool {
        self.config.residency.create_heaps_not_resident && self.supports_not_resident
    }

    pub fn memory_info(&self) -> VideoMemoryInfo {
        self.residency.memory_info()
    }

    pub fn refresh_memory_info(&self) -> VideoMemoryInfo {
        self.residency.refresh_memory_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{SoftBackend, SoftConfig};

    #[test]
    fn test_fatal_error_keeps_first_reason() {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());
        assert!(device.is_valid());

        device.fatal_error("first");
        device.fatal_error("second");
        assert_eq!(device.removed_reason().as_deref(), Some("first"));
        assert!(!device.is_valid());

        device.clear_fatal();
        assert!(device.is_valid());

        soft.simulate_device_removed("hung");
        assert!(!device.is_valid());
    }

    #[test]
    fn test_counters() {
        let device = Device::new(Config::default(), Arc::new(SoftBackend::new(SoftConfig::default())));
        assert_eq!(device.advance_frame(), 1);
        assert_eq!(device.frame_count(), 1);
        assert_eq!(device.generation(), 0);
        assert_eq!(device.advance_generation(), 1);
        assert!(device.create_not_resident());
    }
}
