//! 原生堆
//!
//! 堆的用途决定放置标志与驻留优先级。GPU 堆可以以非驻留方式创建，
//! 第一次被命令列表引用时才由驻留算法调入显存。CPU 可见的上传/读回堆始终驻留，不进入驻留列表。

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::core::error::{DeviceError, GpuError, MemoryError, Result};
use crate::gfx::backend::{HeapDesc, HeapUsage, Pageable, RawHeap};
use crate::renderer::device::Device;
use crate::renderer::device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
use crate::renderer::residency::{ResidencyHandle, ResidencyKey};

struct HeapInner {
    device: Arc<Device>,
    desc: HeapDesc,
    raw: Mutex<Option<RawHeap>>,
    residency: Option<ResidencyHandle>,
}

pub struct Heap {
    inner: Arc<HeapInner>,
    _child: DeviceChildHandle,
}

impl Heap {
    /// 创建堆，失败对设备是致命的
    pub fn new(device: &Arc<Device>, size: u64, usage: HeapUsage) -> Result<Self> {
        let create_not_resident = !usage.is_cpu_visible() && device.create_not_resident();
        let desc = HeapDesc { size, usage, create_not_resident };

        let raw = match device.backend().create_heap(&desc) {
            Ok(raw) => raw,
            Err(e) => {
                device.fatal_error(&format!("failed to create {} heap of {} bytes: {}", usage.name(), size, e));
                return Err(MemoryError::HeapCreation(e.to_string()).into());
            }
        };

        let residency = (!usage.is_cpu_visible()).then(|| {
            ResidencyHandle::new(device.residency(), Some(Pageable::Heap(raw)), size, !create_not_resident)
        });

        debug!(usage = usage.name(), size, create_not_resident, "Heap created");

        let inner = Arc::new(HeapInner {
            device: device.clone(),
            desc,
            raw: Mutex::new(Some(raw)),
            residency,
        });
        let weak = Arc::downgrade(&inner);
        let child = device.children().register(weak, ResetPriority::Heap);

        Ok(Self { inner, _child: child })
    }

    pub fn raw(&self) -> Option<RawHeap> {
        *self.inner.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> u64 {
        self.inner.desc.size
    }

    pub fn usage(&self) -> HeapUsage {
        self.inner.desc.usage
    }

    pub fn cpu_usage(&self) -> bool {
        self.inner.desc.usage.is_cpu_visible()
    }

    /// CPU 可见的堆没有驻留节点
    pub fn residency_key(&self) -> Option<ResidencyKey> {
        self.inner.residency.as_ref().map(ResidencyHandle::key)
    }

    fn require_raw(&self) -> Result<RawHeap> {
        self.raw()
            .ok_or_else(|| GpuError::Device(DeviceError::Removed("heap released for device reset".to_string())))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.cpu_usage() {
            return Err(MemoryError::NotCpuVisible.into());
        }

        self.inner.device.backend().write_heap(self.require_raw()?, offset, data)
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if !self.cpu_usage() {
            return Err(MemoryError::NotCpuVisible.into());
        }

        self.inner.device.backend().read_heap(self.require_raw()?, offset, data)
    }
}

impl DeviceChild for HeapInner {
    fn name(&self) -> String {
        format!("{} heap ({} bytes)", self.desc.usage.name(), self.desc.size)
    }

    fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
        if let Some(raw) = self.raw.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.device.backend().destroy_heap(raw);
        }

        if let Some(residency) = &self.residency {
            residency.update(None, false);
        }

        None
    }

    fn reset(&self, _data: Option<Box<dyn Any + Send>>) -> bool {
        match self.device.backend().create_heap(&self.desc) {
            Ok(raw) => {
                *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
                if let Some(residency) = &self.residency {
                    residency.update(Some(Pageable::Heap(raw)), !self.desc.create_not_resident);
                }
                true
            }
            Err(e) => {
                warn!(usage = self.desc.usage.name(), error = %e, "Failed to recreate heap");
                false
            }
        }
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.device.backend().destroy_heap(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::backend::GpuBackend;
    use crate::gfx::{SoftBackend, SoftConfig};

    #[test]
    fn test_heap_residency_node() {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());

        let upload = Heap::new(&device, 4096, HeapUsage::Upload).unwrap();
        let textures = Heap::new(&device, 65536, HeapUsage::GpuTextures).unwrap();

        assert!(upload.residency_key().is_none());
        let key = textures.residency_key().unwrap();
        assert!(!device.residency().is_resident(key));
        assert!(!soft.is_resident(Pageable::Heap(textures.raw().unwrap())));

        upload.write(16, &[9, 8, 7]).unwrap();
        let mut out = [0u8; 3];
        upload.read(16, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
        assert!(textures.write(0, &[1]).is_err());

        drop(textures);
        assert!(device.residency().is_empty());
    }

    #[test]
    fn test_heap_creation_failure_is_fatal() {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());

        assert!(Heap::new(&device, 0, HeapUsage::GpuBuffers).is_err());
        assert!(!device.is_valid());
    }

    #[test]
    fn test_heap_reset() {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());
        let heap = Heap::new(&device, 65536, HeapUsage::GpuBuffers).unwrap();
        let before = heap.raw().unwrap();

        assert!(device.children().reset_all(|| soft.recreate().is_ok()));
        let after = heap.raw().unwrap();
        assert_ne!(before, after);
        assert_eq!(soft.live_objects().1, 1);
        assert!(!device.residency().is_resident(heap.residency_key().unwrap()));
    }
}
