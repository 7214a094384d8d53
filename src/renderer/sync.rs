//! GPU 同步原语
//!
//! 栅栏存放在 `FenceRegistry` 槽位表中。`FenceValue` 只记录 (槽位, 代数, 值)，
//! 栅栏销毁后槽位代数递增，旧的 `FenceValue` 一律视为已完成，不会悬空。
//!
//! # 类型
//!
//! - `Fence`：单调递增的计数器，可以属于某个队列，也可以只在 CPU 上使用
//! - `FenceValue`：栅栏时间线上的一个点，默认值表示"没有依赖"，永远完成
//! - `FenceValues`：一组时间线点，每个栅栏只保留最大的值

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, warn};

use super::device::Device;
use super::device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
use super::queue::Queue;
use crate::core::error::{DeviceError, GpuError, Result};
use crate::gfx::backend::{GpuBackend, RawFence};

/// 栅栏在槽位表中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceKey {
    index: u32,
    generation: u32,
}

pub(crate) struct FenceCore {
    name: String,
    queue: Option<u64>,
    backend: Arc<dyn GpuBackend>,
    raw: Mutex<Option<RawFence>>,
    completed: AtomicU64,
    next_value: AtomicU64,
}

impl FenceCore {
    fn raw(&self) -> Option<RawFence> {
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 从硬件刷新已完成的值
    ///
    /// 设备移除后硬件返回 `u64::MAX`，这里截断到已经发出的最大值。
    fn refresh(&self) -> u64 {
        if let Some(raw) = self.raw() {
            let issued = self.next_value.load(Ordering::Acquire).saturating_sub(1);
            let hardware = self.backend.fence_completed_value(raw).min(issued);
            self.completed.fetch_max(hardware, Ordering::AcqRel);
        }

        self.completed.load(Ordering::Acquire)
    }

    fn complete(&self, value: u64) -> bool {
        value <= self.completed.load(Ordering::Acquire) || value <= self.refresh()
    }

    fn signal_value(&self, value: u64, queue: Option<&Queue>) {
        if self.complete(value) {
            return;
        }

        self.next_value.fetch_max(value + 1, Ordering::AcqRel);
        let Some(raw) = self.raw() else { return };

        let result = match queue {
            Some(queue) => match queue.raw() {
                Some(raw_queue) => self.backend.queue_signal(raw_queue, raw, value),
                None => Ok(()),
            },
            None => self.backend.signal_fence(raw, value),
        };

        if let Err(e) = result {
            warn!(fence = %self.name, value, error = %e, "Fence signal failed");
        }
    }

    fn check_issued(&self, value: u64) -> Result<()> {
        if value >= self.next_value.load(Ordering::Acquire) {
            return Err(DeviceError::WaitNeverCompletes(format!(
                "{} value {} was never signaled",
                self.name, value
            ))
            .into());
        }

        Ok(())
    }

    fn wait_value(&self, value: u64, queue: Option<&Queue>) -> Result<()> {
        if self.complete(value) {
            return Ok(());
        }

        let Some(raw) = self.raw() else { return Ok(()) };

        match queue {
            Some(queue) if Some(queue.id()) == self.queue => Ok(()),
            Some(queue) => match queue.raw() {
                Some(raw_queue) => self.backend.queue_wait(raw_queue, raw, value),
                None => Ok(()),
            },
            None => {
                self.check_issued(value)?;
                let start = Instant::now();
                self.backend.wait_fences(&[(raw, value)], None)?;
                self.refresh();
                debug!(
                    fence = %self.name,
                    value,
                    stall_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "CPU waited on fence"
                );
                Ok(())
            }
        }
    }

    fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        if self.complete(value) {
            return true;
        }

        let Some(raw) = self.raw() else { return true };
        match self.backend.wait_fences(&[(raw, value)], Some(timeout)) {
            Ok(_) => self.complete(value),
            Err(e) => {
                warn!(fence = %self.name, value, error = %e, "Bounded fence wait failed");
                false
            }
        }
    }
}

impl DeviceChild for FenceCore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn before_reset(&self) -> Option<Box<dyn std::any::Any + Send>> {
        self.refresh();
        let mut raw = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = raw.take() {
            self.backend.destroy_fence(old);
        }
        None
    }

    fn reset(&self, _data: Option<Box<dyn std::any::Any + Send>>) -> bool {
        let completed = self.completed.load(Ordering::Acquire);
        self.next_value.fetch_max(completed + 1, Ordering::AcqRel);

        match self.backend.create_fence(completed) {
            Ok(fence) => {
                *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(fence);
                true
            }
            Err(e) => {
                warn!(fence = %self.name, error = %e, "Failed to recreate fence");
                false
            }
        }
    }
}

struct FenceSlot {
    generation: u32,
    core: Option<Arc<FenceCore>>,
}

#[derive(Default)]
struct FenceSlots {
    slots: Vec<FenceSlot>,
    free: Vec<u32>,
}

/// 栅栏槽位表
#[derive(Default)]
pub struct FenceRegistry {
    slots: Mutex<FenceSlots>,
}

impl FenceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, FenceSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, core: Arc<FenceCore>) -> FenceKey {
        let mut slots = self.slots();
        match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.slots[index as usize];
                slot.core = Some(core);
                FenceKey { index, generation: slot.generation }
            }
            None => {
                slots.slots.push(FenceSlot { generation: 0, core: Some(core) });
                FenceKey { index: (slots.slots.len() - 1) as u32, generation: 0 }
            }
        }
    }

    fn remove(&self, key: FenceKey) {
        let mut slots = self.slots();
        if let Some(slot) = slots.slots.get_mut(key.index as usize) {
            if slot.generation == key.generation && slot.core.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                slots.free.push(key.index);
            }
        }
    }

    pub(crate) fn get(&self, key: FenceKey) -> Option<Arc<FenceCore>> {
        let slots = self.slots();
        let slot = slots.slots.get(key.index as usize)?;
        if slot.generation == key.generation {
            slot.core.clone()
        } else {
            None
        }
    }

    /// 存活的栅栏数量
    pub fn len(&self) -> usize {
        self.slots().slots.iter().filter(|s| s.core.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// GPU/CPU 栅栏
pub struct Fence {
    registry: Arc<FenceRegistry>,
    key: FenceKey,
    core: Arc<FenceCore>,
    _child: DeviceChildHandle,
}

impl Fence {
    /// 创建栅栏
    ///
    /// 创建失败对设备是致命的。
    pub fn new(device: &Device, name: impl Into<String>, queue: Option<&Queue>) -> Result<Self> {
        Self::with_queue_id(device, name, queue.map(Queue::id))
    }

    /// 队列构造期间使用，此时还没有 `&Queue`
    pub(crate) fn with_queue_id(device: &Device, name: impl Into<String>, queue: Option<u64>) -> Result<Self> {
        let name = name.into();
        let raw = match device.backend().create_fence(0) {
            Ok(raw) => raw,
            Err(e) => {
                device.fatal_error(&format!("failed to create fence {}: {}", name, e));
                return Err(e);
            }
        };

        let core = Arc::new(FenceCore {
            name,
            queue,
            backend: device.backend().clone(),
            raw: Mutex::new(Some(raw)),
            completed: AtomicU64::new(0),
            next_value: AtomicU64::new(1),
        });

        let registry = device.fences().clone();
        let key = registry.insert(core.clone());
        let weak = Arc::downgrade(&core);
        let child = device.children().register(weak, ResetPriority::Fence);

        Ok(Self { registry, key, core, _child: child })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn key(&self) -> FenceKey {
        self.key
    }

    pub(crate) fn raw(&self) -> Option<RawFence> {
        self.core.raw()
    }

    pub(crate) fn value(&self, value: u64) -> FenceValue {
        FenceValue {
            fence: Some(FenceRef { registry: self.registry.clone(), key: self.key }),
            value,
        }
    }

    /// 下一次发出信号时使用的值，不占用它
    pub fn next_value(&self) -> FenceValue {
        self.value(self.core.next_value.load(Ordering::Acquire))
    }

    /// 占用下一个值但不发出信号，由驱动调用负责发出
    pub fn signal_later(&self) -> FenceValue {
        self.value(self.core.next_value.fetch_add(1, Ordering::AcqRel))
    }

    /// 发出下一个值；给定队列时在该队列已提交的工作之后发出
    pub fn signal(&self, queue: Option<&Queue>) -> FenceValue {
        let value = self.signal_later();
        self.core.signal_value(value.value, queue);
        value
    }

    pub fn complete(&self, value: u64) -> bool {
        self.core.complete(value)
    }

    pub fn completed_value(&self) -> u64 {
        self.core.refresh()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.registry.remove(self.key);
        if let Some(raw) = self.core.raw.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.core.backend.destroy_fence(raw);
        }
    }
}

#[derive(Clone)]
struct FenceRef {
    registry: Arc<FenceRegistry>,
    key: FenceKey,
}

/// 栅栏时间线上的一个点
#[derive(Clone, Default)]
pub struct FenceValue {
    fence: Option<FenceRef>,
    value: u64,
}

impl fmt::Debug for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fence {
            Some(fence) => write!(f, "FenceValue({}:{} = {})", fence.key.index, fence.key.generation, self.value),
            None => write!(f, "FenceValue(none)"),
        }
    }
}

impl PartialEq for FenceValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.value == other.value
    }
}

impl Eq for FenceValue {}

impl FenceValue {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn key(&self) -> Option<FenceKey> {
        self.fence.as_ref().map(|f| f.key)
    }

    /// 是否引用了某个栅栏
    pub fn is_set(&self) -> bool {
        self.fence.is_some()
    }

    fn core(&self) -> Option<Arc<FenceCore>> {
        self.fence.as_ref().and_then(|f| f.registry.get(f.key))
    }

    pub fn complete(&self) -> bool {
        self.core().map_or(true, |core| core.complete(self.value))
    }

    /// 发出这个值
    pub fn signal(&self, queue: Option<&Queue>) {
        if let Some(core) = self.core() {
            core.signal_value(self.value, queue);
        }
    }

    /// 给定其他队列时让该队列在 GPU 上等待；不给队列时阻塞当前线程
    pub fn wait(&self, queue: Option<&Queue>) -> Result<()> {
        match self.core() {
            Some(core) => core.wait_value(self.value, queue),
            None => Ok(()),
        }
    }

    /// 有时限的 CPU 等待，超时返回 false
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.core().map_or(true, |core| core.wait_timeout(self.value, timeout))
    }

    pub fn wait_all(values: &[FenceValue], queue: Option<&Queue>) -> Result<()> {
        let mut set = FenceValues::default();
        values.iter().for_each(|v| set.add(v.clone()));
        set.wait(queue)
    }

    pub fn complete_all(values: &[FenceValue]) -> bool {
        values.iter().all(FenceValue::complete)
    }
}

/// 队列数量之内的集合不分配堆内存
const INLINE_FENCES: usize = 4;

/// 一组时间线点，每个栅栏只保留最大值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FenceValues {
    values: SmallVec<[FenceValue; INLINE_FENCES]>,
}

impl FenceValues {
    pub fn add(&mut self, value: FenceValue) {
        let Some(key) = value.key() else { return };

        match self.values.iter_mut().find(|v| v.key() == Some(key)) {
            Some(existing) => {
                if value.value > existing.value {
                    existing.value = value.value;
                }
            }
            None => self.values.push(value),
        }
    }

    pub fn add_all(&mut self, other: &FenceValues) {
        for value in &other.values {
            self.add(value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn remove_complete(&mut self) {
        self.values.retain(|v| !v.complete());
    }

    pub fn values(&self) -> &[FenceValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn complete(&self) -> bool {
        self.values.iter().all(FenceValue::complete)
    }

    /// 批量等待
    ///
    /// CPU 等待会合并成一次原生调用；GPU 等待逐个入队，失败只记录日志。
    pub fn wait(&self, queue: Option<&Queue>) -> Result<()> {
        if let Some(queue) = queue {
            for value in &self.values {
                if let Err(e) = value.wait(Some(queue)) {
                    warn!(queue = queue.name(), error = %e, "GPU fence wait failed");
                    return Err(e);
                }
            }
            return Ok(());
        }

        let pending: Vec<(Arc<FenceCore>, u64)> = self
            .values
            .iter()
            .filter_map(|v| v.core().map(|core| (core, v.value)))
            .filter(|(core, value)| !core.complete(*value))
            .collect();

        let Some((first, _)) = pending.first() else { return Ok(()) };
        let backend = first.backend.clone();

        let mut raws = Vec::with_capacity(pending.len());
        for (core, value) in &pending {
            core.check_issued(*value)?;
            if let Some(raw) = core.raw() {
                raws.push((raw, *value));
            }
        }

        let start = Instant::now();
        if !backend.wait_fences(&raws, None)? {
            return Err(GpuError::Device(DeviceError::WaitNeverCompletes("fence wait timed out".to_string())));
        }

        pending.iter().for_each(|(core, _)| {
            core.refresh();
        });
        debug!(
            count = pending.len(),
            stall_ms = start.elapsed().as_secs_f64() * 1000.0,
            "CPU waited on fences"
        );
        Ok(())
    }
}

impl From<FenceValue> for FenceValues {
    fn from(value: FenceValue) -> Self {
        let mut values = FenceValues::default();
        values.add(value);
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::{SoftBackend, SoftConfig};

    fn device() -> (Arc<SoftBackend>, Arc<Device>) {
        let soft = Arc::new(SoftBackend::new(SoftConfig::default()));
        let device = Device::new(Config::default(), soft.clone());
        (soft, device)
    }

    #[test]
    fn test_default_value_is_complete() {
        let value = FenceValue::default();
        assert!(value.complete());
        assert!(!value.is_set());
        assert!(value.wait(None).is_ok());
    }

    #[test]
    fn test_fence_monotonic() {
        let (soft, device) = device();
        let fence = Fence::new(&device, "test", None).unwrap();

        let v1 = fence.signal_later();
        let v2 = fence.signal_later();
        assert_eq!((v1.value(), v2.value()), (1, 2));
        assert!(!v1.complete());
        assert!(!fence.complete(2));

        soft.signal_fence(fence.raw().unwrap(), 1).unwrap();
        assert!(v1.complete());
        assert!(fence.complete(0));
        assert!(!v2.complete());

        soft.signal_fence(fence.raw().unwrap(), 2).unwrap();
        assert!(v2.complete());
        assert!(v1.complete());
        assert_eq!(fence.completed_value(), 2);
    }

    #[test]
    fn test_cpu_signal_and_wait() {
        let (_soft, device) = device();
        let fence = Fence::new(&device, "cpu", None).unwrap();

        let value = fence.signal(None);
        assert!(value.complete());
        assert!(value.wait(None).is_ok());

        // 从未发出的值不能在 CPU 上等待
        let next = fence.next_value();
        assert!(!next.complete());
        assert!(next.wait(None).is_err());
        assert!(!next.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_stale_value_is_complete() {
        let (_soft, device) = device();
        let fence = Fence::new(&device, "short lived", None).unwrap();
        let value = fence.signal_later();
        assert!(!value.complete());
        assert_eq!(device.fences().len(), 1);

        drop(fence);
        assert!(value.complete());
        assert!(device.fences().is_empty());

        // 复用槽位的新栅栏不会影响旧值
        let other = Fence::new(&device, "reuse", None).unwrap();
        let _pending = other.signal_later();
        assert!(value.complete());
    }

    #[test]
    fn test_fence_values_dedup() {
        let (_soft, device) = device();
        let a = Fence::new(&device, "a", None).unwrap();
        let b = Fence::new(&device, "b", None).unwrap();

        let mut values = FenceValues::default();
        values.add(a.value(5));
        values.add(a.value(3));
        values.add(b.value(1));
        values.add(FenceValue::default());

        assert_eq!(values.len(), 2);
        assert!(values.values().contains(&a.value(5)));
        assert!(values.values().contains(&b.value(1)));

        let mut merged = FenceValues::default();
        merged.add(a.value(7));
        merged.add_all(&values);
        assert_eq!(merged.len(), 2);
        assert!(merged.values().contains(&a.value(7)));
    }

    #[test]
    fn test_fence_values_stay_inline() {
        let (_soft, device) = device();
        let fences: Vec<Fence> =
            (0..INLINE_FENCES + 1).map(|i| Fence::new(&device, &format!("f{}", i), None).unwrap()).collect();

        let mut values = FenceValues::default();
        for (i, fence) in fences.iter().take(INLINE_FENCES).enumerate() {
            values.add(fence.value(i as u64 + 1));
            values.add(fence.value(1));
        }
        assert_eq!(values.len(), INLINE_FENCES);
        assert!(!values.values.spilled());

        values.add(fences[INLINE_FENCES].value(1));
        assert_eq!(values.len(), INLINE_FENCES + 1);
        assert!(values.values.spilled());
        assert!(values.values().contains(&fences[0].value(1)));
        assert!(values.values().contains(&fences[3].value(4)));
    }

    #[test]
    fn test_fence_values_wait() {
        let (_soft, device) = device();
        let a = Fence::new(&device, "a", None).unwrap();
        let b = Fence::new(&device, "b", None).unwrap();

        let mut values = FenceValues::default();
        values.add(a.signal(None));
        values.add(b.signal(None));
        values.add(b.signal_later());
        assert!(!values.complete());

        b.value(2).signal(None);
        assert!(values.complete());
        assert!(values.wait(None).is_ok());

        values.remove_complete();
        assert!(values.is_empty());
    }

    #[test]
    fn test_reset_preserves_timeline() {
        let (soft, device) = device();
        let fence = Fence::new(&device, "reset", None).unwrap();
        fence.signal(None);
        fence.signal(None);
        let pending = fence.signal_later();

        soft.simulate_device_removed("test");
        assert!(device.children().reset_all(|| soft.recreate().is_ok()));

        // 设备移除时发出的所有值都视为完成
        assert!(pending.complete());
        let next = fence.signal(None);
        assert_eq!(next.value(), 4);
        assert!(next.complete());
        assert_eq!(soft.fence_completed_value(fence.raw().unwrap()), 4);
    }
}
