//! 显存驻留
//!
//! 每个可分页对象（GPU 堆、提交资源）在全局 MRU 链表里有一个节点，记录它当前是否驻留、
//! 正在进行的驻留转换何时完成，以及在哪些 GPU 工作完成之前不能被驱逐。
//!
//! # 驻留流程（每次提交之前）
//!
//! 1. 递增使用计数，给本次提交引用的节点打上标记并移到链表前端
//! 2. 未驻留的节点排队调入，已在调入中的节点把完成值加入调用方的等待集
//! 3. 当前用量加上待调入的字节超过预算时，从链表尾部开始驱逐没有标记的节点；
//!    第一遍跳过仍被 GPU 使用的节点，第二遍先在 CPU 上等它们完成
//! 4. 批量调用 `Evict` 与 `EnqueueMakeResident`，失败时回滚驻留标记
//! 5. 给引用的节点记录"至少保持驻留到"的栅栏值
//!
//! 节点以 (槽位, 代数) 寻址，链表用槽位下标串联。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::sync::{Fence, FenceValue, FenceValues};
use crate::core::config::OverBudgetPolicy;
use crate::gfx::backend::{GpuBackend, Pageable, VideoMemoryInfo};

/// 驻留节点的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResidencyKey {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct ResidencyNode {
    generation: u32,
    live: bool,
    pageable: Option<Pageable>,
    size: u64,
    resident: bool,
    /// 调入完成时的栅栏值
    resident_value: FenceValue,
    usage_counter: u64,
    keep_resident: FenceValues,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Default)]
struct ResidencyInner {
    nodes: Vec<ResidencyNode>,
    free: Vec<u32>,
    front: Option<u32>,
    back: Option<u32>,
    usage_counter: u64,
    memory_info: VideoMemoryInfo,
}

impl ResidencyInner {
    fn node(&self, key: ResidencyKey) -> Option<&ResidencyNode> {
        self.nodes.get(key.index as usize).filter(|n| n.live && n.generation == key.generation)
    }

    fn node_mut(&mut self, key: ResidencyKey) -> Option<&mut ResidencyNode> {
        self.nodes.get_mut(key.index as usize).filter(|n| n.live && n.generation == key.generation)
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let node = &self.nodes[index as usize];
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.front = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.back = prev,
        }

        let node = &mut self.nodes[index as usize];
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, index: u32) {
        let old_front = self.front;
        {
            let node = &mut self.nodes[index as usize];
            node.prev = None;
            node.next = old_front;
        }

        match old_front {
            Some(f) => self.nodes[f as usize].prev = Some(index),
            None => self.back = Some(index),
        }
        self.front = Some(index);
    }

    fn push_back(&mut self, index: u32) {
        let old_back = self.back;
        {
            let node = &mut self.nodes[index as usize];
            node.next = None;
            node.prev = old_back;
        }

        match old_back {
            Some(b) => self.nodes[b as usize].next = Some(index),
            None => self.front = Some(index),
        }
        self.back = Some(index);
    }
}

/// 一次驻留操作的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidencyOutcome {
    pub made_resident: usize,
    pub made_resident_bytes: u64,
    pub evicted: usize,
    pub evicted_bytes: u64,
    /// 驱逐之后仍然超出预算的字节数
    pub over_budget: u64,
    pub success: bool,
}

impl ResidencyOutcome {
    /// 按策略决定这一批命令是否还能执行
    pub fn should_execute(&self, policy: OverBudgetPolicy) -> bool {
        self.success || policy == OverBudgetPolicy::Proceed
    }
}

/// 全局 MRU 驻留列表
pub struct ResidencyList {
    backend: Arc<dyn GpuBackend>,
    inner: Mutex<ResidencyInner>,
    /// 串行化 `make_resident`，保证预留的驻留栅栏值与实际使用的一致
    serial: Mutex<()>,
}

impl ResidencyList {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inner: Mutex::new(ResidencyInner::default()),
            serial: Mutex::new(()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, ResidencyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新节点放在链表尾部（最久未使用）
    pub fn insert(&self, pageable: Option<Pageable>, size: u64, resident: bool) -> ResidencyKey {
        let mut inner = self.inner();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.nodes.push(ResidencyNode::default());
                (inner.nodes.len() - 1) as u32
            }
        };

        let generation = inner.nodes[index as usize].generation;
        inner.nodes[index as usize] = ResidencyNode {
            generation,
            live: true,
            pageable,
            size,
            resident,
            ..Default::default()
        };
        inner.push_back(index);

        ResidencyKey { index, generation }
    }

    pub fn remove(&self, key: ResidencyKey) {
        let mut inner = self.inner();
        if inner.node(key).is_none() {
            return;
        }

        inner.unlink(key.index);
        let node = &mut inner.nodes[key.index as usize];
        *node = ResidencyNode {
            generation: node.generation.wrapping_add(1),
            ..Default::default()
        };
        inner.free.push(key.index);
    }

    /// 设备重置后替换可分页对象
    pub fn update(&self, key: ResidencyKey, pageable: Option<Pageable>, resident: bool) {
        let mut inner = self.inner();
        if let Some(node) = inner.node_mut(key) {
            node.pageable = pageable;
            node.resident = resident;
            node.resident_value = FenceValue::default();
            node.keep_resident.clear();
        }
    }

    pub fn is_resident(&self, key: ResidencyKey) -> bool {
        self.inner().node(key).is_some_and(|n| n.resident)
    }

    /// 记录节点至少保持驻留到 `value`
    pub fn keep_resident(&self, key: ResidencyKey, value: &FenceValue) {
        if let Some(node) = self.inner().node_mut(key) {
            node.keep_resident.add(value.clone());
        }
    }

    /// 从最近使用到最久未使用
    pub fn mru_order(&self) -> Vec<ResidencyKey> {
        let inner = self.inner();
        let mut keys = Vec::new();
        let mut cursor = inner.front;
        while let Some(index) = cursor {
            let node = &inner.nodes[index as usize];
            keys.push(ResidencyKey { index, generation: node.generation });
            cursor = node.next;
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.inner().nodes.iter().filter(|n| n.live).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_info(&self) -> VideoMemoryInfo {
        self.inner().memory_info
    }

    pub fn refresh_memory_info(&self) -> VideoMemoryInfo {
        let info = self.backend.video_memory_info();
        self.inner().memory_info = info;
        info
    }

    /// 让 `set` 中的对象在下一次执行前驻留
    ///
    /// 需要等待的调入完成值加入 `wait_values`，执行队列必须在 GPU 上等待它们。
    /// `keep_until` 是这次执行完成时的栅栏值。
    pub fn make_resident(
        &self,
        set: &HashSet<ResidencyKey>,
        keep_until: &FenceValues,
        residency_fence: &Fence,
        wait_values: &mut FenceValues,
    ) -> ResidencyOutcome {
        let _span = crate::span_trace!("make_resident").entered();
        let _serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        let mut outcome = ResidencyOutcome::default();

        if set.is_empty() {
            outcome.success = true;
            return outcome;
        }

        let info = self.backend.video_memory_info();
        let pending_value = residency_fence.next_value();
        let mut make_resident = Vec::new();
        let counter;

        {
            let mut inner = self.inner();
            inner.usage_counter += 1;
            counter = inner.usage_counter;

            for key in set {
                let Some(node) = inner.node_mut(*key) else { continue };
                let Some(pageable) = node.pageable else { continue };

                if !node.resident {
                    make_resident.push(pageable);
                    outcome.made_resident_bytes += node.size;
                    node.resident = true;
                    node.resident_value = pending_value.clone();
                } else if node.resident_value.complete() {
                    node.resident_value = FenceValue::default();
                } else {
                    wait_values.add(node.resident_value.clone());
                }

                node.usage_counter = counter;
                inner.unlink(key.index);
                inner.push_front(key.index);
            }
        }

        let evicted = self.evict_lru(counter, info, outcome.made_resident_bytes, &mut outcome);

        if !evicted.is_empty() {
            crate::residency_info!(bytes = outcome.evicted_bytes, count = evicted.len(), "Evicting");
            if let Err(e) = self.backend.evict(&evicted) {
                crate::residency_warn!(error = %e, "Evict failed");
            }
        }

        if !make_resident.is_empty() {
            crate::residency_info!(
                bytes = outcome.made_resident_bytes,
                count = make_resident.len(),
                "Making resident"
            );

            let value = residency_fence.signal_later();
            debug_assert_eq!(value, pending_value);

            let result = match residency_fence.raw() {
                Some(raw) => self.backend.enqueue_make_resident(&make_resident, raw, value.value()),
                None => Err(crate::core::error::DeviceError::Removed("residency fence released".to_string()).into()),
            };

            if let Err(e) = result {
                crate::residency_warn!(error = %e, "Failed to make enough data resident");
                let mut inner = self.inner();
                for key in set {
                    if let Some(node) = inner.node_mut(*key) {
                        if node.resident && node.resident_value == value {
                            node.resident = false;
                            node.resident_value = FenceValue::default();
                        }
                    }
                }

                // 没有人会等待这个值，直接在 CPU 上发出，保持时间线连续
                value.signal(None);
                outcome.success = false;
                return outcome;
            }

            outcome.made_resident = make_resident.len();
            wait_values.add(value);
        }

        {
            let mut inner = self.inner();
            for key in set {
                if let Some(node) = inner.node_mut(*key) {
                    node.keep_resident.remove_complete();
                    node.keep_resident.add_all(keep_until);
                }
            }

            inner.memory_info = VideoMemoryInfo {
                budget: info.budget,
                current_usage: (info.current_usage + outcome.made_resident_bytes).saturating_sub(outcome.evicted_bytes),
            };
        }

        outcome.success = outcome.over_budget == 0;
        outcome
    }

    /// 从链表尾部驱逐，直到不再超出预算或遇到本次使用的节点
    fn evict_lru(
        &self,
        counter: u64,
        info: VideoMemoryInfo,
        pending_bytes: u64,
        outcome: &mut ResidencyOutcome,
    ) -> Vec<Pageable> {
        let mut evicted = Vec::new();
        if info.budget == 0 {
            return evicted;
        }

        let mut over = (info.current_usage + pending_bytes).saturating_sub(info.budget);
        let mut wait_to_evict = FenceValues::default();

        for pass in 0..2 {
            if over == 0 {
                break;
            }

            if pass == 1 {
                if wait_to_evict.is_empty() {
                    break;
                }

                // 在 CPU 上等待相关的 GPU 工作完成，之后这些节点都可以驱逐
                debug!(count = wait_to_evict.len(), "Waiting for GPU work before eviction");
                if let Err(e) = wait_to_evict.wait(None) {
                    crate::residency_warn!(error = %e, "Wait before eviction failed");
                }
            }

            let mut inner = self.inner();
            let mut cursor = inner.back;
            while let Some(index) = cursor {
                if over == 0 {
                    break;
                }

                let node = &mut inner.nodes[index as usize];
                if node.usage_counter == counter {
                    break;
                }
                cursor = node.prev;

                let Some(pageable) = node.pageable else { continue };
                if !node.resident {
                    continue;
                }

                if node.keep_resident.complete() {
                    evicted.push(pageable);
                    node.resident = false;
                    node.resident_value = FenceValue::default();
                    node.keep_resident.clear();
                    outcome.evicted += 1;
                    outcome.evicted_bytes += node.size;
                    over -= node.size.min(over);
                } else {
                    wait_to_evict.add_all(&node.keep_resident);
                }
            }
        }

        if over > 0 {
            crate::residency_warn!(
                over_budget = over,
                budget = info.budget,
                usage = info.current_usage,
                "Over budget after eviction"
            );
        }

        outcome.over_budget = over;
        evicted
    }
}

/// 驻留节点的所有权，析构时移除节点
pub struct ResidencyHandle {
    list: Arc<ResidencyList>,
    key: ResidencyKey,
}

impl ResidencyHandle {
    pub fn new(list: &Arc<ResidencyList>, pageable: Option<Pageable>, size: u64, resident: bool) -> Self {
        let key = list.insert(pageable, size, resident);
        Self { list: list.clone(), key }
    }

    pub fn key(&self) -> ResidencyKey {
        self.key
    }

    pub fn update(&self, pageable: Option<Pageable>, resident: bool) {
        self.list.update(self.key, pageable, resident);
    }
}

impl Drop for ResidencyHandle {
    fn drop(&mut self) {
        self.list.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::backend::{ResourceDesc, ResourceStates};
    use crate::gfx::{SoftBackend, SoftConfig};
    use crate::renderer::device::Device;

    const SIZE: u64 = 64 * 1024;

    struct Setup {
        soft: Arc<SoftBackend>,
        device: Arc<Device>,
        fence: Fence,
    }

    fn setup(budget: u64) -> Setup {
        let soft = Arc::new(SoftBackend::new(SoftConfig { budget, supports_not_resident: true }));
        let device = Device::new(Config::default(), soft.clone());
        let fence = Fence::new(&device, "residency", None).unwrap();
        Setup { soft, device, fence }
    }

    fn pageable(setup: &Setup) -> (Pageable, ResidencyHandle) {
        let raw = setup
            .soft
            .create_committed_resource(&ResourceDesc::buffer(SIZE), ResourceStates::COMMON, true)
            .unwrap();
        let pageable = Pageable::Resource(raw);
        let handle = ResidencyHandle::new(setup.device.residency(), Some(pageable), SIZE, false);
        (pageable, handle)
    }

    fn touch(setup: &Setup, keys: &[ResidencyKey], keep_until: &FenceValues) -> (ResidencyOutcome, FenceValues) {
        let set: HashSet<ResidencyKey> = keys.iter().copied().collect();
        let mut waits = FenceValues::default();
        let outcome = setup.device.residency().make_resident(&set, keep_until, &setup.fence, &mut waits);
        (outcome, waits)
    }

    #[test]
    fn test_make_resident() {
        let setup = setup(1 << 20);
        let (raw, node) = pageable(&setup);

        let (outcome, waits) = touch(&setup, &[node.key()], &FenceValues::default());
        assert!(outcome.success);
        assert_eq!(outcome.made_resident, 1);
        assert_eq!(waits.len(), 1);
        assert!(waits.complete());
        assert!(setup.soft.is_resident(raw));
        assert!(setup.device.residency().is_resident(node.key()));

        // 已经驻留的对象不会重复调入
        let (outcome, waits) = touch(&setup, &[node.key()], &FenceValues::default());
        assert_eq!(outcome.made_resident, 0);
        assert!(waits.is_empty());
        assert_eq!(setup.soft.stats().make_resident_calls, 1);
    }

    #[test]
    fn test_pending_value_added_to_waits() {
        let setup = setup(1 << 20);
        let (_raw, node) = pageable(&setup);

        setup.soft.pause();
        let (_, first) = touch(&setup, &[node.key()], &FenceValues::default());
        assert!(!first.complete());

        let (outcome, second) = touch(&setup, &[node.key()], &FenceValues::default());
        assert_eq!(outcome.made_resident, 0);
        assert_eq!(second, first);

        setup.soft.resume();
        assert!(second.complete());
    }

    #[test]
    fn test_mru_eviction() {
        let setup = setup(2 * SIZE);
        let (a_raw, a) = pageable(&setup);
        let (b_raw, b) = pageable(&setup);
        let (c_raw, c) = pageable(&setup);
        let none = FenceValues::default();

        touch(&setup, &[a.key()], &none);
        touch(&setup, &[b.key()], &none);
        assert_eq!(setup.device.residency().mru_order()[..2], [b.key(), a.key()]);

        let (outcome, _) = touch(&setup, &[c.key()], &none);
        assert!(outcome.success);
        assert_eq!(outcome.evicted, 1);
        assert!(!setup.soft.is_resident(a_raw));
        assert!(setup.soft.is_resident(b_raw));
        assert!(setup.soft.is_resident(c_raw));

        // 再次使用 a 时驱逐最久未用的 b，而不是刚用过的 c
        let (outcome, _) = touch(&setup, &[a.key()], &none);
        assert_eq!(outcome.evicted, 1);
        assert!(!setup.soft.is_resident(b_raw));
        assert!(setup.soft.is_resident(c_raw));
        assert_eq!(setup.device.residency().mru_order(), vec![a.key(), c.key(), b.key()]);
    }

    #[test]
    fn test_in_use_never_evicted() {
        let setup = setup(SIZE);
        let (a_raw, a) = pageable(&setup);
        let (b_raw, b) = pageable(&setup);

        let (outcome, _) = touch(&setup, &[a.key(), b.key()], &FenceValues::default());
        assert!(!outcome.success);
        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.over_budget, SIZE);
        assert!(outcome.should_execute(OverBudgetPolicy::Proceed));
        assert!(!outcome.should_execute(OverBudgetPolicy::SkipExecution));
        assert!(setup.soft.is_resident(a_raw) && setup.soft.is_resident(b_raw));
    }

    #[test]
    fn test_keep_resident_blocks_eviction() {
        let setup = setup(SIZE);
        let (a_raw, a) = pageable(&setup);
        let (_b_raw, b) = pageable(&setup);
        let gpu_work = Fence::new(&setup.device, "work", None).unwrap();

        // a 在一个永远不会完成的工作里被使用
        let busy: FenceValues = gpu_work.signal_later().into();
        touch(&setup, &[a.key()], &busy);

        let (outcome, _) = touch(&setup, &[b.key()], &FenceValues::default());
        assert!(!outcome.success);
        assert!(setup.soft.is_resident(a_raw));

        // 工作完成后可以驱逐
        busy.values()[0].signal(None);
        let (outcome, _) = touch(&setup, &[b.key()], &FenceValues::default());
        assert!(outcome.success);
        assert!(!setup.soft.is_resident(a_raw));
    }

    #[test]
    fn test_failed_make_resident_rolls_back() {
        let setup = setup(1 << 20);
        let (_raw, node) = pageable(&setup);

        setup.soft.simulate_device_removed("test");
        let (outcome, waits) = touch(&setup, &[node.key()], &FenceValues::default());
        assert!(!outcome.success);
        assert!(waits.is_empty());
        assert!(!setup.device.residency().is_resident(node.key()));
    }

    #[test]
    fn test_remove_reuses_slot() {
        let setup = setup(1 << 20);
        let (_, a) = pageable(&setup);
        let stale = a.key();
        drop(a);
        assert!(setup.device.residency().is_empty());

        let (_, b) = pageable(&setup);
        assert_ne!(stale, b.key());
        assert!(!setup.device.residency().is_resident(stale));
        assert_eq!(setup.device.residency().mru_order(), vec![b.key()]);
    }
}
