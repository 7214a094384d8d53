//! 设备子对象注册表
//!
//! 每个持有原生 GPU 对象的结构都在这里登记，设备丢失时按优先级统一释放与重建。
//!
//! # 重置流程
//!
//! 1. 快照所有子对象，按 (优先级, 登记顺序) 稳定排序
//! 2. 按优先级从高到低调用 `before_reset`，释放原生对象，可返回重建所需的数据
//! 3. 重建底层设备
//! 4. 按优先级从低到高调用 `reset`；重置过程中被销毁的对象会被跳过
//! 5. 同样顺序调用 `after_reset`
//!
//! 任何一步失败都只把总体结果标记为失败，其余子对象照常处理。
//! 回调执行期间不持有注册表的锁，回调里可以自由地创建或销毁其他子对象。

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error};

/// 重置优先级，数值小的先重建、后释放
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResetPriority {
    Fence,
    Heap,
    CpuDescriptorAllocator,
    GpuDescriptorAllocator,
    Resource,
    Queue,
    Commands,
    Normal,
    TargetWindow,
}

/// 设备子对象
pub trait DeviceChild: Send + Sync {
    fn name(&self) -> String;

    /// 释放原生对象，返回值会原样交给 `reset`
    fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
        None
    }

    /// 在新设备上重建原生对象
    fn reset(&self, data: Option<Box<dyn Any + Send>>) -> bool;

    /// 所有对象重建之后上传数据
    fn after_reset(&self) -> bool {
        true
    }
}

struct ChildEntry {
    child: Weak<dyn DeviceChild>,
    priority: ResetPriority,
    seq: u64,
}

struct ChildSlot {
    generation: u32,
    entry: Option<ChildEntry>,
}

#[derive(Default)]
struct ChildArena {
    slots: Vec<ChildSlot>,
    free: Vec<usize>,
    next_seq: u64,
    live: usize,
}

/// 设备子对象注册表
#[derive(Default)]
pub struct DeviceChildren {
    arena: Mutex<ChildArena>,
}

/// 登记句柄，销毁时自动注销
pub struct DeviceChildHandle {
    registry: Weak<DeviceChildren>,
    index: usize,
    generation: u32,
}

impl Drop for DeviceChildHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.index, self.generation);
        }
    }
}

struct Snapshot {
    index: usize,
    generation: u32,
    priority: ResetPriority,
    seq: u64,
    child: Weak<dyn DeviceChild>,
}

impl DeviceChildren {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn arena(&self) -> MutexGuard<'_, ChildArena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记一个子对象
    ///
    /// 通常在 `Arc::new_cyclic` 中调用，把自身的弱引用交给注册表。
    pub fn register(self: &Arc<Self>, child: Weak<dyn DeviceChild>, priority: ResetPriority) -> DeviceChildHandle {
        let mut arena = self.arena();
        let seq = arena.next_seq;
        arena.next_seq += 1;
        arena.live += 1;

        let entry = ChildEntry { child, priority, seq };
        let index = match arena.free.pop() {
            Some(index) => {
                arena.slots[index].entry = Some(entry);
                index
            }
            None => {
                arena.slots.push(ChildSlot { generation: 0, entry: Some(entry) });
                arena.slots.len() - 1
            }
        };

        DeviceChildHandle {
            registry: Arc::downgrade(self),
            index,
            generation: arena.slots[index].generation,
        }
    }

    fn unregister(&self, index: usize, generation: u32) {
        let mut arena = self.arena();
        if let Some(slot) = arena.slots.get_mut(index) {
            if slot.generation == generation && slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                arena.free.push(index);
                arena.live -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.arena().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Snapshot> {
        let arena = self.arena();
        let mut children: Vec<Snapshot> = arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry.as_ref().map(|entry| Snapshot {
                    index,
                    generation: slot.generation,
                    priority: entry.priority,
                    seq: entry.seq,
                    child: entry.child.clone(),
                })
            })
            .collect();

        children.sort_by_key(|c| (c.priority, c.seq));
        children
    }

    /// 快照中的对象是否仍然登记着
    fn live_child(&self, snapshot: &Snapshot) -> Option<Arc<dyn DeviceChild>> {
        let alive = {
            let arena = self.arena();
            arena
                .slots
                .get(snapshot.index)
                .is_some_and(|slot| slot.generation == snapshot.generation && slot.entry.is_some())
        };

        if alive {
            snapshot.child.upgrade()
        } else {
            None
        }
    }

    /// 执行完整的设备重置
    ///
    /// `recreate` 负责重建底层设备，返回是否成功。
    pub fn reset_all<F>(&self, recreate: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let children = self.snapshot();
        let mut status = true;
        debug!(count = children.len(), "Resetting device children");

        let mut reset_data: Vec<Option<Box<dyn Any + Send>>> = Vec::with_capacity(children.len());
        reset_data.resize_with(children.len(), || None);

        for (i, snapshot) in children.iter().enumerate().rev() {
            if let Some(child) = self.live_child(snapshot) {
                reset_data[i] = child.before_reset();
            }
        }

        if !recreate() {
            error!("Failed to recreate the device");
            status = false;
        }

        for (i, snapshot) in children.iter().enumerate() {
            if let Some(child) = self.live_child(snapshot) {
                if !child.reset(reset_data[i].take()) {
                    error!(child = %child.name(), "Device child failed to reset");
                    status = false;
                }
            }
        }

        for snapshot in &children {
            if let Some(child) = self.live_child(snapshot) {
                if !child.after_reset() {
                    error!(child = %child.name(), "Device child failed after reset");
                    status = false;
                }
            }
        }

        status
    }
}
