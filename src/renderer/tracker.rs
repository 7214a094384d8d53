//! 资源屏障追踪
//!
//! 每个命令列表有一个 `ResourceTracker`。录制期间只知道资源在本列表中的状态：
//! 第一次转换记为 Pending，真正的前一状态要等提交时才知道，因为同一批提交的多个列表
//! 必须按执行顺序衔接。
//!
//! # 关闭（提交时按列表顺序调用）
//!
//! - Pending 转换与资源的全局状态比较：相同则不需要屏障；能从 COMMON 隐式提升的记为 Promoted；
//!   其余生成真正的屏障，放进本列表之前执行的"前置列表"
//! - 本列表的最终状态写入 `DecayBatch` 的暂存状态，下一个列表以它为前一状态
//! - 整批列表提交成功后由 `DecayBatch::finish` 处理隐式衰减并写回资源的全局状态；
//!   没有提交的批次直接丢弃，全局状态不变

use std::collections::HashMap;
use std::sync::Arc;

use super::resource::ResourceShared;
use super::state::{ResourceState, StateType};
use crate::gfx::backend::{GpuCommand, QueueKind, RawResource, ResourceBarrier, ResourceDesc, ResourceStates};

/// 一段数组切片与 mip 范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubResourceRange {
    pub array_start: usize,
    pub array_count: usize,
    pub mip_start: usize,
    pub mip_count: usize,
}

impl SubResourceRange {
    pub fn all(desc: &ResourceDesc) -> Self {
        Self {
            array_start: 0,
            array_count: desc.array_size as usize,
            mip_start: 0,
            mip_count: desc.mip_levels as usize,
        }
    }

    pub fn sub_index(desc: &ResourceDesc, sub_index: usize) -> Self {
        let mips = desc.mip_levels.max(1) as usize;
        Self {
            array_start: sub_index / mips,
            array_count: 1,
            mip_start: sub_index % mips,
            mip_count: 1,
        }
    }

    fn is_all(&self, desc: &ResourceDesc) -> bool {
        self.array_start == 0
            && self.mip_start == 0
            && self.array_count == desc.array_size as usize
            && self.mip_count == desc.mip_levels as usize
    }

    fn indices(&self, desc: &ResourceDesc) -> impl Iterator<Item = usize> {
        let mips = desc.mip_levels as usize;
        let (mip_start, mip_count) = (self.mip_start, self.mip_count);
        (self.array_start..self.array_start + self.array_count)
            .flat_map(move |array| (mip_start..mip_start + mip_count).map(move |mip| array * mips + mip))
    }
}

/// 可以从 COMMON 隐式提升到 `after`
///
/// 缓冲区与同时访问纹理可以提升到任何单一的写状态与所有读状态；
/// 普通纹理只能提升到着色器资源、拷贝源与拷贝目标。
pub fn allow_promotion(desc: &ResourceDesc, before: ResourceStates, after: ResourceStates) -> bool {
    if before != ResourceStates::COMMON || after == ResourceStates::COMMON {
        return false;
    }

    let (reads, writes) = if desc.is_buffer() || desc.simultaneous_access {
        (
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER
                | ResourceStates::INDEX_BUFFER
                | ResourceStates::NON_PIXEL_SHADER_RESOURCE
                | ResourceStates::PIXEL_SHADER_RESOURCE
                | ResourceStates::INDIRECT_ARGUMENT
                | ResourceStates::COPY_SOURCE,
            ResourceStates::RENDER_TARGET
                | ResourceStates::UNORDERED_ACCESS
                | ResourceStates::STREAM_OUT
                | ResourceStates::COPY_DEST
                | ResourceStates::RESOLVE_DEST
                | ResourceStates::RESOLVE_SOURCE
                | ResourceStates::PREDICATION,
        )
    } else {
        (
            ResourceStates::NON_PIXEL_SHADER_RESOURCE
                | ResourceStates::PIXEL_SHADER_RESOURCE
                | ResourceStates::COPY_SOURCE,
            ResourceStates::COPY_DEST,
        )
    };

    if reads.contains(after) {
        return true;
    }

    writes.contains(after) && after.bits().is_power_of_two()
}

/// 执行结束后是否隐式衰减回 COMMON
pub fn allow_decay(desc: &ResourceDesc, queue: QueueKind, ty: StateType, state: ResourceStates) -> bool {
    if queue == QueueKind::Copy || desc.is_buffer() || desc.simultaneous_access {
        return true;
    }

    ty == StateType::Promoted
        && (ResourceStates::NON_PIXEL_SHADER_RESOURCE
            | ResourceStates::PIXEL_SHADER_RESOURCE
            | ResourceStates::COPY_SOURCE)
            .contains(state)
}

fn transition(resource: RawResource, sub: Option<usize>, before: ResourceStates, after: ResourceStates) -> ResourceBarrier {
    ResourceBarrier::Transition {
        resource,
        subresource: sub.map(|s| s as u32),
        before,
        after,
    }
}

struct Tracked {
    resource: Arc<ResourceShared>,
    state: ResourceState,
    /// 第一次转换：(子资源，None 表示全部；目标状态)
    barriers_before: Vec<(Option<usize>, ResourceStates)>,
}

impl Tracked {
    fn new(resource: &Arc<ResourceShared>) -> Self {
        let desc = resource.desc();
        Self {
            resource: resource.clone(),
            state: ResourceState::new(
                ResourceStates::COMMON,
                StateType::None,
                desc.array_size as usize,
                desc.mip_levels as usize,
            ),
            barriers_before: Vec::new(),
        }
    }

    /// 把仍是 Pending 的子资源定为 `ty`
    fn settle(&mut self, sub: Option<usize>, ty: StateType) {
        let total = self.state.sub_resource_size();
        if sub.is_none() && self.state.all_same() {
            let (state, current) = self.state.get(0, None);
            if current == StateType::Pending {
                self.state.set_range(state, ty, 0, total);
            }
            return;
        }

        let range = match sub {
            Some(sub) => sub..sub + 1,
            None => 0..total,
        };

        for i in range {
            let (state, current) = self.state.get(i, None);
            if current == StateType::Pending {
                self.state.set_range(state, ty, i, 1);
            }
        }
    }
}

struct Staged {
    resource: Arc<ResourceShared>,
    /// 本批各列表的最终状态，未触及的子资源为 None
    batch: ResourceState,
    /// 资源全局状态的副本，按列表顺序推进
    global: ResourceState,
}

/// 一批提交中被触及的资源
///
/// 关闭列表时只推进这里的暂存状态；`finish` 在列表真正提交之后处理衰减并写回资源。
/// 批次被丢弃时资源的全局状态保持不变。
#[derive(Default)]
pub struct DecayBatch {
    resources: HashMap<u64, Staged>,
}

impl DecayBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn staged(&mut self, resource: &Arc<ResourceShared>) -> &mut Staged {
        self.resources.entry(resource.storage_id()).or_insert_with(|| {
            let desc = resource.desc();
            Staged {
                resource: resource.clone(),
                batch: ResourceState::new(
                    ResourceStates::COMMON,
                    StateType::None,
                    desc.array_size as usize,
                    desc.mip_levels as usize,
                ),
                global: resource.tracking().global_state.clone(),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// 列表提交成功后调用：把满足衰减条件的子资源折回 COMMON，写回全局状态
    ///
    /// 返回衰减的子资源数。
    pub fn finish(self, queue: QueueKind) -> usize {
        let mut decayed = 0;

        for (_, Staged { resource, mut batch, .. }) in self.resources {
            let desc = *resource.desc();
            for sub in 0..batch.sub_resource_size() {
                let (value, ty) = batch.get(sub, None);
                if ty == StateType::None || !allow_decay(&desc, queue, ty, value) {
                    continue;
                }

                batch.set_range(ResourceStates::COMMON, StateType::Decayed, sub, 1);
                decayed += 1;
            }

            resource.tracking().global_state.merge(&batch);
        }

        decayed
    }
}

/// 单个命令列表的状态追踪
#[derive(Default)]
pub struct ResourceTracker {
    resources: HashMap<u64, Tracked>,
    pending: Vec<ResourceBarrier>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending.is_empty()
    }

    /// 记录资源在本列表中转换到 `state`
    pub fn state_barrier(&mut self, resource: &Arc<ResourceShared>, state: ResourceStates, range: SubResourceRange) {
        let Some(raw) = resource.raw() else { return };
        let desc = *resource.desc();
        let total = desc.sub_resource_count();
        let tracked = self.resources.entry(resource.storage_id()).or_insert_with(|| Tracked::new(resource));

        if range.is_all(&desc) && tracked.state.all_same() {
            let (current, ty) = tracked.state.get(0, None);
            if ty == StateType::None {
                tracked.barriers_before.push((None, state));
                tracked.state.set_range(state, StateType::Pending, 0, total);
            } else if current != state {
                self.pending.push(transition(raw, None, current, state));
                tracked.state.set_range(state, StateType::Barrier, 0, total);
            }
            return;
        }

        for sub in range.indices(&desc) {
            let (current, ty) = tracked.state.get(sub, None);
            if ty == StateType::None {
                tracked.barriers_before.push((Some(sub), state));
                tracked.state.set_range(state, StateType::Pending, sub, 1);
            } else if current != state {
                self.pending.push(transition(raw, Some(sub), current, state));
                tracked.state.set_range(state, StateType::Barrier, sub, 1);
            }
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<&ResourceShared>) {
        self.pending.push(ResourceBarrier::Uav { resource: resource.and_then(ResourceShared::raw) });
    }

    pub fn alias_barrier(&mut self, before: Option<&ResourceShared>, after: Option<&ResourceShared>) {
        self.pending.push(ResourceBarrier::Aliasing {
            before: before.and_then(ResourceShared::raw),
            after: after.and_then(ResourceShared::raw),
        });
    }

    /// 取出尚未录制的屏障
    pub fn flush(&mut self) -> Option<GpuCommand> {
        if self.pending.is_empty() {
            None
        } else {
            Some(GpuCommand::Barriers(std::mem::take(&mut self.pending)))
        }
    }

    /// 按提交顺序关闭，前置屏障写入 `before`
    pub fn close(&mut self, before: &mut Vec<ResourceBarrier>, batch: &mut DecayBatch) {
        debug_assert!(self.pending.is_empty(), "tracker closed with unflushed barriers");

        for (_, mut tracked) in self.resources.drain() {
            let resource = tracked.resource.clone();
            let desc = *resource.desc();
            let raw = resource.raw();
            let total = tracked.state.sub_resource_size();
            let staged = batch.staged(&resource);

            for (sub, after) in std::mem::take(&mut tracked.barriers_before) {
                let uniform = staged.global.all_same() && staged.batch.is_uniform();

                let subs: Vec<Option<usize>> = match sub {
                    None if uniform => vec![None],
                    None => (0..total).map(Some).collect(),
                    Some(sub) => vec![Some(sub)],
                };

                for sub in subs {
                    let index = sub.unwrap_or(0);
                    let (global, _) = staged.global.get(index, None);

                    let ty = if global == after {
                        if staged.batch.get(index, None).1 == StateType::Promoted {
                            StateType::Promoted
                        } else {
                            StateType::Barrier
                        }
                    } else if allow_promotion(&desc, global, after) {
                        StateType::Promoted
                    } else {
                        if let Some(raw) = raw {
                            before.push(transition(raw, sub, global, after));
                        }
                        StateType::Barrier
                    };

                    tracked.settle(sub, ty);
                }
            }

            staged.global.merge(&tracked.state);
            staged.batch.merge(&tracked.state);
        }
    }

    /// 丢弃所有记录，列表不会被提交
    pub fn reset(&mut self) {
        self.resources.clear();
        self.pending.clear();
    }
}
