//! 子资源状态表
//!
//! 每个子资源一项 (D3D12 状态, 分类)。所有子资源一致时压缩成一项，读取时按需压缩。
//!
//! 分类的合法转换（仅在 debug 构建中检查）：
//!
//! | 新分类   | 允许的旧分类            |
//! |----------|-------------------------|
//! | None     | Pending                 |
//! | Global   | Global                  |
//! | Pending  | None                    |
//! | Promoted | Pending                 |
//! | Decayed  | Promoted、Barrier       |
//! | Barrier  | 除 Decayed 以外的任何分类 |

use crate::gfx::backend::ResourceStates;

/// 状态的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// 未设置
    None,
    /// 两次执行之间的持久状态
    Global,
    /// 命令列表中的第一次转换，之前的状态要到关闭时才知道
    Pending,
    /// 通过隐式提升完成，不需要屏障
    Promoted,
    /// 执行结束后隐式衰减回 COMMON
    Decayed,
    /// 记录了显式屏障
    Barrier,
}

pub type SubState = (ResourceStates, StateType);

fn assert_type_change(current: StateType, new: StateType) {
    let legal = match new {
        StateType::None => current == StateType::Pending,
        StateType::Global => current == StateType::Global,
        StateType::Pending => current == StateType::None,
        StateType::Promoted => current == StateType::Pending,
        StateType::Decayed => matches!(current, StateType::Promoted | StateType::Barrier),
        StateType::Barrier => current != StateType::Decayed,
    };

    debug_assert!(legal, "illegal state type change {:?} -> {:?}", current, new);
}

fn merge_state(dest: &mut SubState, source: SubState) {
    if source.1 == StateType::None {
        return;
    }

    if dest.1 == StateType::Global {
        dest.0 = source.0;
    } else {
        *dest = source;
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    states: Vec<SubState>,
    array_size: usize,
    mip_size: usize,
    check_all_same: bool,
}

impl ResourceState {
    pub fn new(state: ResourceStates, ty: StateType, array_size: usize, mip_size: usize) -> Self {
        Self {
            states: vec![(state, ty)],
            array_size: array_size.max(1),
            mip_size: mip_size.max(1),
            check_all_same: false,
        }
    }

    pub fn array_size(&self) -> usize {
        self.array_size
    }

    pub fn mip_size(&self) -> usize {
        self.mip_size
    }

    pub fn sub_resource_size(&self) -> usize {
        self.array_size * self.mip_size
    }

    /// 所有子资源是否一致，一致时压缩成一项
    pub fn all_same(&mut self) -> bool {
        if self.check_all_same {
            self.check_all_same = false;
            if self.is_uniform() {
                self.states.truncate(1);
            }
        }

        self.states.len() == 1
    }

    /// 不压缩的一致性检查
    pub fn is_uniform(&self) -> bool {
        self.states.windows(2).all(|w| w[0] == w[1])
    }

    /// 设置一个数组切片与 mip 范围
    pub fn set(
        &mut self,
        state: ResourceStates,
        ty: StateType,
        array_start: usize,
        array_count: usize,
        mip_start: usize,
        mip_count: usize,
    ) {
        if mip_count == self.mip_size {
            self.set_range(state, ty, array_start * self.mip_size, array_count * self.mip_size);
        } else {
            for array in array_start..array_start + array_count {
                self.set_range(state, ty, array * self.mip_size + mip_start, mip_count);
            }
        }
    }

    /// 设置一段连续的子资源
    pub fn set_range(&mut self, state: ResourceStates, ty: StateType, start: usize, count: usize) {
        if cfg!(debug_assertions) {
            for i in start..start + count {
                assert_type_change(self.get(i, None).1, ty);
            }
        }

        let value = (state, ty);
        let total = self.sub_resource_size();

        if count == total {
            self.states.truncate(1);
            self.states[0] = value;
        } else if !self.all_same() || value != self.states[0] {
            let front = self.states[0];
            self.states.resize(total, front);
            for entry in &mut self.states[start..start + count] {
                *entry = value;
            }
        }

        self.check_all_same = self.states.len() > 1;
    }

    /// 读取子资源状态；分类为 None 时回退到 `fallback`
    pub fn get(&self, sub: usize, fallback: Option<&ResourceState>) -> SubState {
        let state = if self.states.len() == 1 { self.states[0] } else { self.states[sub] };

        match fallback {
            Some(fallback) if state.1 == StateType::None => fallback.get(sub, None),
            _ => state,
        }
    }

    pub fn get_array_mip(&self, array: usize, mip: usize, fallback: Option<&ResourceState>) -> SubState {
        self.get(array * self.mip_size + mip, fallback)
    }

    /// 把另一张表合并进来
    ///
    /// 另一张表中分类为 None 的项被忽略；本表的 Global 项只接受新状态，保持 Global 分类。
    pub fn merge(&mut self, other: &ResourceState) {
        debug_assert_eq!(other.sub_resource_size(), self.sub_resource_size());

        if other.states.len() == self.states.len() || !other.is_uniform() {
            let front = self.states[0];
            self.states.resize(other.states.len().max(self.states.len()), front);
            for (i, dest) in self.states.iter_mut().enumerate() {
                merge_state(dest, other.get(i, None));
            }
        } else {
            let source = other.states[0];
            for dest in &mut self.states {
                merge_state(dest, source);
            }
        }

        self.check_all_same = self.states.len() > 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSR: ResourceStates = ResourceStates::PIXEL_SHADER_RESOURCE;
    const COPY_DEST: ResourceStates = ResourceStates::COPY_DEST;

    #[test]
    fn test_collapse_and_expand() {
        let mut state = ResourceState::new(ResourceStates::COMMON, StateType::None, 2, 3);
        assert!(state.all_same());

        state.set(PSR, StateType::Pending, 1, 1, 1, 2);
        assert!(!state.all_same());
        assert_eq!(state.get_array_mip(1, 1, None), (PSR, StateType::Pending));
        assert_eq!(state.get_array_mip(1, 2, None), (PSR, StateType::Pending));
        assert_eq!(state.get_array_mip(1, 0, None), (ResourceStates::COMMON, StateType::None));

        state.set(PSR, StateType::Pending, 0, 1, 0, 3);
        state.set_range(PSR, StateType::Pending, 3, 1);
        assert!(state.all_same());
        assert_eq!(state.get(5, None), (PSR, StateType::Pending));
    }

    #[test]
    fn test_whole_range_collapses() {
        let mut state = ResourceState::new(ResourceStates::COMMON, StateType::None, 4, 1);
        state.set_range(COPY_DEST, StateType::Pending, 2, 1);
        state.set_range(PSR, StateType::Barrier, 0, 4);
        assert!(state.all_same());
        assert_eq!(state.get(2, None), (PSR, StateType::Barrier));
    }

    #[test]
    fn test_fallback() {
        let global = ResourceState::new(COPY_DEST, StateType::Global, 1, 2);
        let mut local = ResourceState::new(ResourceStates::COMMON, StateType::None, 1, 2);
        local.set_range(PSR, StateType::Pending, 1, 1);

        assert_eq!(local.get(0, Some(&global)), (COPY_DEST, StateType::Global));
        assert_eq!(local.get(1, Some(&global)), (PSR, StateType::Pending));
    }

    #[test]
    fn test_merge_keeps_global() {
        let mut global = ResourceState::new(ResourceStates::COMMON, StateType::Global, 1, 4);
        let mut local = ResourceState::new(ResourceStates::COMMON, StateType::None, 1, 4);
        local.set_range(PSR, StateType::Pending, 1, 2);
        local.set_range(PSR, StateType::Promoted, 1, 2);

        global.merge(&local);
        assert_eq!(global.get(0, None), (ResourceStates::COMMON, StateType::Global));
        assert_eq!(global.get(1, None), (PSR, StateType::Global));
        assert_eq!(global.get(2, None), (PSR, StateType::Global));
        assert_eq!(global.get(3, None), (ResourceStates::COMMON, StateType::Global));

        // 非 Global 的目标直接被覆盖
        let mut batch = ResourceState::new(ResourceStates::COMMON, StateType::None, 1, 4);
        batch.merge(&local);
        assert_eq!(batch.get(1, None), (PSR, StateType::Promoted));
        assert_eq!(batch.get(0, None), (ResourceStates::COMMON, StateType::None));
    }

    #[test]
    fn test_merge_idempotent() {
        let mut state = ResourceState::new(PSR, StateType::Global, 2, 2);
        let copy = state.clone();
        state.merge(&copy);
        assert!(state.all_same());
        assert_eq!(state.get(3, None), (PSR, StateType::Global));

        let mut expanded = ResourceState::new(COPY_DEST, StateType::None, 2, 2);
        expanded.set_range(PSR, StateType::Pending, 0, 1);
        expanded.set_range(PSR, StateType::Pending, 1, 3);
        let twin = expanded.clone();
        expanded.merge(&twin);
        assert!(expanded.all_same());
        assert_eq!(expanded.get(0, None), (PSR, StateType::Pending));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal state type change")]
    fn test_illegal_type_change() {
        let mut state = ResourceState::new(ResourceStates::COMMON, StateType::None, 1, 1);
        state.set_range(PSR, StateType::Promoted, 0, 1);
    }
}
