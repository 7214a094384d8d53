//! 延迟销毁
//!
//! 被 CPU 释放的对象可能仍在 GPU 上使用。`KeepAlive` 把对象连同它依赖的栅栏值一起保存，
//! 每帧结束时释放所有栅栏已完成的对象。

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::sync::FenceValues;

type Entry = (Box<dyn Any + Send>, FenceValues);

#[derive(Default)]
pub struct KeepAlive {
    entries: Mutex<VecDeque<Entry>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 保存对象直到 `fences` 全部完成；已经完成的直接释放
    pub fn add<T: Any + Send>(&self, object: T, fences: FenceValues) {
        if fences.complete() {
            drop(object);
            return;
        }

        self.entries().push_back((Box::new(object), fences));
    }

    /// 释放所有依赖已完成的对象
    pub fn flush(&self) -> usize {
        let released: Vec<Entry> = {
            let mut entries = self.entries();
            let (done, pending): (VecDeque<Entry>, VecDeque<Entry>) =
                entries.drain(..).partition(|(_, fences)| fences.complete());
            *entries = pending;
            done.into_iter().collect()
        };

        // 对象在锁外析构，析构时可能再次加入 keep-alive
        let count = released.len();
        drop(released);
        count
    }

    /// 无条件释放所有对象（设备空闲或重置时）
    pub fn drain(&self) -> usize {
        let released: Vec<Entry> = self.entries().drain(..).collect();
        let count = released.len();
        drop(released);
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
