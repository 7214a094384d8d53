//! GPU 内存管理
//!
//! - `heap`：原生堆
//! - `range`：堆内的分配记录与 `MemRange`
//! - `allocator`：环形与空闲链表两种分配器

pub mod allocator;
pub mod heap;
pub mod range;

pub use allocator::{MemAllocatorBase, MemAllocatorFreeList, MemAllocatorRing};
pub use heap::Heap;
pub use range::MemRange;
