//! 工作线程注册表
//!
//! 只追加的线程记录数组。新记录先占槽位、初始化，再按槽位顺序推进
//! `published` 发布；读者只访问已发布的槽位，因此不会看到未初始化的记录。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use crossbeam_utils::{Backoff, CachePadded};

use super::machine::{Machine, MachineId};
use crate::error::{RuntimeError, RuntimeResult};

/// 工作线程注册表
pub struct MachineRegistry {
    /// 线程记录槽位
    slots: Box<[OnceLock<Arc<Machine>>]>,
    /// 已占用的槽位数
    claimed: CachePadded<AtomicUsize>,
    /// 已发布的槽位数
    published: CachePadded<AtomicUsize>,
}

impl MachineRegistry {
    /// 创建指定容量的注册表
    pub fn with_capacity(capacity: usize) -> Self {
        let slots: Vec<_> = (0..capacity).map(|_| OnceLock::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            claimed: CachePadded::new(AtomicUsize::new(0)),
            published: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 注册新线程
    pub fn register(&self) -> RuntimeResult<Arc<Machine>> {
        let capacity = self.capacity();
        let id = self
            .claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| RuntimeError::ThreadLimit { max: capacity })?;

        let machine = Arc::clone(self.slots[id].get_or_init(|| Arc::new(Machine::new(id))));

        // 较早占位的线程发布之后才能发布自己
        let backoff = Backoff::new();
        while self
            .published
            .compare_exchange_weak(id, id + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        tracing::debug!(machine = id, "machine registered");
        Ok(machine)
    }

    /// 已发布的记录数
    #[inline]
    pub fn len(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// 检查是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按 ID 获取记录
    pub fn get(&self, id: MachineId) -> Option<&Arc<Machine>> {
        if id < self.len() {
            self.slots[id].get()
        } else {
            None
        }
    }

    /// 遍历调用时刻已发布的全部记录（按注册顺序）
    pub fn iter(&self) -> MachineIter<'_> {
        MachineIter {
            registry: self,
            next: 0,
            end: self.len(),
        }
    }
}

/// 注册表迭代器
pub struct MachineIter<'a> {
    registry: &'a MachineRegistry,
    next: usize,
    end: usize,
}

impl<'a> Iterator for MachineIter<'a> {
    type Item = &'a Arc<Machine>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.end {
            let idx = self.next;
            self.next += 1;
            if let Some(m) = self.registry.slots[idx].get() {
                return Some(m);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.next))
    }
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
