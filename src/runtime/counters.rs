//! 计数器
//!
//! 任务计数和外部函数调用计数。写路径只碰自己的计数器，
//! 读路径遍历注册表求和，不需要暂停任何线程。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use crossbeam_utils::CachePadded;

use super::machine::MachineId;
use super::registry::MachineRegistry;

/// 任务计数器
///
/// 创建和完成分别单调递增，存活数量为两者之差，因此永远不会为负。
#[derive(Debug, Default)]
pub struct TaskCounter {
    created: CachePadded<AtomicU64>,
    finished: CachePadded<AtomicU64>,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn created(&self) {
        self.created.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn finished(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    /// 存活任务数量
    #[inline]
    pub fn live(&self) -> usize {
        // 先读完成数：同一任务的创建总是先于完成被计入
        let finished = self.finished.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        created.saturating_sub(finished) as usize
    }

    #[inline]
    pub fn total_created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total_finished(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }
}

/// 计数器注册表
pub struct CounterRegistry {
    machines: Arc<MachineRegistry>,
    tasks: TaskCounter,
    /// 注册表已满时未登记线程的外部函数调用
    unregistered_calls: CachePadded<AtomicU64>,
}

impl CounterRegistry {
    pub fn new(machines: Arc<MachineRegistry>) -> Self {
        Self {
            machines,
            tasks: TaskCounter::new(),
            unregistered_calls: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// 为指定线程记录一次外部函数调用
    ///
    /// 只有该记录的拥有者线程可以写入，其他线程的调用被忽略。
    pub(crate) fn increment_foreign_calls(&self, id: MachineId) {
        if let Some(m) = self.machines.get(id) {
            m.record_foreign_call();
        }
    }

    /// 记录一次没有线程记录的外部函数调用
    pub(crate) fn increment_unregistered_foreign_calls(&self) {
        self.unregistered_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// 所有线程的外部函数调用总数
    pub fn total_foreign_calls(&self) -> i64 {
        let registered: i64 = self
            .machines
            .iter()
            .map(|m| m.foreign_calls() as i64)
            .sum();
        registered + self.unregistered_calls.load(Ordering::Acquire) as i64
    }

    /// 存活任务数量
    #[inline]
    pub fn active_task_count(&self) -> usize {
        self.tasks.live()
    }

    /// 存活线程数量
    pub fn live_worker_count(&self) -> usize {
        self.machines.iter().filter(|m| m.is_alive()).count()
    }

    #[inline]
    pub fn task_created(&self) {
        self.tasks.created();
    }

    #[inline]
    pub fn task_finished(&self) {
        self.tasks.finished();
    }

    pub fn tasks_created(&self) -> u64 {
        self.tasks.total_created()
    }

    pub fn tasks_finished(&self) -> u64 {
        self.tasks.total_finished()
    }
}
