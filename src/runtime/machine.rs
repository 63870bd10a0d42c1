//! 工作线程 (Machine)
//!
//! M - 操作系统线程。每个参与调度的线程对应一条记录，记录永不删除，
//! 线程退出后只标记为死亡，保证其他线程可以无锁遍历。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::runtime::{bind_current_thread, ThreadBinding};
use super::scheduler::Scheduler;
use super::task::Task;
use crate::error::RuntimeResult;

/// 工作线程 ID（即注册表中的槽位下标）
pub type MachineId = usize;

/// 工作线程记录
pub struct Machine {
    /// 线程 ID
    pub id: MachineId,
    /// 拥有者线程是否存活
    alive: AtomicBool,
    /// 外部函数调用次数（只由拥有者线程写入）
    ncgocall: CachePadded<AtomicU64>,
    /// 执行的任务数量
    tasks_executed: AtomicU64,
    /// 拥有者线程
    owner: OnceLock<ThreadId>,
    /// OS 线程句柄（仅调度器创建的线程）
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Machine {
    /// 创建新的线程记录
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            ncgocall: CachePadded::new(AtomicU64::new(0)),
            tasks_executed: AtomicU64::new(0),
            owner: OnceLock::new(),
            thread: Mutex::new(None),
        }
    }

    /// 检查拥有者线程是否存活
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// 标记为死亡（记录本身保留）
    pub fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!(machine = self.id, "machine retired");
        }
    }

    /// 将当前线程登记为拥有者
    pub fn bind_owner(&self) {
        let _ = self.owner.set(thread::current().id());
    }

    /// 当前线程是否为拥有者
    pub fn is_owned_by_current(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// 记录一次外部函数调用，返回是否计入
    ///
    /// 只有拥有者线程写这个计数器，因此读-改-写不需要原子 RMW；
    /// 其他线程的调用被忽略。
    #[inline]
    pub(crate) fn record_foreign_call(&self) -> bool {
        if !self.is_owned_by_current() {
            tracing::warn!(machine = self.id, "foreign call recorded from a thread that does not own the machine");
            return false;
        }
        let n = self.ncgocall.load(Ordering::Relaxed);
        self.ncgocall.store(n + 1, Ordering::Release);
        true
    }

    /// 获取外部函数调用次数
    #[inline]
    pub fn foreign_calls(&self) -> u64 {
        self.ncgocall.load(Ordering::Acquire)
    }

    /// 获取执行的任务数量
    #[inline]
    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// 启动工作线程
    pub fn start(self: &Arc<Self>, scheduler: Arc<Scheduler>) -> RuntimeResult<()> {
        let machine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", scheduler.thread_prefix(), self.id))
            .spawn(move || {
                machine.run_loop(&scheduler);
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// 主执行循环
    ///
    /// 取任务时不持有处理器也不算活动线程；拿到处理器后才进入世界执行任务。
    fn run_loop(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        self.bind_owner();
        bind_current_thread(ThreadBinding::new(
            scheduler.id(),
            Arc::clone(self),
            Arc::clone(scheduler.world()),
        ));
        tracing::debug!(machine = self.id, "machine started");

        while let Some(task) = scheduler.next_task() {
            let p = scheduler.processors().acquire(self.id);
            scheduler.world().enter();
            p.inc_schedule_count();
            self.execute(task, scheduler);
            scheduler.world().leave();
            scheduler.processors().release(p);
        }

        self.mark_dead();
    }

    /// 执行任务
    fn execute(&self, task: Task, scheduler: &Scheduler) {
        let id = task.id;
        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            tracing::error!(machine = self.id, task = id, "task panicked");
        }
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        scheduler.counters().task_finished();
    }

    /// 等待线程结束
    pub fn join(&self) {
        if self.is_owned_by_current() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("foreign_calls", &self.foreign_calls())
            .field("tasks_executed", &self.tasks_executed())
            .finish()
    }
}
