//! 调度器
//!
//! 持有注册表、计数器、调度配置、处理器集合和世界暂停器，
//! 并管理执行任务的工作线程。

use std::sync::atomic::{self, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::counters::CounterRegistry;
use super::machine::Machine;
use super::processor::ProcessorSet;
use super::registry::MachineRegistry;
use super::runtime::RuntimeConfig;
use super::safepoint::SafepointCoordinator;
use super::sched_config::SchedulerConfig;
use super::task::Task;
use super::world::{Pauser, WorldPauser};
use super::GoId;
use crate::error::{RuntimeError, RuntimeResult};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// 调度器
pub struct Scheduler {
    id: u64,
    /// 所有线程记录
    machines: Arc<MachineRegistry>,
    counters: CounterRegistry,
    config: Arc<SchedulerConfig>,
    processors: Arc<ProcessorSet>,
    world: Arc<WorldPauser>,
    coordinator: SafepointCoordinator,
    /// 任务通道，关闭后为 None
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    /// 调度器创建的工作线程
    spawned: Mutex<Vec<Arc<Machine>>>,
    /// 正在等待任务的工作线程数
    idle_machines: AtomicUsize,
    /// 任务 ID 计数器
    next_goid: AtomicU64,
    max_machines: usize,
    /// 启动和调整数量时预先创建的线程上限，其余按需创建
    eager_machines: usize,
    thread_prefix: String,
    start_time: Instant,
}

impl Scheduler {
    /// 创建调度器，`procs` 为初始处理器数量
    pub fn new(procs: usize, config: &RuntimeConfig) -> Arc<Self> {
        let machines = Arc::new(MachineRegistry::with_capacity(config.max_machines));
        let sched_config = Arc::new(SchedulerConfig::new(procs));
        let processors = Arc::new(ProcessorSet::new(Arc::clone(&sched_config)));
        let world = Arc::new(WorldPauser::with_timeout(config.stw_timeout));
        let coordinator = SafepointCoordinator::new(
            Arc::clone(&sched_config),
            Arc::clone(&processors),
            Arc::clone(&world) as Arc<dyn Pauser>,
        );
        let (sender, receiver) = crossbeam_channel::unbounded();

        Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            counters: CounterRegistry::new(Arc::clone(&machines)),
            machines,
            config: sched_config,
            processors,
            world,
            coordinator,
            sender: Mutex::new(Some(sender)),
            receiver,
            spawned: Mutex::new(Vec::new()),
            idle_machines: AtomicUsize::new(0),
            next_goid: AtomicU64::new(1),
            max_machines: config.max_machines,
            eager_machines: if config.eager_machines > 0 {
                config.eager_machines
            } else {
                super::num_processors()
            },
            thread_prefix: config.thread_prefix.clone(),
            start_time: Instant::now(),
        })
    }

    /// 启动调度器
    pub fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        let started = self.ensure_machines()?;
        tracing::debug!(
            scheduler = self.id,
            procs = self.config.current(),
            machines = started,
            "scheduler started"
        );
        Ok(())
    }

    /// 预先创建工作线程，数量不超过当前处理器数量和预创建上限
    ///
    /// 返回新创建的线程数量。
    pub fn ensure_machines(self: &Arc<Self>) -> RuntimeResult<usize> {
        self.spawn_machines(self.eager_machines)
    }

    /// 有积压任务、没有空闲线程且还有空闲处理器时再创建一个线程
    fn wake_machine(self: &Arc<Self>) {
        // 与 next_task 中的计数配对，保证至少一方看到对方的修改
        atomic::fence(Ordering::SeqCst);
        if self.receiver.len() <= self.idle_machines.load(Ordering::SeqCst) {
            return;
        }
        if self.processors.running() >= self.config.current() {
            return;
        }
        let target = self.spawned.lock().len() + 1;
        if let Err(err) = self.spawn_machines(target) {
            tracing::warn!(scheduler = self.id, error = %err, "failed to add machine for queued tasks");
        }
    }

    /// 把调度器线程补足到 `target`（同时受处理器数量和线程上限约束）
    ///
    /// 注册表已满或系统拒绝创建线程时，已有线程继续工作，只有一个线程都没有时才报错。
    fn spawn_machines(self: &Arc<Self>, target: usize) -> RuntimeResult<usize> {
        let mut spawned = self.spawned.lock();
        if !self.is_running() {
            return Ok(0);
        }

        let target = target.min(self.config.current()).min(self.max_machines);
        let mut started = 0;
        while spawned.len() < target {
            let result = self.machines.register().and_then(|m| match m.start(Arc::clone(self)) {
                Ok(()) => Ok(m),
                Err(err) => {
                    m.mark_dead();
                    Err(err)
                }
            });
            match result {
                Ok(m) => {
                    spawned.push(m);
                    started += 1;
                }
                Err(err) if spawned.is_empty() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        scheduler = self.id,
                        machines = spawned.len(),
                        target,
                        error = %err,
                        "running with fewer machines than requested"
                    );
                    break;
                }
            }
        }
        Ok(started)
    }

    /// 停止调度器
    ///
    /// 关闭任务通道；工作线程执行完剩余任务后退出。
    pub fn stop(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        let machines: Vec<_> = self.spawned.lock().clone();
        for m in machines.iter() {
            m.join();
        }
        tracing::debug!(scheduler = self.id, "scheduler stopped");
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// 生成新的任务 ID
    #[inline]
    pub fn next_goid(&self) -> GoId {
        self.next_goid.fetch_add(1, Ordering::Relaxed)
    }

    /// 创建并调度新任务
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> RuntimeResult<GoId>
    where
        F: FnOnce() + Send + 'static,
    {
        let goid = {
            let sender = self.sender.lock();
            let tx = sender.as_ref().ok_or(RuntimeError::ShutDown)?;

            let goid = self.next_goid();
            self.counters.task_created();
            if tx.send(Task::new(goid, f)).is_err() {
                self.counters.task_finished();
                return Err(RuntimeError::ShutDown);
            }
            goid
        };
        self.wake_machine();
        Ok(goid)
    }

    /// 取下一个任务（由 Machine 调用），通道关闭且为空时返回 None
    ///
    /// 取到任务后如果还有积压，尝试唤起另一个线程。
    pub(crate) fn next_task(self: &Arc<Self>) -> Option<Task> {
        self.idle_machines.fetch_add(1, Ordering::SeqCst);
        let task = self.receiver.recv().ok();
        self.idle_machines.fetch_sub(1, Ordering::SeqCst);
        if task.is_some() {
            self.wake_machine();
        }
        task
    }

    /// 修改处理器数量，返回修改前的数量
    pub fn set_processor_limit(&self, n: usize) -> usize {
        self.coordinator.request_processor_limit_change(n)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &Arc<SchedulerConfig> {
        &self.config
    }

    #[inline]
    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }

    #[inline]
    pub fn machines(&self) -> &Arc<MachineRegistry> {
        &self.machines
    }

    #[inline]
    pub fn processors(&self) -> &Arc<ProcessorSet> {
        &self.processors
    }

    #[inline]
    pub fn world(&self) -> &Arc<WorldPauser> {
        &self.world
    }

    #[inline]
    pub fn coordinator(&self) -> &SafepointCoordinator {
        &self.coordinator
    }

    /// 正在等待任务的工作线程数
    #[inline]
    pub fn idle_machines(&self) -> usize {
        self.idle_machines.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn thread_prefix(&self) -> &str {
        &self.thread_prefix
    }

    /// 获取运行时间
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let snap = self.config.read();
        SchedulerStats {
            processor_limit: snap.current,
            pending_limit: snap.pending,
            running_processors: self.processors.running(),
            idle_processors: self.processors.idle(),
            live_tasks: self.counters.active_task_count(),
            tasks_created: self.counters.tasks_created(),
            tasks_finished: self.counters.tasks_finished(),
            live_machines: self.counters.live_worker_count(),
            idle_machines: self.idle_machines(),
            total_machines: self.machines.len(),
            foreign_calls: self.counters.total_foreign_calls(),
            world_pauses: self.world.pauses(),
            limit_changes: self.coordinator.changes(),
            elapsed: self.elapsed(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("config", &self.config.read())
            .field("machines", &self.machines.len())
            .finish()
    }
}

/// 调度统计信息
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub processor_limit: usize,
    pub pending_limit: usize,
    pub running_processors: usize,
    pub idle_processors: usize,
    pub live_tasks: usize,
    pub tasks_created: u64,
    pub tasks_finished: u64,
    pub live_machines: usize,
    pub idle_machines: usize,
    pub total_machines: usize,
    pub foreign_calls: i64,
    pub world_pauses: u64,
    pub limit_changes: u64,
    pub elapsed: Duration,
}
