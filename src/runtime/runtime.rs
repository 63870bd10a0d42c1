//! 运行时入口
//!
//! 嵌入方调用的控制接口：查询和修改处理器数量、查询计数器。

use std::cell::RefCell;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use super::host::{HostEnvironment, NativeHost};
use super::machine::Machine;
use super::scheduler::{Scheduler, SchedulerStats};
use super::world::{Pauser, WorldPauser};
use super::GoId;
use crate::config::{DEFAULT_MAX_MACHINES, MACHINE_THREAD_PREFIX, MAX_PROCS, PROCS_ENV};
use crate::error::RuntimeResult;

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 初始处理器数量（0 表示使用 CPU 核心数）
    pub procs: usize,
    /// 工作线程数量上限
    pub max_machines: usize,
    /// 预先创建的工作线程上限（0 表示使用 CPU 核心数），超出部分在有积压任务时按需创建
    pub eager_machines: usize,
    /// 暂停世界时等待静止的上限，None 表示无限等待
    pub stw_timeout: Option<Duration>,
    /// 工作线程名称前缀
    pub thread_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            procs: 0,
            max_machines: DEFAULT_MAX_MACHINES,
            eager_machines: 0,
            stw_timeout: None,
            thread_prefix: MACHINE_THREAD_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// 默认配置，初始处理器数量可由 `QMAXPROCS` 覆盖
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_procs(env::var(PROCS_ENV).ok().as_deref()) {
            config.procs = n;
        }
        config
    }
}

/// 解析处理器数量覆盖值，只接受正整数
fn parse_procs(value: Option<&str>) -> Option<usize> {
    match value?.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        Ok(_) => None,
        Err(_) => {
            tracing::warn!(var = PROCS_ENV, "ignoring invalid processor count override");
            None
        }
    }
}

/// Q 语言运行时
///
/// 管理调度器并提供处理器数量控制和计数器查询。
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    host: Arc<dyn HostEnvironment>,
    /// 启动时的 CPU 数量
    ncpu: usize,
}

impl Runtime {
    /// 在本机环境上创建运行时
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Self::with_host(config, Arc::new(NativeHost))
    }

    /// 在指定宿主环境上创建运行时
    pub fn with_host(mut config: RuntimeConfig, host: Arc<dyn HostEnvironment>) -> RuntimeResult<Self> {
        let ncpu = host.num_cpu().max(1);
        if config.eager_machines == 0 {
            config.eager_machines = ncpu;
        }
        let mut procs = if config.procs > 0 { config.procs } else { ncpu };
        if !host.supports_parallelism() {
            procs = 1;
        }
        let procs = procs.min(MAX_PROCS);

        let scheduler = Scheduler::new(procs, &config);
        if let Err(err) = scheduler.start() {
            scheduler.stop();
            return Err(err);
        }
        Ok(Self {
            scheduler,
            host,
            ncpu,
        })
    }

    /// 修改处理器数量，返回修改前的数量
    ///
    /// `n < 1` 不做修改；宿主不支持并行时大于 1 的请求被压到 1。
    /// 数量真正变化时会暂停世界，返回时新数量已经生效。
    /// 工作线程只预先补到 CPU 数量，其余在有积压任务时按需创建。
    pub fn set_processor_limit(&self, n: i64) -> usize {
        let mut n = n;
        if n > 1 && !self.host.supports_parallelism() {
            tracing::warn!(requested = n, "host has no parallelism, clamping processor limit to 1");
            n = 1;
        }

        let current = self.scheduler.config().current();
        if n < 1 {
            return current;
        }

        let n = usize::try_from(n).unwrap_or(MAX_PROCS).min(MAX_PROCS);
        let previous = self.scheduler.set_processor_limit(n);
        if let Err(err) = self.scheduler.ensure_machines() {
            tracing::warn!(limit = n, error = %err, "could not add machines for new processor limit");
        }
        previous
    }

    /// 当前处理器数量
    #[inline]
    pub fn processor_limit(&self) -> usize {
        self.scheduler.config().current()
    }

    /// 启动时的 CPU 数量
    #[inline]
    pub fn num_cpu(&self) -> usize {
        self.ncpu
    }

    /// 存活任务数量
    #[inline]
    pub fn live_task_count(&self) -> usize {
        self.scheduler.counters().active_task_count()
    }

    /// 外部函数调用总数
    pub fn total_foreign_calls(&self) -> i64 {
        self.scheduler.counters().total_foreign_calls()
    }

    /// 存活线程数量
    pub fn live_worker_count(&self) -> usize {
        self.scheduler.counters().live_worker_count()
    }

    /// 创建新任务
    pub fn spawn<F>(&self, f: F) -> RuntimeResult<GoId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(f)
    }

    /// 执行一次外部函数调用并计数
    ///
    /// 非本运行时的线程第一次调用时会被登记为工作线程，线程退出时标记为死亡。
    /// 其他运行时的工作线程保留原来的绑定，安全点仍然对应自己的运行时。
    /// 注册表已满时调用仍然执行并计数，只是线程不被登记。
    pub fn foreign_call<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.current_machine() {
            Some(machine) => self.scheduler.counters().increment_foreign_calls(machine.id),
            None => self.scheduler.counters().increment_unregistered_foreign_calls(),
        }
        // 线程只在主运行时的世界中活动，由它进入安全状态
        let world = home_binding()
            .map(|(_, world)| world)
            .unwrap_or_else(|| Arc::clone(self.scheduler.world()));
        let was_active = world.enter_blocking();
        let result = f();
        world.exit_blocking(was_active);
        result
    }

    /// 当前线程在本运行时中的记录，没有时登记一条
    fn current_machine(&self) -> Option<Arc<Machine>> {
        let id = self.scheduler.id();
        let bound = BINDINGS.with(|c| {
            c.borrow()
                .iter()
                .find(|b| b.scheduler_id == id)
                .map(|b| Arc::clone(&b.machine))
        });
        if bound.is_some() {
            return bound;
        }

        let machine = match self.scheduler.machines().register() {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(scheduler = id, error = %err, "foreign call on an unregistered thread");
                return None;
            }
        };
        machine.bind_owner();
        bind_current_thread(ThreadBinding::new(
            id,
            Arc::clone(&machine),
            Arc::clone(self.scheduler.world()),
        ));
        Some(machine)
    }

    /// 共享的世界暂停器（供 GC 等组件使用）
    pub fn world(&self) -> &Arc<WorldPauser> {
        self.scheduler.world()
    }

    /// 调度器
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// 获取调度器统计信息
    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// 关闭运行时，等待已提交的任务执行完毕
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .field("ncpu", &self.ncpu)
            .finish()
    }
}

/// 线程与运行时的绑定
pub(crate) struct ThreadBinding {
    scheduler_id: u64,
    machine: Arc<Machine>,
    world: Arc<WorldPauser>,
}

impl ThreadBinding {
    pub(crate) fn new(scheduler_id: u64, machine: Arc<Machine>, world: Arc<WorldPauser>) -> Self {
        Self {
            scheduler_id,
            machine,
            world,
        }
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        self.machine.mark_dead();
    }
}

thread_local! {
    /// 当前线程在各个运行时中的绑定，每个调度器至多一个；
    /// 第一个是线程的主运行时（工作线程启动时绑定到自己的调度器）。
    static BINDINGS: RefCell<Vec<ThreadBinding>> = const { RefCell::new(Vec::new()) };
}

/// 添加当前线程的绑定，同一调度器已有绑定时不做修改
pub(crate) fn bind_current_thread(binding: ThreadBinding) {
    BINDINGS.with(|c| {
        let mut bindings = c.borrow_mut();
        if bindings.iter().all(|b| b.scheduler_id != binding.scheduler_id) {
            bindings.push(binding);
        }
    });
}

/// 主运行时的线程记录和世界暂停器
fn home_binding() -> Option<(Arc<Machine>, Arc<WorldPauser>)> {
    BINDINGS.with(|c| {
        c.borrow()
            .first()
            .map(|b| (Arc::clone(&b.machine), Arc::clone(&b.world)))
    })
}

/// 安全点
///
/// 在长时间运行的任务中调用；有暂停请求时在此等待世界恢复。
/// 非运行时线程上调用不做任何事。返回是否发生了等待。
pub fn safepoint() -> bool {
    home_binding().is_some_and(|(_, world)| world.poll())
}

/// 在当前线程的主运行时上执行一次外部函数调用并计数
///
/// 调用期间线程处于安全状态，不会阻塞暂停世界。
/// 非运行时线程上直接执行，不计数。
pub fn foreign_call<R>(f: impl FnOnce() -> R) -> R {
    let Some((machine, world)) = home_binding() else {
        return f();
    };

    machine.record_foreign_call();
    let was_active = world.enter_blocking();
    let result = f();
    world.exit_blocking(was_active);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::FixedHost;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn make_runtime(procs: usize) -> Runtime {
        let config = RuntimeConfig {
            procs,
            max_machines: 256,
            ..RuntimeConfig::default()
        };
        let host = FixedHost {
            parallel: true,
            ncpu: 4,
        };
        Runtime::with_host(config, Arc::new(host)).unwrap()
    }

    #[test]
    fn test_runtime_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.procs, 0);
        assert_eq!(config.max_machines, DEFAULT_MAX_MACHINES);
        assert!(config.stw_timeout.is_none());
    }

    #[test]
    fn test_parse_procs() {
        assert_eq!(parse_procs(Some("8")), Some(8));
        assert_eq!(parse_procs(Some(" 3 ")), Some(3));
        assert_eq!(parse_procs(Some("0")), None);
        assert_eq!(parse_procs(Some("-2")), None);
        assert_eq!(parse_procs(Some("many")), None);
        assert_eq!(parse_procs(None), None);
    }

    #[test]
    fn test_default_procs_from_host() {
        let rt = make_runtime(0);
        assert_eq!(rt.num_cpu(), 4);
        assert_eq!(rt.processor_limit(), 4);
    }

    #[test]
    fn test_set_then_get() {
        let rt = make_runtime(4);
        assert_eq!(rt.set_processor_limit(8), 4);
        assert_eq!(rt.processor_limit(), 8);
        assert_eq!(rt.set_processor_limit(1), 8);
        assert_eq!(rt.processor_limit(), 1);
        assert_eq!(rt.world().pauses(), 2);
    }

    #[test]
    fn test_same_limit_does_not_pause() {
        let rt = make_runtime(4);
        assert_eq!(rt.set_processor_limit(4), 4);
        assert_eq!(rt.world().pauses(), 0);
        assert_eq!(rt.processor_limit(), 4);
    }

    #[test]
    fn test_invalid_limit_is_noop() {
        let rt = make_runtime(4);
        assert_eq!(rt.set_processor_limit(0), 4);
        assert_eq!(rt.set_processor_limit(-5), 4);
        assert_eq!(rt.processor_limit(), 4);
        assert_eq!(rt.world().pauses(), 0);
    }

    #[test]
    fn test_single_threaded_host_clamps() {
        let config = RuntimeConfig {
            procs: 4,
            max_machines: 16,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::with_host(config, Arc::new(FixedHost::single_threaded())).unwrap();
        assert_eq!(rt.processor_limit(), 1);

        assert_eq!(rt.set_processor_limit(8), 1);
        assert_eq!(rt.processor_limit(), 1);
        assert_eq!(rt.world().pauses(), 0);
    }

    #[test]
    fn test_growth_spawns_machines() {
        let rt = make_runtime(1);
        assert_eq!(rt.live_worker_count(), 1);
        rt.set_processor_limit(3);
        assert_eq!(rt.live_worker_count(), 3);
    }

    #[test]
    fn test_huge_limit_spawns_bounded_machines() {
        let rt = make_runtime(1);
        assert_eq!(rt.set_processor_limit(1_000_000), 1);
        assert_eq!(rt.processor_limit(), 1_000_000);
        // 只预先补到 CPU 数量
        assert_eq!(rt.live_worker_count(), 4);
    }

    #[test]
    fn test_raise_limit_with_foreign_thread_registered() {
        let config = RuntimeConfig {
            procs: 1,
            max_machines: 4,
            ..RuntimeConfig::default()
        };
        let host = FixedHost {
            parallel: true,
            ncpu: 4,
        };
        let rt = Arc::new(Runtime::with_host(config, Arc::new(host)).unwrap());

        let remote = Arc::clone(&rt);
        thread::spawn(move || remote.foreign_call(|| ()))
            .join()
            .unwrap();
        assert_eq!(rt.scheduler().machines().len(), 2);

        // 注册表放不下全部线程时照常返回旧值
        assert_eq!(rt.set_processor_limit(4), 1);
        assert_eq!(rt.processor_limit(), 4);
        assert_eq!(rt.scheduler().machines().len(), 4);

        // 注册表已满，调用仍然计数
        rt.foreign_call(|| ());
        assert_eq!(rt.total_foreign_calls(), 2);

        let (tx, rx) = crossbeam_channel::bounded(1);
        rt.spawn(move || tx.send(()).unwrap()).unwrap();
        rx.recv().unwrap();
    }

    #[test]
    fn test_task_calling_into_second_runtime() {
        let a = Arc::new(make_runtime(1));
        let b = Arc::new(make_runtime(1));
        let stop = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        {
            let b = Arc::clone(&b);
            let stop = Arc::clone(&stop);
            a.spawn(move || {
                b.foreign_call(|| ());
                started_tx.send(()).unwrap();
                // 安全点仍然响应 A 的暂停
                while !stop.load(Ordering::SeqCst) {
                    safepoint();
                }
                done_tx.send(()).unwrap();
            })
            .unwrap();
        }
        started_rx.recv().unwrap();
        assert_eq!(a.live_worker_count(), 1);
        assert_eq!(b.live_worker_count(), 2);
        assert_eq!(a.total_foreign_calls(), 0);
        assert_eq!(b.total_foreign_calls(), 1);

        assert_eq!(a.set_processor_limit(2), 1);
        stop.store(true, Ordering::SeqCst);
        done_rx.recv().unwrap();
        assert_eq!(a.live_worker_count(), 2);

        // B 的外部调用期间线程对 A 处于安全状态
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        {
            let b = Arc::clone(&b);
            a.spawn(move || {
                b.foreign_call(|| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            })
            .unwrap();
        }
        entered_rx.recv().unwrap();
        assert_eq!(a.set_processor_limit(3), 2);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_concurrent_set_last_writer_wins() {
        let rt = Arc::new(make_runtime(4));
        let barrier = Arc::new(Barrier::new(2));

        let spawn_setter = |n: i64| {
            let rt = Arc::clone(&rt);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                rt.set_processor_limit(n);
                // 两个调用都返回后再观察
                barrier.wait();
                rt.processor_limit()
            })
        };
        let a = spawn_setter(8);
        let b = spawn_setter(2);
        let seen_a = a.join().unwrap();
        let seen_b = b.join().unwrap();

        let last = rt.processor_limit();
        assert!(last == 8 || last == 2);
        assert_eq!(seen_a, last);
        assert_eq!(seen_b, last);
        assert_eq!(rt.stats().pending_limit, 0);
    }

    #[test]
    fn test_limit_bounds_concurrency() {
        let rt = make_runtime(4);
        rt.set_processor_limit(2);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..32 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            rt.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..32 {
            rx.recv().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        while !cond() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_task_counts_across_reconfiguration() {
        let rt = Arc::new(make_runtime(2));
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let setter = {
            let rt = Arc::clone(&rt);
            thread::spawn(move || {
                for n in [3, 1, 4, 2, 5, 6] {
                    rt.set_processor_limit(n);
                }
            })
        };
        // 10 个任务立即完成，2 个任务在外部调用中等待放行
        for i in 0..12 {
            let release_rx = release_rx.clone();
            let done_tx = done_tx.clone();
            rt.spawn(move || {
                if i % 6 == 0 {
                    foreign_call(|| release_rx.recv().unwrap());
                }
                done_tx.send(()).unwrap();
            })
            .unwrap();
        }
        setter.join().unwrap();

        for _ in 0..10 {
            done_rx.recv().unwrap();
        }
        wait_for(|| rt.stats().tasks_finished == 10);
        assert_eq!(rt.live_task_count(), 2);

        for _ in 0..2 {
            release_tx.send(()).unwrap();
        }
        for _ in 0..2 {
            done_rx.recv().unwrap();
        }
        wait_for(|| rt.live_task_count() == 0);
        assert_eq!(rt.stats().tasks_created, 12);
        assert_eq!(rt.total_foreign_calls(), 2);
    }

    #[test]
    fn test_task_sets_limit() {
        let rt = Arc::new(make_runtime(2));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = Arc::clone(&rt);
        rt.spawn(move || {
            // 活动线程自己调整数量不会等待自己
            let prev = inner.set_processor_limit(3);
            tx.send(prev).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rt.processor_limit(), 3);
    }

    #[test]
    fn test_gc_pause_races_reconfiguration() {
        let rt = Arc::new(make_runtime(2));
        let world = Arc::clone(rt.world());

        let gc = thread::spawn(move || {
            for _ in 0..50 {
                world.pause_world("GC").unwrap();
                world.resume_world();
            }
        });
        for n in 1..=20 {
            rt.set_processor_limit(n);
            rt.spawn(|| {
                safepoint();
            })
            .unwrap();
        }
        gc.join().unwrap();
        assert_eq!(rt.processor_limit(), 20);
        assert!(rt.world().pauses() >= 50 + 19);
    }

    #[test]
    fn test_foreign_call_registers_thread() {
        let rt = Arc::new(make_runtime(1));
        assert_eq!(rt.live_worker_count(), 1);

        let value = rt.foreign_call(|| 7);
        assert_eq!(value, 7);
        rt.foreign_call(|| ());
        assert_eq!(rt.total_foreign_calls(), 2);
        // 当前测试线程被登记一次
        assert_eq!(rt.scheduler().machines().len(), 2);

        let remote = Arc::clone(&rt);
        thread::spawn(move || {
            remote.foreign_call(|| ());
        })
        .join()
        .unwrap();
        assert_eq!(rt.total_foreign_calls(), 3);
        assert_eq!(rt.scheduler().machines().len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_set_then_get(start in 1usize..=8, n in -4i64..=24) {
            let rt = make_runtime(start);
            let previous = rt.set_processor_limit(n);
            prop_assert_eq!(previous, start);
            let expected = if n >= 1 { n as usize } else { start };
            prop_assert_eq!(rt.processor_limit(), expected);
            let paused = u64::from(expected != start);
            prop_assert_eq!(rt.world().pauses(), paused);
        }
    }

    #[test]
    fn test_free_functions_outside_runtime() {
        assert!(!safepoint());
        assert_eq!(foreign_call(|| 1 + 1), 2);
    }
}
