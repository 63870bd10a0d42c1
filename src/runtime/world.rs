//! 暂停世界 (Stop-the-world)
//!
//! 所有暂停（处理器数量调整、GC 等）都经过同一个 [`WorldPauser`]：
//! 先获取世界信号量，再等待所有活动线程到达安全点。
//! 同一时刻只有一个暂停者，两类暂停之间不会互相死锁。

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

use crate::error::{RuntimeError, RuntimeResult};

/// 暂停世界的能力接口
pub trait Pauser: Send + Sync {
    /// 暂停世界，返回时所有线程都处于安全点
    fn pause_world(&self, reason: &str) -> RuntimeResult<()>;

    /// 恢复世界
    fn resume_world(&self);

    /// 已执行的暂停次数
    fn pauses(&self) -> u64;

    /// 调用线程即将阻塞：如果它是活动线程，先进入安全状态
    fn enter_blocking(&self) -> bool {
        false
    }

    /// 阻塞结束，恢复 `enter_blocking` 之前的状态
    fn exit_blocking(&self, _was_active: bool) {}
}

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// 当前线程处于活动状态的世界（0 表示无）
    static ACTIVE_WORLD: Cell<u64> = const { Cell::new(0) };
    /// 恢复世界后需要重新进入的世界
    static REENTER_WORLD: Cell<u64> = const { Cell::new(0) };
}

struct WorldState {
    /// 是否正在暂停或已停止
    stopping: bool,
    /// 活动线程数量
    active: usize,
}

/// 世界暂停器
pub struct WorldPauser {
    id: u64,
    /// 世界信号量
    sema_held: Mutex<bool>,
    sema_cond: Condvar,
    state: Mutex<WorldState>,
    /// 活动线程降为 0
    stopped_cond: Condvar,
    /// 世界恢复
    resumed_cond: Condvar,
    /// 快速路径检查用
    stop_requested: AtomicBool,
    pauses: AtomicU64,
    /// 等待静止的时间上限，None 表示无限等待
    timeout: Option<Duration>,
}

impl WorldPauser {
    /// 创建暂停器
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    /// 创建带等待上限的暂停器
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            id: NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed),
            sema_held: Mutex::new(false),
            sema_cond: Condvar::new(),
            state: Mutex::new(WorldState {
                stopping: false,
                active: 0,
            }),
            stopped_cond: Condvar::new(),
            resumed_cond: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            pauses: AtomicU64::new(0),
            timeout,
        }
    }

    fn acquire_sema(&self) {
        let mut held = self.sema_held.lock();
        while *held {
            self.sema_cond.wait(&mut held);
        }
        *held = true;
    }

    fn release_sema(&self) {
        *self.sema_held.lock() = false;
        self.sema_cond.notify_one();
    }

    /// 进入世界成为活动线程；世界停止期间阻塞
    pub fn enter(&self) {
        debug_assert!(!self.is_active_here(), "thread entered the world twice");
        let mut st = self.state.lock();
        while st.stopping {
            self.resumed_cond.wait(&mut st);
        }
        st.active += 1;
        ACTIVE_WORLD.with(|a| a.set(self.id));
    }

    /// 离开世界，进入安全状态
    pub fn leave(&self) {
        debug_assert!(self.is_active_here(), "thread left a world it is not in");
        ACTIVE_WORLD.with(|a| a.set(0));
        let mut st = self.state.lock();
        st.active -= 1;
        if st.stopping && st.active == 0 {
            self.stopped_cond.notify_all();
        }
    }

    /// 安全点检查
    ///
    /// 有暂停请求时在此停下，世界恢复后返回 true。
    #[inline]
    pub fn poll(&self) -> bool {
        if !self.stop_requested.load(Ordering::Acquire) || !self.is_active_here() {
            return false;
        }
        self.leave();
        self.enter();
        true
    }

    /// 当前线程是否是这个世界的活动线程
    #[inline]
    pub fn is_active_here(&self) -> bool {
        ACTIVE_WORLD.with(|a| a.get() == self.id)
    }

    /// 是否有暂停请求
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// 活动线程数量
    pub fn active(&self) -> usize {
        self.state.lock().active
    }
}

impl Default for WorldPauser {
    fn default() -> Self {
        Self::new()
    }
}

impl Pauser for WorldPauser {
    fn pause_world(&self, reason: &str) -> RuntimeResult<()> {
        let was_active = self.enter_blocking();
        self.acquire_sema();

        let mut st = self.state.lock();
        st.stopping = true;
        self.stop_requested.store(true, Ordering::Release);
        self.pauses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(reason, active = st.active, "stopping the world");

        let deadline = self.timeout.map(|t| Instant::now() + t);
        while st.active > 0 {
            let Some(deadline) = deadline else {
                self.stopped_cond.wait(&mut st);
                continue;
            };
            if self.stopped_cond.wait_until(&mut st, deadline).timed_out() && st.active > 0 {
                let active = st.active;
                st.stopping = false;
                self.stop_requested.store(false, Ordering::Release);
                self.resumed_cond.notify_all();
                drop(st);
                self.release_sema();
                self.exit_blocking(was_active);
                return Err(RuntimeError::QuiescenceTimeout {
                    reason: reason.to_string(),
                    active,
                });
            }
        }
        drop(st);

        if was_active {
            REENTER_WORLD.with(|r| r.set(self.id));
        }
        tracing::debug!(reason, "world stopped");
        Ok(())
    }

    fn resume_world(&self) {
        let mut st = self.state.lock();
        st.stopping = false;
        self.stop_requested.store(false, Ordering::Release);
        self.resumed_cond.notify_all();
        drop(st);
        self.release_sema();
        tracing::debug!("world resumed");

        let reenter = REENTER_WORLD.with(|r| r.get() == self.id);
        if reenter {
            REENTER_WORLD.with(|r| r.set(0));
            self.enter();
        }
    }

    fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    fn enter_blocking(&self) -> bool {
        if self.is_active_here() {
            self.leave();
            true
        } else {
            false
        }
    }

    fn exit_blocking(&self, was_active: bool) {
        if was_active {
            self.enter();
        }
    }
}

impl std::fmt::Debug for WorldPauser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldPauser")
            .field("id", &self.id)
            .field("stop_requested", &self.is_stop_requested())
            .field("pauses", &self.pauses())
            .finish()
    }
}
