//! 安全点协调器
//!
//! 修改处理器数量的唯一路径：暂停世界、应用新数量、恢复世界。
//! 整个过程由一把重配置锁串行化，开始暂停后不可取消。

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use super::processor::ProcessorSet;
use super::sched_config::SchedulerConfig;
use super::world::Pauser;
use crate::error::fatal;

/// 暂停原因
const REASON: &str = "GOMAXPROCS";

/// 安全点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafepointState {
    /// 正常运行
    Running = 0,
    /// 已请求暂停
    PauseRequested = 1,
    /// 世界已停止
    WorldStopped = 2,
    /// 已请求恢复
    ResumeRequested = 3,
}

impl From<u8> for SafepointState {
    fn from(v: u8) -> Self {
        match v {
            0 => SafepointState::Running,
            1 => SafepointState::PauseRequested,
            2 => SafepointState::WorldStopped,
            _ => SafepointState::ResumeRequested,
        }
    }
}

/// 安全点协调器
pub struct SafepointCoordinator {
    /// 重配置锁
    gate: Mutex<()>,
    state: AtomicU8,
    config: Arc<SchedulerConfig>,
    processors: Arc<ProcessorSet>,
    pauser: Arc<dyn Pauser>,
    /// 已完成的数量调整次数
    changes: AtomicU64,
}

impl SafepointCoordinator {
    pub fn new(
        config: Arc<SchedulerConfig>,
        processors: Arc<ProcessorSet>,
        pauser: Arc<dyn Pauser>,
    ) -> Self {
        Self {
            gate: Mutex::new(()),
            state: AtomicU8::new(SafepointState::Running as u8),
            config,
            processors,
            pauser,
            changes: AtomicU64::new(0),
        }
    }

    /// 当前状态
    #[inline]
    pub fn state(&self) -> SafepointState {
        SafepointState::from(self.state.load(Ordering::Acquire))
    }

    /// 已完成的数量调整次数
    #[inline]
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    /// 请求修改处理器数量，返回修改前的数量
    ///
    /// `n` 必须 ≥ 1。与当前数量相同时直接返回，不暂停世界。
    /// 世界无法静止属于致命错误。
    pub fn request_processor_limit_change(&self, n: usize) -> usize {
        debug_assert!(n >= 1, "processor limit must be positive");

        let current = self.config.current();
        if n == current {
            return current;
        }

        // 等待重配置锁前先离开世界，否则持锁者会一直等我们到达安全点
        let was_active = self.pauser.enter_blocking();
        let previous = {
            let _gate = self.gate.lock();
            let previous = self.config.current();
            if n != previous {
                self.stop_apply_start(n);
            }
            previous
        };
        self.pauser.exit_blocking(was_active);
        previous
    }

    fn stop_apply_start(&self, n: usize) {
        self.transition(SafepointState::Running, SafepointState::PauseRequested);
        if let Err(err) = self.pauser.pause_world(REASON) {
            fatal(&err);
        }
        self.transition(SafepointState::PauseRequested, SafepointState::WorldStopped);

        self.config.set_pending(n);
        if let Some((old, new)) = self.processors.resize_to_pending() {
            tracing::info!(old, new, "processor limit changed");
        }

        self.transition(SafepointState::WorldStopped, SafepointState::ResumeRequested);
        self.pauser.resume_world();
        self.transition(SafepointState::ResumeRequested, SafepointState::Running);
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn transition(&self, from: SafepointState, to: SafepointState) {
        let prev = SafepointState::from(self.state.swap(to as u8, Ordering::AcqRel));
        debug_assert_eq!(prev, from, "unexpected safepoint transition");
        tracing::trace!(?from, ?to, "safepoint transition");
    }
}

impl std::fmt::Debug for SafepointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointCoordinator")
            .field("state", &self.state())
            .field("changes", &self.changes())
            .finish()
    }
}
