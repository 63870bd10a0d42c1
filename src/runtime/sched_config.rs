//! 全局调度配置
//!
//! 当前处理器数量和待生效的处理器数量打包在同一个原子字里，
//! 读者一次加载就能拿到一致的一对值。

use std::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

use crate::config::MAX_PROCS;

/// 配置快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcsSnapshot {
    /// 当前处理器数量（≥ 1）
    pub current: usize,
    /// 待生效的处理器数量（0 表示无）
    pub pending: usize,
}

#[inline]
fn pack(current: usize, pending: usize) -> u64 {
    ((current as u64) << 32) | (pending as u64 & 0xFFFF_FFFF)
}

#[inline]
fn unpack(word: u64) -> ProcsSnapshot {
    ProcsSnapshot {
        current: (word >> 32) as usize,
        pending: (word & 0xFFFF_FFFF) as usize,
    }
}

/// 调度配置
///
/// 只有协调器在世界停止时才会修改；安全点之外 `current` 不变，
/// 工作线程可以在一个调度周期内缓存它。
#[derive(Debug)]
pub struct SchedulerConfig {
    word: CachePadded<AtomicU64>,
}

impl SchedulerConfig {
    /// 创建配置
    pub fn new(current: usize) -> Self {
        let current = current.clamp(1, MAX_PROCS);
        Self {
            word: CachePadded::new(AtomicU64::new(pack(current, 0))),
        }
    }

    /// 读取一致的快照
    #[inline]
    pub fn read(&self) -> ProcsSnapshot {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// 当前处理器数量
    #[inline]
    pub fn current(&self) -> usize {
        self.read().current
    }

    /// 待生效的处理器数量
    #[inline]
    pub fn pending(&self) -> usize {
        self.read().pending
    }

    /// 记录待生效的处理器数量（世界停止时由协调器调用）
    pub(crate) fn set_pending(&self, n: usize) {
        let n = n.clamp(1, MAX_PROCS);
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(unpack(word).current, n))
            });
    }

    /// 应用待生效的数量并清零，返回 `(旧值, 新值)`
    ///
    /// 没有待生效的值时返回 `None`。
    pub(crate) fn apply_pending(&self) -> Option<(usize, usize)> {
        let prev = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let snap = unpack(word);
                (snap.pending != 0).then(|| pack(snap.pending, 0))
            })
            .ok()?;
        let snap = unpack(prev);
        Some((snap.current, snap.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = SchedulerConfig::new(4);
        assert_eq!(config.read(), ProcsSnapshot { current: 4, pending: 0 });

        // 0 被规范化为 1
        assert_eq!(SchedulerConfig::new(0).current(), 1);
    }

    #[test]
    fn test_apply_pending_consumed_once() {
        let config = SchedulerConfig::new(4);
        assert_eq!(config.apply_pending(), None);

        config.set_pending(8);
        assert_eq!(config.read(), ProcsSnapshot { current: 4, pending: 8 });

        assert_eq!(config.apply_pending(), Some((4, 8)));
        assert_eq!(config.read(), ProcsSnapshot { current: 8, pending: 0 });
        assert_eq!(config.apply_pending(), None);
        assert_eq!(config.current(), 8);
    }

    #[test]
    fn test_large_limit() {
        let config = SchedulerConfig::new(MAX_PROCS);
        assert_eq!(config.current(), MAX_PROCS);
        config.set_pending(MAX_PROCS - 1);
        assert_eq!(config.apply_pending(), Some((MAX_PROCS, MAX_PROCS - 1)));
    }
}
