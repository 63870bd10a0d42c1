//! 逻辑处理器 (Processor)
//!
//! P - 执行许可。工作线程必须持有一个 P 才能运行任务，
//! 同时被持有的 P 数量由调度配置中的当前处理器数量限制。

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

use super::machine::MachineId;
use super::sched_config::SchedulerConfig;

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲
    Idle = 0,
    /// 运行中
    Running = 1,
    /// 超出当前处理器数量，停用
    Stopped = 2,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Running,
            _ => ProcessorStatus::Stopped,
        }
    }
}

const NO_MACHINE: u64 = u64::MAX;

/// 逻辑处理器
pub struct Processor {
    /// 处理器 ID
    pub id: usize,
    /// 处理器状态
    status: AtomicU8,
    /// 关联的 Machine ID
    machine_id: AtomicU64,
    /// 调度计数
    schedule_count: AtomicU64,
}

impl Processor {
    /// 创建新的处理器
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            machine_id: AtomicU64::new(NO_MACHINE),
            schedule_count: AtomicU64::new(0),
        }
    }

    /// 获取处理器状态
    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    fn set_status(&self, status: ProcessorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 绑定到 Machine
    fn bind_machine(&self, machine_id: MachineId) {
        self.machine_id.store(machine_id as u64, Ordering::Release);
        self.set_status(ProcessorStatus::Running);
    }

    /// 解绑 Machine
    fn unbind_machine(&self, status: ProcessorStatus) {
        self.machine_id.store(NO_MACHINE, Ordering::Release);
        self.set_status(status);
    }

    /// 获取关联的 Machine ID
    #[inline]
    pub fn machine_id(&self) -> Option<MachineId> {
        match self.machine_id.load(Ordering::Acquire) {
            NO_MACHINE => None,
            id => Some(id as MachineId),
        }
    }

    /// 增加调度计数
    pub fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("machine_id", &self.machine_id())
            .finish()
    }
}

struct ProcState {
    /// 创建过的所有处理器，下标即 ID
    allp: Vec<Arc<Processor>>,
    /// 空闲处理器 ID，栈顶为最小 ID
    idle: Vec<usize>,
    /// 正在运行的处理器数量
    running: usize,
}

/// 处理器集合
///
/// 处理器按需创建。任何时刻 ID 小于当前数量的处理器要么运行中要么空闲，
/// 其余的处理器在被释放时停用。
pub struct ProcessorSet {
    config: Arc<SchedulerConfig>,
    state: Mutex<ProcState>,
    cond: Condvar,
}

impl ProcessorSet {
    pub fn new(config: Arc<SchedulerConfig>) -> Self {
        Self {
            config,
            state: Mutex::new(ProcState {
                allp: Vec::new(),
                idle: Vec::new(),
                running: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// 获取一个处理器，超出当前数量时阻塞
    pub fn acquire(&self, machine_id: MachineId) -> Arc<Processor> {
        let mut st = self.state.lock();
        loop {
            let limit = self.config.current();
            if st.running < limit {
                let p = if let Some(id) = st.idle.pop() {
                    Some(Arc::clone(&st.allp[id]))
                } else if st.allp.len() < limit {
                    let p = Arc::new(Processor::new(st.allp.len()));
                    st.allp.push(Arc::clone(&p));
                    Some(p)
                } else {
                    None
                };
                if let Some(p) = p {
                    st.running += 1;
                    p.bind_machine(machine_id);
                    return p;
                }
            }
            self.cond.wait(&mut st);
        }
    }

    /// 归还处理器
    pub fn release(&self, p: Arc<Processor>) {
        let mut st = self.state.lock();
        st.running -= 1;
        if p.id < self.config.current() {
            p.unbind_machine(ProcessorStatus::Idle);
            st.idle.push(p.id);
            st.idle.sort_unstable_by(|a, b| b.cmp(a));
        } else {
            p.unbind_machine(ProcessorStatus::Stopped);
        }
        drop(st);
        self.cond.notify_one();
    }

    /// 应用待生效的处理器数量并调整集合
    ///
    /// 只能在世界停止时调用。配置修改和空闲列表重建在同一把锁内完成，
    /// 与并发的 `release` 不会交错。
    pub fn resize_to_pending(&self) -> Option<(usize, usize)> {
        let mut st = self.state.lock();
        let (old, new) = self.config.apply_pending()?;

        let mut idle = Vec::new();
        for p in st.allp.iter() {
            match p.status() {
                ProcessorStatus::Running => {}
                _ if p.id < new => {
                    p.set_status(ProcessorStatus::Idle);
                    idle.push(p.id);
                }
                _ => p.set_status(ProcessorStatus::Stopped),
            }
        }
        idle.reverse();
        st.idle = idle;
        drop(st);

        self.cond.notify_all();
        Some((old, new))
    }

    /// 正在运行的处理器数量
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// 空闲处理器数量
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// 创建过的处理器
    pub fn processors(&self) -> Vec<Arc<Processor>> {
        self.state.lock().allp.clone()
    }
}
