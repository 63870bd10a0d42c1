//! 协程运行时模块
//!
//! 类似 Go 语言的 M:P 调度核心，负责在运行中安全地调整并行度：
//!
//! 核心组件：
//! - M (Machine): 操作系统线程，记录永不删除
//! - P (Processor): 执行许可，数量受当前处理器数量限制
//! - 世界暂停器：所有暂停共用的静止协议
//! - 安全点协调器：暂停世界、应用新数量、恢复世界

pub mod counters;
pub mod host;
pub mod machine;
pub mod processor;
pub mod registry;
pub mod runtime;
pub mod safepoint;
pub mod sched_config;
pub mod scheduler;
pub mod task;
pub mod world;

pub use counters::{CounterRegistry, TaskCounter};
pub use host::{FixedHost, HostEnvironment, NativeHost};
pub use machine::{Machine, MachineId};
pub use processor::{Processor, ProcessorSet, ProcessorStatus};
pub use registry::MachineRegistry;
pub use runtime::{foreign_call, safepoint, Runtime, RuntimeConfig};
pub use safepoint::{SafepointCoordinator, SafepointState};
pub use sched_config::{ProcsSnapshot, SchedulerConfig};
pub use scheduler::{Scheduler, SchedulerStats};
pub use world::{Pauser, WorldPauser};

/// 任务 ID 类型
pub type GoId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
