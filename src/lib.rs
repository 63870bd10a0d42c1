//! Q 语言运行时调度核心
//!
//! 运行中调整处理器数量（暂停世界 → 应用 → 恢复），
//! 以及无锁的任务、线程和外部函数调用计数。

pub mod config;
pub mod error;
pub mod runtime;

pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{Runtime, RuntimeConfig};
