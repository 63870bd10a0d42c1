//! 配置常量模块
//!
//! 运行时可调整的常量都在这里定义，便于后期修改

/// 运行时名称
pub const RUNTIME_NAME: &str = "qsched";

/// 启动时覆盖处理器数量的环境变量
pub const PROCS_ENV: &str = "QMAXPROCS";

/// 日志过滤环境变量（优先于 RUST_LOG）
pub const LOG_ENV: &str = "QSCHED_LOG";

/// 工作线程数量上限
pub const DEFAULT_MAX_MACHINES: usize = 10_000;

/// 处理器数量上限（由 SchedulerConfig 的打包格式决定）
pub const MAX_PROCS: usize = u32::MAX as usize;

/// 工作线程名称前缀
pub const MACHINE_THREAD_PREFIX: &str = "machine";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
