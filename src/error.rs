//! 运行时错误定义
//!
//! 控制接口本身从不向调用者返回错误；这里的错误只在运行时内部传递，
//! 到达无法恢复的地方时通过 [`fatal`] 终止进程。

use std::io;
use thiserror::Error;

/// 运行时错误
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// 暂停世界时等待超时，仍有工作线程处于活动状态
    #[error("stop-the-world for {reason} timed out with {active} machine(s) still active")]
    QuiescenceTimeout { reason: String, active: usize },

    /// 工作线程注册表已满
    #[error("program exceeds {max}-thread limit")]
    ThreadLimit { max: usize },

    /// 创建操作系统线程失败
    #[error("failed to spawn machine thread: {0}")]
    ThreadSpawn(#[from] io::Error),

    /// 运行时已关闭
    #[error("runtime has been shut down")]
    ShutDown,
}

/// 运行时结果类型
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// 致命错误：记录日志后立即终止进程
///
/// 调度器无法到达安全点时，之后的任何修改都无法保证正确。
pub fn fatal(err: &RuntimeError) -> ! {
    tracing::error!(error = %err, "fatal runtime error");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::QuiescenceTimeout {
            reason: "GOMAXPROCS".to_string(),
            active: 2,
        };
        assert_eq!(
            err.to_string(),
            "stop-the-world for GOMAXPROCS timed out with 2 machine(s) still active"
        );
        assert_eq!(
            RuntimeError::ThreadLimit { max: 10_000 }.to_string(),
            "program exceeds 10000-thread limit"
        );
        assert_eq!(RuntimeError::ShutDown.to_string(), "runtime has been shut down");
    }

    #[test]
    fn test_spawn_error_from_io() {
        let err: RuntimeError = io::Error::new(io::ErrorKind::Other, "no threads").into();
        assert!(matches!(err, RuntimeError::ThreadSpawn(_)));
        assert!(err.to_string().contains("no threads"));
    }
}
