//! 宿主环境能力查询

/// 宿主环境
pub trait HostEnvironment: Send + Sync {
    /// 是否支持真正的多线程并行
    fn supports_parallelism(&self) -> bool;

    /// 启动时可用的逻辑 CPU 数量
    fn num_cpu(&self) -> usize;
}

/// 本机环境
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeHost;

impl HostEnvironment for NativeHost {
    fn supports_parallelism(&self) -> bool {
        // WebAssembly 目前没有线程
        !cfg!(target_arch = "wasm32")
    }

    fn num_cpu(&self) -> usize {
        super::num_processors()
    }
}

/// 固定能力的宿主环境，用于嵌入方显式声明
#[derive(Debug, Clone, Copy)]
pub struct FixedHost {
    pub parallel: bool,
    pub ncpu: usize,
}

impl FixedHost {
    /// 单线程宿主
    pub fn single_threaded() -> Self {
        Self {
            parallel: false,
            ncpu: 1,
        }
    }
}

impl HostEnvironment for FixedHost {
    fn supports_parallelism(&self) -> bool {
        self.parallel
    }

    fn num_cpu(&self) -> usize {
        self.ncpu
    }
}
