//! 任务
//!
//! G - 调度的基本单位。

use super::GoId;

/// 任务
pub struct Task {
    /// 任务唯一 ID
    pub id: GoId,
    body: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// 创建新的任务
    pub fn new<F>(id: GoId, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id,
            body: Box::new(body),
        }
    }

    /// 执行任务
    pub fn run(self) {
        (self.body)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}
