use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 串行执行器核心指标
// 使用 Atomic 保证多线程提交下的计数性能
#[derive(Debug, Default, Serialize)]
pub struct ExecutorMetrics {
    /// 成功进入队列的任务数
    pub submitted: AtomicU64,
    /// 已执行完毕的任务数 (包括 panic 的)
    pub executed: AtomicU64,
    /// 执行过程中 panic 的任务数
    pub panicked: AtomicU64,
    /// 因停机被拒绝的提交数
    pub rejected: AtomicU64,
}

impl ExecutorMetrics {
    pub fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
