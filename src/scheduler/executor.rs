use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, time::DelayQueue};
use tracing::{error, trace};

use crate::{common::panic_message, scheduler::ExecutorMetrics};

/// 提交给执行器的最小单元
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Submission {
    pub job: Job,
    pub delay: Duration,
}

/// 串行执行器 (The Backbone)
///
/// 单个 Tokio 任务持有一个 `DelayQueue`，按到期时间依次取出任务并同步执行。
/// 同一时刻只会有一个任务在跑，所以所有 Bridge 轮询和 Binding Tick 之间天然互斥；
/// 慢任务会把排在它后面的所有任务一起往后拖 (隐式背压)。
pub(crate) struct SerialExecutor {
    pub name: String,
    pub rx: mpsc::UnboundedReceiver<Submission>,
    pub shutdown: CancellationToken,
    pub terminated: CancellationToken,
    pub metrics: Arc<ExecutorMetrics>,
}

impl SerialExecutor {
    /// 主循环
    ///
    /// 停机流程:
    /// 1. 收到 shutdown 信号后关闭接收端，不再接受新提交。
    /// 2. 通道里已经缓冲的提交仍会被读出并入队。
    /// 3. 队列排空后退出，并触发 `terminated`。
    pub async fn run(self) {
        let SerialExecutor {
            name,
            mut rx,
            shutdown,
            terminated,
            metrics,
        } = self;
        let mut queue: DelayQueue<Job> = DelayQueue::new();
        let mut closing = false;
        let mut open = true;

        trace!("[Scheduler-{}] Executor started.", name);
        loop {
            if !open && queue.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !closing => {
                    trace!(
                        "[Scheduler-{}] Shutdown requested, draining {} queued jobs.",
                        name,
                        queue.len()
                    );
                    closing = true;
                    rx.close();
                }
                submission = rx.recv(), if open => match submission {
                    Some(Submission { job, delay }) => {
                        queue.insert(job, delay);
                    }
                    None => open = false,
                },
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    Self::run_job(&name, &metrics, expired.into_inner());
                }
                else => break,
            }
        }
        trace!("[Scheduler-{}] Executor terminated.", name);
        terminated.cancel();
    }

    fn run_job(name: &str, metrics: &ExecutorMetrics, job: Job) {
        let result = std::panic::catch_unwind(AssertUnwindSafe(job));
        metrics.inc_executed();
        if let Err(panic_err) = result {
            metrics.inc_panicked();
            error!(
                "[Scheduler-{}] Job panicked: {}",
                name,
                panic_message(panic_err.as_ref())
            );
        }
    }
}
