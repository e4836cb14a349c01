use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    common::{Result, SchedulerConfig, SchedulerError, TimeUtils},
    scheduler::{
        ExecutorMetrics,
        executor::{Job, SerialExecutor, Submission},
    },
};

struct ContextInner {
    tx: mpsc::UnboundedSender<Submission>,
    config: SchedulerConfig,
    min_delay: Duration,
    /// 是否还接受新提交
    accepting: AtomicBool,
    /// 关机信号
    shutdown: CancellationToken,
    /// 执行器退出信号
    terminated: CancellationToken,
    metrics: Arc<ExecutorMetrics>,
}

/// 调度上下文 (Scheduler Context)
///
/// **职责**:
/// 整个进程共享的唯一串行执行器的句柄。所有 Bridge 的轮询和所有 Binding 的 Tick 都提交到这里。
///
/// **生命周期**:
/// - `configure` 创建一次，然后 Clone 给每一个 Bridge 和 Binding (显式注入，没有全局变量)。
/// - `shutdown` 只停止接收新任务，已经入队的任务仍然会执行。
#[derive(Clone)]
pub struct SchedulerContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("name", &self.inner.config.executor.name)
            .field("min_delay", &self.inner.min_delay)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl SchedulerContext {
    /// 在当前 Tokio Runtime 上创建执行器
    ///
    /// 在 Runtime 之外调用会返回 `Config` 错误。
    pub fn configure(config: SchedulerConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            SchedulerError::Config(
                "SchedulerContext must be configured inside a Tokio runtime".to_string(),
            )
        })?;
        Ok(Self::configure_on(&handle, config))
    }

    /// 在指定的 Runtime 上创建执行器
    pub fn configure_on(handle: &Handle, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let terminated = CancellationToken::new();
        let metrics = Arc::new(ExecutorMetrics::default());
        let min_delay = config.min_delay();

        let executor = SerialExecutor {
            name: config.executor.name.clone(),
            rx,
            shutdown: shutdown.clone(),
            terminated: terminated.clone(),
            metrics: metrics.clone(),
        };
        handle.spawn(executor.run());
        debug!(
            "[Scheduler-{}] Configured with min delay {:?}.",
            config.executor.name, min_delay
        );

        Self {
            inner: Arc::new(ContextInner {
                tx,
                config,
                min_delay,
                accepting: AtomicBool::new(true),
                shutdown,
                terminated,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// 所有延时提交的下限
    pub fn min_delay(&self) -> Duration {
        self.inner.min_delay
    }

    pub fn metrics(&self) -> &ExecutorMetrics {
        &self.inner.metrics
    }

    /// 延时提交
    ///
    /// 实际延迟为 `max(delay, min_delay)`，并且不超过 `TimeUtils::MAX_DELAY`。
    /// 停机后返回 `SchedulerShutdown`；执行器已经不在了 (Runtime 被销毁) 返回 `ChannelClosed`。
    pub fn schedule<F>(&self, job: F, delay: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job), delay.max(self.inner.min_delay))
    }

    /// 以最小延迟提交 (Bridge 的轮询节奏)
    pub fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job), self.inner.min_delay)
    }

    /// 立即交给串行执行器
    ///
    /// 不是延时提交，不受 `min_delay` 限制。用于把在其他线程上完成的回调挪回串行上下文。
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job), Duration::ZERO)
    }

    fn submit(&self, job: Job, delay: Duration) -> Result<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            self.inner.metrics.inc_rejected();
            return Err(SchedulerError::SchedulerShutdown);
        }
        // 超出时间轮范围的 deadline 会让执行器任务 panic
        let delay = TimeUtils::capped_delay(delay);
        self.inner
            .tx
            .send(Submission { job, delay })
            .inspect_err(|_| self.inner.metrics.inc_rejected())?;
        self.inner.metrics.inc_submitted();
        Ok(())
    }

    /// 触发停机
    ///
    /// 重复调用是安全的。不会中断正在执行或已经入队的任务。
    pub fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            trace!("[Scheduler-{}] Shutdown triggered.", self.inner.config.executor.name);
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.accepting.load(Ordering::Acquire)
    }

    /// 等待执行器排空队列并退出
    pub async fn terminated(&self) {
        self.inner.terminated.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::{Instant, sleep};

    use super::*;

    fn ctx() -> SchedulerContext {
        SchedulerContext::configure(SchedulerConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_due_time_order() {
        let ctx = ctx();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [("slow", 30), ("fast", 10), ("mid", 20)] {
            let order = order.clone();
            ctx.schedule(move || order.lock().push(label), Duration::from_millis(ms))
                .unwrap();
        }

        sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock(), vec!["fast", "mid", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn min_delay_floors_every_delayed_submission() {
        let mut config = SchedulerConfig::default();
        config.executor.min_delay_ms = 5;
        let ctx = SchedulerContext::configure(config).unwrap();
        let ran_at = Arc::new(Mutex::new(None));

        let start = Instant::now();
        let slot = ran_at.clone();
        ctx.schedule(move || *slot.lock() = Some(Instant::now()), Duration::ZERO)
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        let ran_at = (*ran_at.lock()).expect("job should have run");
        assert!(ran_at - start >= Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_work_but_drains_queued_jobs() {
        let ctx = ctx();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        ctx.schedule(move || *flag.lock() = true, Duration::from_millis(20))
            .unwrap();

        ctx.shutdown();
        assert!(ctx.is_shutdown());
        let rejected = ctx.schedule(|| {}, Duration::from_millis(1));
        assert!(matches!(rejected, Err(SchedulerError::SchedulerShutdown)));

        ctx.terminated().await;
        assert!(*ran.lock());
        assert_eq!(ctx.metrics().rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_kill_the_executor() {
        let ctx = ctx();
        let ran = Arc::new(Mutex::new(false));
        ctx.enqueue(|| panic!("job exploded")).unwrap();
        let flag = ran.clone();
        ctx.schedule(move || *flag.lock() = true, Duration::from_millis(5))
            .unwrap();

        sleep(Duration::from_millis(10)).await;
        assert!(*ran.lock());
        assert_eq!(ctx.metrics().panicked(), 1);
        assert_eq!(ctx.metrics().executed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_year_delay_does_not_kill_the_executor() {
        let ctx = ctx();
        let three_years = Duration::from_secs(3 * 365 * 24 * 60 * 60);
        ctx.schedule(|| {}, three_years).unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        ctx.schedule(move || *flag.lock() = true, Duration::from_millis(1))
            .unwrap();

        sleep(Duration::from_millis(10)).await;
        assert!(*ran.lock());
        assert!(!ctx.is_shutdown());
        assert_eq!(ctx.metrics().panicked(), 0);
    }

    #[test]
    fn submissions_fail_once_the_executor_is_gone() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let ctx = SchedulerContext::configure_on(runtime.handle(), SchedulerConfig::default());
        // 执行器任务随 Runtime 一起被丢弃，接收端关闭
        drop(runtime);

        let err = ctx.schedule(|| {}, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, SchedulerError::ChannelClosed));
        assert!(!ctx.is_shutdown());
        assert_eq!(ctx.metrics().rejected(), 1);
    }

    #[test]
    fn configure_outside_runtime_is_a_config_error() {
        let err = SchedulerContext::configure(SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }
}
